pub mod dto;
mod device_event_service;
mod history_responder;
mod notification_producer;
mod reading_service;

pub use device_event_service::*;
pub use dto::device_id_partition_key;
pub use history_responder::*;
pub use notification_producer::*;
pub use reading_service::*;
