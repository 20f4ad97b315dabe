mod alerting;
mod device_directory;
mod history_service;
mod hourly_aggregator;

pub use alerting::*;
pub use device_directory::*;
pub use history_service::*;
pub use hourly_aggregator::*;
