mod device;
mod device_event;
mod history;
mod hour_bucket;
mod hourly_aggregate;
mod notification;
mod reading;
mod result;

pub use device::*;
pub use device_event::*;
pub use history::*;
pub use hour_bucket::*;
pub use hourly_aggregate::*;
pub use notification::*;
pub use reading::*;
pub use result::*;
