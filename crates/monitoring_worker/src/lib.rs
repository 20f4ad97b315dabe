pub mod domain;
pub mod monitoring_worker;
pub mod nats;

pub use monitoring_worker::*;
