mod client;
mod config;
mod device_record_repository;
mod hourly_aggregate_repository;
mod raw_reading_repository;

pub use client::*;
pub use config::*;
pub use device_record_repository::*;
pub use hourly_aggregate_repository::*;
pub use raw_reading_repository::*;
