//! In-memory repository implementations.
//!
//! Used by the `memory` storage backend and by scenario tests. They honour the
//! same uniqueness rules as the PostgreSQL repositories.

mod device_record_repository;
mod hourly_aggregate_repository;
mod raw_reading_repository;

pub use device_record_repository::*;
pub use hourly_aggregate_repository::*;
pub use raw_reading_repository::*;
