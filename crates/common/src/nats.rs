mod client;
mod dead_letter;
mod middleware;
mod partitioned_consumer;
mod trace_context;
mod traits;

pub use client::*;
pub use dead_letter::*;
pub use middleware::*;
pub use partitioned_consumer::*;
pub use trace_context::*;
pub use traits::*;
