mod consumer_logging;
mod consumer_tracing;
mod consumer_types;
mod publish_tracing;
mod publisher;
mod types;

pub use consumer_logging::*;
pub use consumer_tracing::*;
pub use consumer_types::*;
pub use publish_tracing::*;
pub use publisher::*;
pub use types::*;
