pub mod domain;
pub mod garde;
pub mod memory;
pub mod nats;
pub mod postgres;
pub mod telemetry;

pub use nats::NatsClient;
pub use postgres::PostgresClient;

#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceRecordRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockHourlyAggregateRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockNotificationProducer;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockRawReadingRepository;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockJetStreamConsumer;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockJetStreamPublisher;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockPullConsumer;
