use anyhow::{bail, Context};
use common::domain::DeviceRecord;
use common::postgres::PostgresConfig;
use ::config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Where devices, readings and aggregates are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    /// Process-local; everything is lost on restart
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Stdout log rendering: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: String,

    // NATS configuration
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Startup timeout for connecting and creating streams, in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_readings_stream")]
    pub readings_stream: String,

    #[serde(default = "default_readings_subject_filter")]
    pub readings_subject_filter: String,

    #[serde(default = "default_readings_consumer_name")]
    pub readings_consumer_name: String,

    #[serde(default = "default_device_events_stream")]
    pub device_events_stream: String,

    #[serde(default = "default_device_events_subject_filter")]
    pub device_events_subject_filter: String,

    #[serde(default = "default_device_events_consumer_name")]
    pub device_events_consumer_name: String,

    /// Stream receiving messages that can never be processed
    #[serde(default = "default_dead_letter_stream")]
    pub dead_letter_stream: String,

    /// Notifications go to `{prefix}.{owner_id}`; also the notification stream name
    #[serde(default = "default_notification_subject_prefix")]
    pub notification_subject_prefix: String,

    /// Core NATS subject answering history queries
    #[serde(default = "default_history_subject")]
    pub history_subject: String,

    #[serde(default = "default_history_queue_group")]
    pub history_queue_group: String,

    /// Batch size for consumers
    #[serde(default = "default_nats_batch_size")]
    pub nats_batch_size: usize,

    /// Max wait time for batches in seconds
    #[serde(default = "default_nats_batch_wait_secs")]
    pub nats_batch_wait_secs: u64,

    // Processing
    /// Reading partitions processed in parallel
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Redelivery delay for nak'd messages
    #[serde(default = "default_nak_delay_ms")]
    pub nak_delay_ms: u64,

    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    /// Consecutive failed batches before a consumer stops the service
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Attempts per message, including the first, before it is nak'd
    #[serde(default = "default_message_max_attempts")]
    pub message_max_attempts: u32,

    #[serde(default = "default_message_retry_delay_ms")]
    pub message_retry_delay_ms: u64,

    // Alerting
    #[serde(default = "default_alert_queue_capacity")]
    pub alert_queue_capacity: usize,

    #[serde(default = "default_alert_max_attempts")]
    pub alert_max_attempts: u32,

    #[serde(default = "default_alert_retry_delay_ms")]
    pub alert_retry_delay_ms: u64,

    /// Devices inserted at startup when absent, as
    /// `device_id:owner_id:threshold` separated by commas
    #[serde(default)]
    pub seed_devices: String,

    // Storage
    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_max_pool_size")]
    pub postgres_max_pool_size: usize,

    /// Pool wait, create and recycle timeout
    #[serde(default = "default_postgres_pool_timeout_ms")]
    pub postgres_pool_timeout_ms: u64,

    #[serde(default = "default_postgres_migrations_dir")]
    pub postgres_migrations_dir: String,

    #[serde(default = "default_postgres_goose_binary_path")]
    pub postgres_goose_binary_path: String,

    // OpenTelemetry configuration
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_readings_stream() -> String {
    "meter_readings".to_string()
}

fn default_readings_subject_filter() -> String {
    "meter_readings.>".to_string()
}

fn default_readings_consumer_name() -> String {
    "meterline-readings".to_string()
}

fn default_device_events_stream() -> String {
    "device_events".to_string()
}

fn default_device_events_subject_filter() -> String {
    "device_events.>".to_string()
}

fn default_device_events_consumer_name() -> String {
    "meterline-device-events".to_string()
}

fn default_dead_letter_stream() -> String {
    "dead_letters".to_string()
}

fn default_notification_subject_prefix() -> String {
    "notifications".to_string()
}

fn default_history_subject() -> String {
    "meterline.history".to_string()
}

fn default_history_queue_group() -> String {
    "meterline-history".to_string()
}

fn default_nats_batch_size() -> usize {
    64
}

fn default_nats_batch_wait_secs() -> u64 {
    5
}

fn default_worker_count() -> usize {
    8
}

fn default_processing_timeout_ms() -> u64 {
    10_000
}

fn default_nak_delay_ms() -> u64 {
    1_000
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_max_consecutive_failures() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

fn default_message_max_attempts() -> u32 {
    3
}

fn default_message_retry_delay_ms() -> u64 {
    200
}

fn default_alert_queue_capacity() -> usize {
    1_024
}

fn default_alert_max_attempts() -> u32 {
    3
}

fn default_alert_retry_delay_ms() -> u64 {
    500
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Postgres
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "meterline".to_string()
}

fn default_postgres_username() -> String {
    "meterline".to_string()
}

fn default_postgres_password() -> String {
    "meterline".to_string()
}

fn default_postgres_max_pool_size() -> usize {
    10
}

fn default_postgres_pool_timeout_ms() -> u64 {
    5_000
}

fn default_postgres_migrations_dir() -> String {
    "/home/meterline/migrations/postgres".to_string()
}

fn default_postgres_goose_binary_path() -> String {
    "goose".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "meterline".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("METERLINE"))
            .build()?
            .try_deserialize()
    }

    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            host: self.postgres_host.clone(),
            port: self.postgres_port,
            database: self.postgres_database.clone(),
            username: self.postgres_username.clone(),
            password: self.postgres_password.clone(),
            max_pool_size: self.postgres_max_pool_size,
            pool_timeout_ms: self.postgres_pool_timeout_ms,
            migrations_dir: self.postgres_migrations_dir.clone(),
            goose_binary_path: self.postgres_goose_binary_path.clone(),
        }
    }

    /// Parse `seed_devices`. Thresholds are range-checked when seeding.
    pub fn seed_devices(&self) -> anyhow::Result<Vec<DeviceRecord>> {
        self.seed_devices
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
                let [device_id, owner_id, threshold] = parts.as_slice() else {
                    bail!("seed device '{entry}' is not device_id:owner_id:threshold");
                };
                let hourly_threshold = threshold
                    .parse::<f64>()
                    .with_context(|| format!("seed device '{entry}' has an invalid threshold"))?;
                Ok(DeviceRecord {
                    device_id: device_id.to_string(),
                    owner_id: owner_id.to_string(),
                    hourly_threshold,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("METERLINE_LOG_LEVEL");
            std::env::remove_var("METERLINE_WORKER_COUNT");
            std::env::remove_var("METERLINE_STORAGE_BACKEND");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.message_max_attempts, 3);
        assert_eq!(config.readings_subject_filter, "meter_readings.>");
        assert_eq!(config.storage_backend, StorageBackend::Postgres);
        assert!(config.seed_devices().unwrap().is_empty());
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::set_var("METERLINE_LOG_LEVEL", "debug");
            std::env::set_var("METERLINE_WORKER_COUNT", "3");
            std::env::set_var("METERLINE_STORAGE_BACKEND", "memory");
        }

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.storage_backend, StorageBackend::Memory);

        // SAFETY: Test runs with mutex lock to prevent concurrent env access
        unsafe {
            std::env::remove_var("METERLINE_LOG_LEVEL");
            std::env::remove_var("METERLINE_WORKER_COUNT");
            std::env::remove_var("METERLINE_STORAGE_BACKEND");
        }
    }

    #[test]
    fn test_seed_devices_parsing() {
        let _lock = TEST_LOCK.lock().unwrap();
        let mut config = ServiceConfig::from_env().unwrap();

        config.seed_devices = "meter-1:owner-1:10, meter-2:owner-2:121.5,".to_string();
        let seeds = config.seed_devices().unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[1].owner_id, "owner-2");
        assert_eq!(seeds[1].hourly_threshold, 121.5);

        config.seed_devices = "meter-1:owner-1".to_string();
        assert!(config.seed_devices().is_err());

        config.seed_devices = "meter-1:owner-1:lots".to_string();
        assert!(config.seed_devices().is_err());
    }
}
