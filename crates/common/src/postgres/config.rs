use serde::{Deserialize, Serialize};

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_pool_size: usize,
    pub pool_timeout_ms: u64,
    pub migrations_dir: String,
    pub goose_binary_path: String,
}

impl PostgresConfig {
    /// DSN in the form goose expects
    pub fn goose_dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode=disable",
            self.username, self.password, self.host, self.port, self.database
        )
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "meterline".to_string(),
            username: "meterline".to_string(),
            password: "meterline".to_string(),
            max_pool_size: 10,
            pool_timeout_ms: 5_000,
            migrations_dir: "crates/common/migrations/postgres".to_string(),
            goose_binary_path: "goose".to_string(),
        }
    }
}
