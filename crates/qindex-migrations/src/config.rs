//! Migration configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Table that records applied migrations.
pub const MIGRATIONS_TABLE: &str = "_qindex_migrations";

/// Configuration for the migrator and its pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Connection pool ceiling.
    pub max_connections: u32,
    /// Connection acquire timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Run each migration inside a transaction.
    pub use_transactions: bool,
    /// Verify stored checksums against the shipped SQL.
    pub verify_checksums: bool,
}

impl MigrationConfig {
    /// Create a configuration for a database URL with defaults.
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
            use_transactions: true,
            verify_checksums: true,
        }
    }

    /// Set the pool ceiling.
    #[must_use]
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Toggle transactional migration execution.
    #[must_use]
    pub fn with_transactions(mut self, use_transactions: bool) -> Self {
        self.use_transactions = use_transactions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MigrationConfig::new("postgres://localhost/app");
        assert_eq!(config.max_connections, 5);
        assert!(config.use_transactions);
        assert!(config.verify_checksums);
    }

    #[test]
    fn test_config_builders() {
        let config = MigrationConfig::new("postgres://localhost/app")
            .with_max_connections(20)
            .with_transactions(false);
        assert_eq!(config.max_connections, 20);
        assert!(!config.use_transactions);
    }
}
