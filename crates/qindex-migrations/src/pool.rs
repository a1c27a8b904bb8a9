//! Database connection pool management.
//!
//! One [`IndexPool`] is shared by every component of the subsystem: the
//! indexer, the coverage accountant, the planner, and the workers. The
//! reindexer bounds its usage by issuing at most one query per
//! partition-task at a time.

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Shared PostgreSQL connection pool.
#[derive(Clone)]
pub struct IndexPool {
    pool: PgPool,
    max_connections: u32,
}

impl IndexPool {
    /// Connect a new pool.
    pub async fn connect(config: &MigrationConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            max_connections: config.max_connections,
        })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pg_pool(pool: PgPool) -> Self {
        Self {
            max_connections: pool.options().get_max_connections(),
            pool,
        }
    }

    /// Get a reference to the underlying pool.
    #[must_use]
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_connections: self.max_connections,
        }
    }

    /// Test the connection.
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for IndexPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexPool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Current number of connections.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum connections allowed.
    pub max_connections: u32,
}

impl PoolStats {
    /// Get the number of active connections.
    #[must_use]
    pub fn active(&self) -> usize {
        self.size as usize - self.idle
    }

    /// Get the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            return 0.0;
        }
        (self.active() as f64 / self.max_connections as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats {
            size: 5,
            idle: 3,
            max_connections: 10,
        };
        assert_eq!(stats.active(), 2);
        assert!((stats.utilization() - 20.0).abs() < 0.01);
    }

    #[test]
    fn test_pool_stats_zero_max() {
        let stats = PoolStats {
            size: 0,
            idle: 0,
            max_connections: 0,
        };
        assert_eq!(stats.utilization(), 0.0);
    }
}
