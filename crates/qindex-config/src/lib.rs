//! # Query Index Config
//!
//! Environment-driven tunables for the query-index subsystem.
//!
//! Every knob has a default matching the documented contract; the
//! environment only overrides. Durations are read as millisecond values
//! from `*_MS` variables.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Tunables consumed by the planner, the coverage accountant, and the
/// event handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QindexConfig {
    /// Planner-side TTL for cached coverage snapshots.
    #[serde(with = "humantime_serde")]
    pub coverage_cache_ttl: Duration,
    /// TTL for the active custom-field key cache.
    #[serde(with = "humantime_serde")]
    pub cf_keys_cache_ttl: Duration,
    /// Age past which a coverage snapshot is stale and must schedule a
    /// refresh.
    #[serde(with = "humantime_serde")]
    pub coverage_stale_after: Duration,
    /// Age past which an unfinished job's heartbeat marks it stalled.
    #[serde(with = "humantime_serde")]
    pub heartbeat_stale_after: Duration,
    /// Minimum spacing between coverage resets/refreshes for one scope.
    #[serde(with = "humantime_serde")]
    pub coverage_refresh_throttle: Duration,
    /// Use the index despite partial coverage, returning a warning, instead
    /// of falling back to the base-only engine.
    pub force_partial_index: bool,
    /// Schedule an automatic reindex when partial coverage is detected.
    pub schedule_auto_reindex: bool,
    /// Trust cached coverage stats on the read path; when false the planner
    /// may force a refresh on read.
    pub optimize_coverage_stats: bool,
    /// Rows per reindex scan chunk.
    pub reindex_batch_size: u32,
    /// Partition count used by the multi-partition reindex convention.
    pub reindex_partition_count: u32,
    /// Store raw tokens beside their hashes in `search_tokens`.
    pub store_raw_tokens: bool,
    /// Field names excluded from token extraction in addition to the
    /// built-in rules.
    pub token_field_blocklist: Vec<String>,
}

impl Default for QindexConfig {
    fn default() -> Self {
        Self {
            coverage_cache_ttl: Duration::from_millis(300_000),
            cf_keys_cache_ttl: Duration::from_millis(300_000),
            coverage_stale_after: Duration::from_millis(60_000),
            heartbeat_stale_after: Duration::from_millis(60_000),
            coverage_refresh_throttle: Duration::from_millis(300_000),
            force_partial_index: true,
            schedule_auto_reindex: true,
            optimize_coverage_stats: false,
            reindex_batch_size: 500,
            reindex_partition_count: 5,
            store_raw_tokens: true,
            token_field_blocklist: Vec::new(),
        }
    }
}

impl QindexConfig {
    /// Load the configuration from the environment, falling back to
    /// defaults for unset or unparsable variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            coverage_cache_ttl: env_duration_ms(
                "QUERY_INDEX_COVERAGE_CACHE_MS",
                defaults.coverage_cache_ttl,
            ),
            cf_keys_cache_ttl: env_duration_ms(
                "QUERY_INDEX_CF_KEYS_CACHE_MS",
                defaults.cf_keys_cache_ttl,
            ),
            coverage_stale_after: env_duration_ms(
                "COVERAGE_STALE_MS",
                defaults.coverage_stale_after,
            ),
            heartbeat_stale_after: env_duration_ms(
                "HEARTBEAT_STALE_MS",
                defaults.heartbeat_stale_after,
            ),
            coverage_refresh_throttle: env_duration_ms(
                "COVERAGE_REFRESH_THROTTLE_MS",
                defaults.coverage_refresh_throttle,
            ),
            force_partial_index: env_bool(
                "FORCE_QUERY_INDEX_ON_PARTIAL_INDEXES",
                defaults.force_partial_index,
            ),
            schedule_auto_reindex: env_bool(
                "SCHEDULE_AUTO_REINDEX",
                defaults.schedule_auto_reindex,
            ),
            optimize_coverage_stats: env_bool(
                "OPTIMIZE_INDEX_COVERAGE_STATS",
                defaults.optimize_coverage_stats,
            ),
            reindex_batch_size: env_parse("QUERY_INDEX_BATCH_SIZE", defaults.reindex_batch_size),
            reindex_partition_count: env_parse(
                "QUERY_INDEX_PARTITION_COUNT",
                defaults.reindex_partition_count,
            ),
            store_raw_tokens: env_bool("QUERY_INDEX_STORE_RAW_TOKENS", defaults.store_raw_tokens),
            token_field_blocklist: env_list("QUERY_INDEX_TOKEN_FIELD_BLOCKLIST"),
        }
    }

    /// Builder-style override for the partial-index policy.
    #[must_use]
    pub fn with_force_partial_index(mut self, force: bool) -> Self {
        self.force_partial_index = force;
        self
    }

    /// Builder-style override for auto-reindex scheduling.
    #[must_use]
    pub fn with_schedule_auto_reindex(mut self, schedule: bool) -> Self {
        self.schedule_auto_reindex = schedule;
        self
    }

    /// Builder-style override for the reindex chunk size.
    #[must_use]
    pub fn with_reindex_batch_size(mut self, batch_size: u32) -> Self {
        self.reindex_batch_size = batch_size.max(1);
        self
    }

    /// Builder-style override for the coverage staleness clock.
    #[must_use]
    pub fn with_coverage_stale_after(mut self, age: Duration) -> Self {
        self.coverage_stale_after = age;
        self
    }
}

/// Worker-process settings that sit outside the shared tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// PostgreSQL connection string.
    pub database_url: String,
    /// Connection pool ceiling.
    pub max_connections: u32,
    /// Tenant warmed up on startup, if any.
    pub warmup_tenant_id: Option<String>,
}

impl WorkerConfig {
    /// Load worker settings from the environment.
    ///
    /// Returns `None` when `DATABASE_URL` is unset, which callers should
    /// treat as a fatal startup error.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        Some(Self {
            database_url,
            max_connections: env_parse("QUERY_INDEX_MAX_CONNECTIONS", 10),
            warmup_tenant_id: std::env::var("QUERY_INDEX_WARMUP_TENANT").ok(),
        })
    }
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparsable duration override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %raw, "Ignoring unparsable boolean override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = QindexConfig::default();
        assert_eq!(config.coverage_cache_ttl, Duration::from_millis(300_000));
        assert_eq!(config.cf_keys_cache_ttl, Duration::from_millis(300_000));
        assert_eq!(config.coverage_stale_after, Duration::from_millis(60_000));
        assert_eq!(config.heartbeat_stale_after, Duration::from_millis(60_000));
        assert_eq!(
            config.coverage_refresh_throttle,
            Duration::from_millis(300_000)
        );
        assert!(config.force_partial_index);
        assert!(config.schedule_auto_reindex);
        assert!(!config.optimize_coverage_stats);
        assert_eq!(config.reindex_batch_size, 500);
        assert_eq!(config.reindex_partition_count, 5);
    }

    #[test]
    fn test_builder_overrides() {
        let config = QindexConfig::default()
            .with_force_partial_index(false)
            .with_schedule_auto_reindex(false)
            .with_reindex_batch_size(0);
        assert!(!config.force_partial_index);
        assert!(!config.schedule_auto_reindex);
        // A zero batch size would stall the scan loop.
        assert_eq!(config.reindex_batch_size, 1);
    }

    #[test]
    fn test_env_bool_parsing() {
        assert!(env_bool("QINDEX_TEST_UNSET_BOOL", true));
        assert!(!env_bool("QINDEX_TEST_UNSET_BOOL_2", false));
    }

    #[test]
    fn test_env_list_default_empty() {
        assert!(env_list("QINDEX_TEST_UNSET_LIST").is_empty());
    }
}
