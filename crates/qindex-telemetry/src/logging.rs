//! Logging initialization.
//!
//! Structured `tracing` output with an `EnvFilter`, plain or JSON
//! formatting. Debug toggles (`OM_INDEXER_VERBOSE`, `OM_SEARCH_DEBUG`,
//! `QUERY_ENGINE_DEBUG_SQL`) gate extra output, never behavior.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG`/`LOG_LEVEL` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default level.
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Enable JSON output.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

/// Logging initialization error.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A global subscriber was already installed.
    #[error("Failed to initialize logging: {0}")]
    Init(String),
}

/// Initialize the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_filter(filter))
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_filter(filter))
            .try_init()
            .map_err(|e| LoggingError::Init(e.to_string()))?;
    }

    Ok(())
}

/// Whether verbose indexer logging is requested via `OM_INDEXER_VERBOSE`.
#[must_use]
pub fn indexer_verbose() -> bool {
    env_flag("OM_INDEXER_VERBOSE")
}

/// Whether generated SQL should be logged, via `QUERY_ENGINE_DEBUG_SQL`
/// or `OM_SEARCH_DEBUG`.
#[must_use]
pub fn debug_sql_enabled() -> bool {
    env_flag("QUERY_ENGINE_DEBUG_SQL") || env_flag("OM_SEARCH_DEBUG")
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = LoggingConfig::new().with_level("debug").with_json(true);
        assert_eq!(config.level, "debug");
        assert!(config.json);
    }

    #[test]
    fn test_env_flags_default_off() {
        assert!(!env_flag("QINDEX_TEST_UNSET_FLAG"));
    }
}
