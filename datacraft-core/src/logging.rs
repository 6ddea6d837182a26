//! Logging configuration helpers for the pipeline engine.
//!
//! The engine itself only emits `tracing` events with structured fields;
//! subscriber installation is left to the embedding process. These helpers
//! cover the common setups used by binaries and integration tests.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration for pipeline components.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level for engine components.
    pub base_level: Level,
    /// Whether to log per-rule evaluation details.
    pub log_rule_details: bool,
    /// Whether to log table store reads and writes.
    pub log_store_operations: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_level: Level::INFO,
            log_rule_details: false,
            log_store_operations: true,
        }
    }
}

impl LogConfig {
    /// Verbose configuration suitable for debugging a single dataset run.
    pub fn verbose() -> Self {
        Self {
            base_level: Level::DEBUG,
            log_rule_details: true,
            log_store_operations: true,
        }
    }

    /// Minimal configuration for production with the lowest overhead.
    pub fn production() -> Self {
        Self {
            base_level: Level::WARN,
            log_rule_details: false,
            log_store_operations: false,
        }
    }
}

/// Installs a plain-text subscriber from a [`LogConfig`].
pub fn init_with(config: &LogConfig) {
    init(config.base_level);
}

/// Installs a plain-text subscriber honoring `RUST_LOG`, falling back to the
/// given level. Safe to call more than once; later calls are no-ops.
pub fn init(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Installs a JSON subscriber for structured log shipping.
pub fn init_json(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_info() {
        let config = LogConfig::default();
        assert_eq!(config.base_level, Level::INFO);
        assert!(!config.log_rule_details);
    }

    #[test]
    fn init_is_idempotent() {
        init_with(&LogConfig::verbose());
        init(Level::INFO);
    }
}
