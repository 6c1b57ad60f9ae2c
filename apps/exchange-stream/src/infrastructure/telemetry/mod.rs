//! Tracing Setup
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a fmt
//! layer. `RUST_LOG` wins over the configured default directives.
//!
//! # Usage
//!
//! ```ignore
//! use exchange_stream::infrastructure::telemetry;
//!
//! telemetry::init(&telemetry::TelemetryConfig::from_env())?;
//! tracing::info!("engine starting");
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Directives used when `RUST_LOG` is unset or invalid.
const DEFAULT_DIRECTIVES: &str = "exchange_stream=info,tungstenite=warn,tokio_tungstenite=warn";

/// Errors installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// A global subscriber is already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    pub default_directives: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Include the event target (module path).
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_directives: DEFAULT_DIRECTIVES.to_string(),
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// - `EXG_LOG_FORMAT`: `json` for JSON lines (default: text)
    #[must_use]
    pub fn from_env() -> Self {
        let json = std::env::var("EXG_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        Self {
            json,
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::try_new(&self.default_directives)
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
        })
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let registry = tracing_subscriber::registry().with(config.filter());

    if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_thread_ids(false);
        registry.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false);
        registry.with(fmt_layer).try_init()?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert!(!config.json);
        assert!(config.with_target);
        assert_eq!(config.default_directives, DEFAULT_DIRECTIVES);
    }

    #[test]
    fn invalid_directives_fall_back() {
        let config = TelemetryConfig {
            default_directives: "=[not a directive".to_string(),
            ..TelemetryConfig::default()
        };
        // Must not panic whatever RUST_LOG holds.
        let _ = config.filter();
    }
}
