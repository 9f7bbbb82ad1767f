//! Tracing setup for the `xyscan` binary.
//!
//! Structured logging with `tracing` and `tracing-subscriber`: a human-readable compact
//! format for the bench PC, JSON lines when logs are shipped elsewhere. `RUST_LOG`
//! overrides the configured level.
//!
//! ```no_run
//! use xyscan_daq::logging::{self, LogFormat, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! logging::init(LoggingConfig::from_level("debug")?.with_format(LogFormat::Json))?;
//! tracing::info!(experiment = "decay", "Run started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact single-line format with colors.
    Compact,
    /// One JSON object per line.
    Json,
}

/// Tracing options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Include source file and line.
    pub with_file_and_line: bool,
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options for a textual level (`trace` .. `error`).
    pub fn from_level(level: &str) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(level)?,
            ..Default::default()
        })
    }

    /// Options from the `[application]` section.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        let format = if config.application.log_json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        };
        Ok(Self::from_level(&config.application.log_level)?.with_format(format))
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber.
///
/// Calling it again after a subscriber is installed is not an error, so tests and the
/// binary can both call it.
pub fn init(config: LoggingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let layer = match config.format {
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {}",
            e
        ))),
    }
}

/// Parse a log level name.
fn parse_log_level(level: &str) -> AppResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(DaqError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_format_from_app_config() {
        let mut app = AppConfig::default();
        app.application.log_json = true;
        app.application.log_level = "trace".into();
        let config = LoggingConfig::from_app_config(&app).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, Level::TRACE);
    }

    #[test]
    fn test_init_twice_is_ok() {
        init(LoggingConfig::default().with_ansi(false)).unwrap();
        init(LoggingConfig::default().with_ansi(false)).unwrap();
    }
}
