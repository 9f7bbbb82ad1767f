//! Custom error types for the orchestrator.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of failure the bench distinguishes, from configuration problems to
//! instrument timeouts and dataset I/O.
//!
//! ## Error Hierarchy
//!
//! - **`Config` / `Yaml` / `Configuration`**: loading and semantic validation of the
//!   application, topology, UI-settings and state-machine files.
//! - **`InvalidInput`**: user input that cannot be expanded into a schedule (for example
//!   edge offsets that leave no usable span). Aborts `parsing configuration`.
//! - **`ConnectionFailed`**: a driver could not be opened. Aborts `connecting`.
//! - **`Timeout`**: an instrument did not answer within its communication timeout.
//!   Fatal to the current run.
//! - **`Instrument`**: any other driver-level failure.
//! - **`RetryExhausted`**: a locally retried operation (position readback) ran out of
//!   attempts and escalates to `measurement_aborted`.
//! - **`Dataset` / `Io` / `Csv`**: output file failures.
//! - **`FeatureNotEnabled`**: a storage backend was requested that was not compiled in.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling with the `?` operator.

use crate::core::InstrumentName;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid user input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to connect to {instrument}: {reason}")]
    ConnectionFailed {
        instrument: InstrumentName,
        reason: String,
    },

    #[error("{instrument} timed out after {seconds:.1} s during {operation}")]
    Timeout {
        instrument: InstrumentName,
        operation: String,
        seconds: f64,
    },

    #[error("Instrument error ({instrument}): {reason}")]
    Instrument {
        instrument: InstrumentName,
        reason: String,
    },

    #[error("{instrument} does not support '{command}'")]
    UnsupportedCommand {
        instrument: InstrumentName,
        command: String,
    },

    #[error("Instrument {0} is not part of the current experiment")]
    InstrumentMissing(InstrumentName),

    #[error("Instrument worker for {0} has stopped")]
    WorkerGone(InstrumentName),

    #[error("Gave up on {operation} after {attempts} attempts: {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Unknown barrier signal '{signal}' for barrier '{barrier}'")]
    UnknownSignal { barrier: String, signal: String },

    #[error("No experiment selected")]
    NoExperiment,

    #[error("Orchestrator has shut down")]
    OrchestratorGone,

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Shorthand for an instrument-level failure.
    pub fn instrument(instrument: InstrumentName, reason: impl Into<String>) -> Self {
        DaqError::Instrument {
            instrument,
            reason: reason.into(),
        }
    }

    /// True for communication timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DaqError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::instrument(InstrumentName::Laser, "shutter interlock open");
        assert_eq!(
            err.to_string(),
            "Instrument error (laser): shutter interlock open"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = DaqError::Timeout {
            instrument: InstrumentName::Spectrometer,
            operation: "measure".into(),
            seconds: 60.0,
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "spectrometer timed out after 60.0 s during measure"
        );
    }

    #[test]
    fn test_feature_not_enabled_message() {
        let err = DaqError::FeatureNotEnabled("storage_netcdf".into());
        assert!(err.to_string().contains("--features storage_netcdf"));
    }
}
