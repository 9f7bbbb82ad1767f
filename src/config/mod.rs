//! Configuration system using Figment and YAML topology files.
//!
//! Configuration is split over four files in one configuration directory:
//!
//! 1. `app.toml` (application, orchestrator, storage and retry settings), merged with
//!    environment variables prefixed `XYSCAN_` (`__` separates nesting levels)
//! 2. `config_main.yaml`: static bench topology, see [`topology`]
//! 3. `settings_ui.yaml`: snapshot of the user's settings, see [`settings_ui`]
//! 4. `statemachine.yaml` (optional): transition table, see
//!    [`crate::orchestrator::state`]
//!
//! # Environment Variable Overrides
//!
//! ```text
//! XYSCAN_APPLICATION__LOG_LEVEL=debug
//! XYSCAN_ORCHESTRATOR__POLLTIME=50ms
//! XYSCAN_STORAGE__BACKEND=netcdf
//! ```

pub mod settings_ui;
pub mod topology;

use crate::data::StorageBackend;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::orchestrator::state::TransitionTable;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub use settings_ui::UiSettings;
pub use topology::Topology;

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Locations of the YAML files, relative to the configuration directory
    #[serde(default)]
    pub paths: PathsConfig,
    /// Orchestrator timing
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Dataset output
    #[serde(default)]
    pub storage: StorageConfig,
    /// Position readback retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of the human-readable format
    #[serde(default)]
    pub log_json: bool,
}

/// Locations of the YAML configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_config_main")]
    pub config_main: PathBuf,
    #[serde(default = "default_settings_ui")]
    pub settings_ui: PathBuf,
    /// Built-in table when absent
    #[serde(default)]
    pub state_machine: Option<PathBuf>,
}

/// Orchestrator timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Alignment poll cadence
    #[serde(default = "default_polltime", with = "humantime_serde")]
    pub polltime: Duration,
    /// Per-instrument communication timeout
    #[serde(default = "default_instrument_timeout", with = "humantime_serde")]
    pub instrument_timeout: Duration,
    /// Where the stage parks during a calibration run (mm)
    #[serde(default)]
    pub calibration_park_position: [f64; 2],
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Dataset backend (json, netcdf, memory)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Output directory for datasets and calibration tables
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_config_main() -> PathBuf {
    PathBuf::from("config_main.yaml")
}

fn default_settings_ui() -> PathBuf {
    PathBuf::from("settings_ui.yaml")
}

fn default_polltime() -> Duration {
    Duration::from_millis(100)
}

fn default_instrument_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_backend() -> String {
    "json".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "xyscan".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_main: default_config_main(),
            settings_ui: default_settings_ui(),
            state_machine: None,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            polltime: default_polltime(),
            instrument_timeout: default_instrument_timeout(),
            calibration_park_position: [0.0, 0.0],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            paths: PathsConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            storage: StorageConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load configuration from `path` and environment variables.
    ///
    /// Precedence (highest to lowest): `XYSCAN_` environment variables, the TOML file,
    /// built-in defaults. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("XYSCAN_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.storage_backend()?;

        if self.orchestrator.polltime.is_zero() {
            return Err(DaqError::Configuration(
                "orchestrator.polltime must be greater than zero".to_string(),
            ));
        }
        if self.orchestrator.instrument_timeout.is_zero() {
            return Err(DaqError::Configuration(
                "orchestrator.instrument_timeout must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(DaqError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(DaqError::Configuration(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    /// Parsed storage backend.
    pub fn storage_backend(&self) -> AppResult<StorageBackend> {
        self.storage.backend.parse()
    }
}

/// Everything loaded from one configuration directory.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub config_dir: PathBuf,
    pub app: AppConfig,
    pub topology: Topology,
    pub ui: UiSettings,
    pub transitions: TransitionTable,
}

impl BenchConfig {
    /// Load and validate all configuration files from `config_dir`.
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let app = AppConfig::load_from(config_dir.join("app.toml"))?;
        let topology = Topology::load(&config_dir.join(&app.paths.config_main))?;
        let ui = UiSettings::load(&config_dir.join(&app.paths.settings_ui))?;
        let transitions = match &app.paths.state_machine {
            Some(path) => TransitionTable::load(&config_dir.join(path))?,
            None => TransitionTable::builtin()?,
        };
        info!(
            config_dir = %config_dir.display(),
            substrates = topology.substrates.len(),
            transitions = transitions.len(),
            "Configuration loaded"
        );
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            app,
            topology,
            ui,
            transitions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.polltime, Duration::from_millis(100));
        assert_eq!(config.orchestrator.instrument_timeout, Duration::from_secs(60));
        assert_eq!(config.storage_backend().unwrap(), StorageBackend::Json);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.backend = "hdf5".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.orchestrator.polltime = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(
            &path,
            r#"
[application]
name = "bench"
log_level = "debug"

[orchestrator]
polltime = "250ms"
instrument_timeout = "5s"
calibration_park_position = [1.0, 2.0]

[storage]
backend = "memory"
output_dir = "/tmp/out"
"#,
        )
        .unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.orchestrator.polltime, Duration::from_millis(250));
        assert_eq!(config.orchestrator.calibration_park_position, [1.0, 2.0]);
        assert_eq!(config.storage_backend().unwrap(), StorageBackend::Memory);
        assert_eq!(config.retry, RetryPolicy::default());
    }
}
