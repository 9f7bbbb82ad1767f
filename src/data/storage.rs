//! Dataset backend selection with clean feature flag handling.

use crate::data::dataset::{DatasetStore, MemoryStore};
#[cfg(feature = "storage_netcdf")]
use crate::data::netcdf_store::NetcdfStore;
use crate::error::{AppResult, DaqError};
use crate::experiment::ExperimentKind;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Configured dataset backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory dataset written as JSON on close.
    Json,
    /// NetCDF-4 file (feature `storage_netcdf`).
    Netcdf,
    /// In-memory only, nothing touches the disk.
    Memory,
}

impl StorageBackend {
    /// File extension of the produced dataset.
    pub fn extension(&self) -> &'static str {
        match self {
            StorageBackend::Netcdf => "nc",
            StorageBackend::Json | StorageBackend::Memory => "json",
        }
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageBackend::Json => "json",
            StorageBackend::Netcdf => "netcdf",
            StorageBackend::Memory => "memory",
        })
    }
}

impl FromStr for StorageBackend {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(StorageBackend::Json),
            "netcdf" => Ok(StorageBackend::Netcdf),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(DaqError::Configuration(format!(
                "Invalid storage backend '{}'. Must be one of: json, netcdf, memory",
                other
            ))),
        }
    }
}

/// `{sample}_{experiment}_{YYMMDDHHMM}.{ext}`
pub fn dataset_file_name(
    sample: &str,
    experiment: ExperimentKind,
    at: DateTime<Local>,
    extension: &str,
) -> String {
    let sample = if sample.trim().is_empty() {
        "sample"
    } else {
        sample.trim()
    };
    format!(
        "{}_{}_{}.{}",
        sample.replace(['/', '\\', ' '], "-"),
        experiment,
        at.format("%y%m%d%H%M"),
        extension
    )
}

/// Opens one dataset per run.
pub trait StoreFactory: Send + Sync {
    /// Extension used for output file names.
    fn extension(&self) -> &'static str;

    /// Open a fresh dataset at `path`.
    fn open(&self, path: &Path) -> AppResult<Box<dyn DatasetStore>>;
}

/// Factory for the configured backend.
#[derive(Clone, Debug)]
pub struct BackendFactory {
    backend: StorageBackend,
}

impl BackendFactory {
    /// Factory for `backend`.
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }
}

impl StoreFactory for BackendFactory {
    fn extension(&self) -> &'static str {
        self.backend.extension()
    }

    fn open(&self, path: &Path) -> AppResult<Box<dyn DatasetStore>> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        info!(backend = %self.backend, path = %path.display(), "Opening dataset");
        match self.backend {
            StorageBackend::Json => Ok(Box::new(MemoryStore::persisted(path))),
            StorageBackend::Memory => Ok(Box::new(MemoryStore::new())),
            #[cfg(feature = "storage_netcdf")]
            StorageBackend::Netcdf => Ok(Box::new(NetcdfStore::create(path)?)),
            #[cfg(not(feature = "storage_netcdf"))]
            StorageBackend::Netcdf => Err(DaqError::FeatureNotEnabled("storage_netcdf".to_string())),
        }
    }
}

/// In-memory factory that keeps a handle to every store it opened.
#[derive(Clone, Debug, Default)]
pub struct MemoryFactory {
    opened: Arc<Mutex<Vec<(PathBuf, MemoryStore)>>>,
}

impl MemoryFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores opened so far, oldest first.
    pub fn stores(&self) -> Vec<(PathBuf, MemoryStore)> {
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Most recently opened store.
    pub fn last(&self) -> Option<MemoryStore> {
        self.stores().pop().map(|(_, store)| store)
    }
}

impl StoreFactory for MemoryFactory {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn open(&self, path: &Path) -> AppResult<Box<dyn DatasetStore>> {
        let store = MemoryStore::new();
        self.opened
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((path.to_path_buf(), store.clone()));
        Ok(Box::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name_pattern() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 0).unwrap();
        assert_eq!(
            dataset_file_name("quartz", ExperimentKind::Transmission, at, "nc"),
            "quartz_transmission_2403071405.nc"
        );
        assert_eq!(
            dataset_file_name(" ", ExperimentKind::Decay, at, "json"),
            "sample_decay_2403071405.json"
        );
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("json".parse::<StorageBackend>().unwrap(), StorageBackend::Json);
        assert!("hdf5".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_json_backend_writes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("run.json");
        let factory = BackendFactory::new(StorageBackend::Json);
        let mut store = factory.open(&path).unwrap();
        store.put_attribute("", "sample", "glass".into()).unwrap();
        store.close().unwrap();
        assert!(path.exists());
    }

    #[cfg(not(feature = "storage_netcdf"))]
    #[test]
    fn test_netcdf_backend_requires_feature() {
        let dir = tempfile::tempdir().unwrap();
        let factory = BackendFactory::new(StorageBackend::Netcdf);
        match factory.open(&dir.path().join("run.nc")) {
            Err(DaqError::FeatureNotEnabled(feature)) => assert_eq!(feature, "storage_netcdf"),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("netcdf backend opened without the feature"),
        }
    }

    #[test]
    fn test_memory_factory_tracks_stores() {
        let factory = MemoryFactory::new();
        let _a = factory.open(Path::new("a.json")).unwrap();
        let _b = factory.open(Path::new("b.json")).unwrap();
        let stores = factory.stores();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[1].0, PathBuf::from("b.json"));
    }
}
