//! Output files of a run.
//!
//! - [`dataset`]: the hierarchical [`DatasetStore`] abstraction and its in-memory / JSON backend
//! - [`netcdf_store`]: NetCDF-4 backend (feature `storage_netcdf`)
//! - [`storage`]: backend selection and output file naming
//! - [`writer`]: per-experiment dataset schema and per-point writes
//! - [`calibration`]: beamsplitter calibration CSV (feature `storage_csv`)

pub mod calibration;
pub mod dataset;
pub mod netcdf_store;
pub mod storage;
pub mod writer;

pub use dataset::{AttrValue, Attributes, DatasetStore, MemoryDataset, MemoryStore};
pub use storage::{BackendFactory, MemoryFactory, StorageBackend, StoreFactory};
pub use writer::{DatasetWriter, PointData};
