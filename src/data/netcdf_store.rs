//! NetCDF-4 dataset backend.
//!
//! Requires a native netCDF-C installation and is compiled only with the
//! `storage_netcdf` feature. Without it, [`NetcdfStore::create`] reports
//! [`DaqError::FeatureNotEnabled`].

#[cfg(not(feature = "storage_netcdf"))]
use crate::error::{AppResult, DaqError};
#[cfg(not(feature = "storage_netcdf"))]
use std::path::Path;

#[cfg(feature = "storage_netcdf")]
mod netcdf_enabled {
    use crate::data::dataset::{normalize, slice_offset, AttrValue, DatasetStore};
    use crate::error::{AppResult, DaqError};
    use std::path::{Path, PathBuf};
    use tracing::info;

    fn nc_err(err: netcdf::Error) -> DaqError {
        DaqError::Dataset(err.to_string())
    }

    /// Dataset written to a `.nc` file.
    pub struct NetcdfStore {
        path: PathBuf,
        file: Option<netcdf::FileMut>,
    }

    impl NetcdfStore {
        /// Create (truncate) the file at `path`.
        pub fn create(path: &Path) -> AppResult<Self> {
            let file = netcdf::create(path).map_err(nc_err)?;
            info!(path = %path.display(), "NetCDF dataset created");
            Ok(Self {
                path: path.to_path_buf(),
                file: Some(file),
            })
        }

        fn file(&mut self) -> AppResult<&mut netcdf::FileMut> {
            self.file
                .as_mut()
                .ok_or_else(|| DaqError::Dataset("Dataset is already closed".to_string()))
        }

        fn group(&mut self, path: &str) -> AppResult<netcdf::GroupMut<'_>> {
            let path = normalize(path);
            let file = self.file()?;
            let group = if path.is_empty() {
                file.root_mut()
            } else {
                file.group_mut(&path).map_err(nc_err)?
            };
            group.ok_or_else(|| DaqError::Dataset(format!("Group '{}' does not exist", path)))
        }
    }

    impl DatasetStore for NetcdfStore {
        fn create_group(&mut self, path: &str) -> AppResult<()> {
            let path = normalize(path);
            if self.has_group(&path) {
                return Err(DaqError::Dataset(format!("Group '{}' already exists", path)));
            }
            let mut prefix = String::new();
            for part in path.split('/') {
                let full = if prefix.is_empty() {
                    part.to_string()
                } else {
                    format!("{}/{}", prefix, part)
                };
                if !self.has_group(&full) {
                    let mut parent = self.group(&prefix)?;
                    parent.add_group(part).map_err(nc_err)?;
                }
                prefix = full;
            }
            Ok(())
        }

        fn has_group(&self, path: &str) -> bool {
            let path = normalize(path);
            match self.file.as_ref() {
                Some(_) if path.is_empty() => true,
                Some(file) => matches!(file.group(&path), Ok(Some(_))),
                None => false,
            }
        }

        fn add_dimension(&mut self, group: &str, name: &str, len: usize) -> AppResult<()> {
            self.group(group)?
                .add_dimension(name, len)
                .map_err(nc_err)?;
            Ok(())
        }

        fn add_variable(
            &mut self,
            group: &str,
            name: &str,
            dims: &[&str],
            units: &str,
        ) -> AppResult<()> {
            let mut group = self.group(group)?;
            let mut var = group.add_variable::<f64>(name, dims).map_err(nc_err)?;
            var.set_fill_value(f64::NAN).map_err(nc_err)?;
            var.put_attribute("units", units).map_err(nc_err)?;
            Ok(())
        }

        fn put_values(
            &mut self,
            group: &str,
            name: &str,
            slice: Option<usize>,
            values: &[f64],
        ) -> AppResult<()> {
            let mut group = self.group(group)?;
            let mut var = group
                .variable_mut(name)
                .ok_or_else(|| DaqError::Dataset(format!("Variable '{}' does not exist", name)))?;
            let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
            slice_offset(name, &shape, slice, values.len())?;

            let capacity: usize = match slice {
                None => shape.iter().product(),
                Some(_) => shape.iter().skip(1).product(),
            };
            let mut padded = values.to_vec();
            padded.resize(capacity, f64::NAN);

            match (slice, shape.len()) {
                (None, _) => var.put_values(&padded, ..),
                (Some(index), 1) => var.put_values(&padded, [index]),
                (Some(index), 2) => var.put_values(&padded, (index, ..)),
                (Some(index), _) => var.put_values(&padded, (index, .., ..)),
            }
            .map_err(nc_err)
        }

        fn put_attribute(&mut self, group: &str, name: &str, value: AttrValue) -> AppResult<()> {
            let mut group = self.group(group)?;
            let result = match value {
                AttrValue::Int(v) => group.add_attribute(name, v),
                AttrValue::Float(v) => group.add_attribute(name, v),
                AttrValue::Text(v) => group.add_attribute(name, v),
                AttrValue::Floats(v) => group.add_attribute(name, v),
            };
            result.map_err(nc_err)?;
            Ok(())
        }

        fn close(&mut self) -> AppResult<()> {
            let file = self
                .file
                .take()
                .ok_or_else(|| DaqError::Dataset("Dataset is already closed".to_string()))?;
            drop(file);
            info!(path = %self.path.display(), "NetCDF dataset closed");
            Ok(())
        }
    }
}

#[cfg(feature = "storage_netcdf")]
pub use netcdf_enabled::NetcdfStore;

/// Placeholder when the `storage_netcdf` feature is disabled.
#[cfg(not(feature = "storage_netcdf"))]
pub struct NetcdfStore;

#[cfg(not(feature = "storage_netcdf"))]
impl NetcdfStore {
    /// Always fails: the backend was not compiled in.
    pub fn create(_path: &Path) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("storage_netcdf".to_string()))
    }
}

#[cfg(all(test, not(feature = "storage_netcdf")))]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_backend_reports_feature() {
        match NetcdfStore::create(Path::new("run.nc")) {
            Err(DaqError::FeatureNotEnabled(feature)) => assert_eq!(feature, "storage_netcdf"),
            _ => panic!("expected FeatureNotEnabled"),
        }
    }
}
