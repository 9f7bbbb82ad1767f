//! Hierarchical dataset abstraction.
//!
//! A dataset is a tree of groups addressed by slash-separated paths (`""` is the
//! root, `settings/general`, `x1y2`). Groups hold named dimensions, float variables
//! shaped by those dimensions, and attributes. Dimensions declared on a parent are
//! visible to all children, so the writer declares the shared axes once on the root.
//!
//! Variables are created NaN-filled; [`DatasetStore::put_values`] writes either the
//! whole variable or one slice along its leading dimension.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Attribute value stored on a group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
    Floats(Vec<f64>),
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        AttrValue::Int(i64::from(value))
    }
}

impl From<usize> for AttrValue {
    fn from(value: usize) -> Self {
        AttrValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Int(i64::from(value))
    }
}

impl From<Vec<f64>> for AttrValue {
    fn from(value: Vec<f64>) -> Self {
        AttrValue::Floats(value)
    }
}

/// Ordered attribute map.
pub type Attributes = BTreeMap<String, AttrValue>;

/// Backend-neutral hierarchical store.
pub trait DatasetStore: Send {
    /// Create a group (and any missing parents). Creating an existing group is an error.
    fn create_group(&mut self, path: &str) -> AppResult<()>;

    /// True if the group exists.
    fn has_group(&self, path: &str) -> bool;

    /// Declare a dimension on a group.
    fn add_dimension(&mut self, group: &str, name: &str, len: usize) -> AppResult<()>;

    /// Declare a NaN-filled variable with a `units` attribute.
    fn add_variable(&mut self, group: &str, name: &str, dims: &[&str], units: &str)
        -> AppResult<()>;

    /// Write the whole variable (`slice = None`) or one leading-axis slice.
    ///
    /// Shorter input leaves the remaining entries at the fill value.
    fn put_values(
        &mut self,
        group: &str,
        name: &str,
        slice: Option<usize>,
        values: &[f64],
    ) -> AppResult<()>;

    /// Set an attribute on a group.
    fn put_attribute(&mut self, group: &str, name: &str, value: AttrValue) -> AppResult<()>;

    /// Flush and release the file. Any further call fails.
    fn close(&mut self) -> AppResult<()>;
}

pub(crate) fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        None
    } else {
        Some(path.rsplit_once('/').map_or("", |(head, _)| head))
    }
}

/// Check a slice write against a variable shape and return the flat offset.
pub(crate) fn slice_offset(
    name: &str,
    shape: &[usize],
    slice: Option<usize>,
    len: usize,
) -> AppResult<usize> {
    let (offset, capacity) = match slice {
        None => (0, shape.iter().product()),
        Some(index) => {
            let leading = shape.first().copied().unwrap_or(1);
            if index >= leading {
                return Err(DaqError::Dataset(format!(
                    "Slice {} out of range for '{}' (leading dimension {})",
                    index, name, leading
                )));
            }
            let inner: usize = shape.iter().skip(1).product();
            (index * inner, inner)
        }
    };
    if len > capacity {
        return Err(DaqError::Dataset(format!(
            "{} values do not fit into '{}' (room for {})",
            len, name, capacity
        )));
    }
    Ok(offset)
}

// =============================================================================
// In-memory backend
// =============================================================================

/// One variable of a [`MemoryDataset`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryVariable {
    pub dimensions: Vec<String>,
    pub shape: Vec<usize>,
    pub units: String,
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
}

impl MemoryVariable {
    /// Row `index` along the leading dimension.
    pub fn row(&self, index: usize) -> &[f64] {
        let inner: usize = self.shape.iter().skip(1).product();
        let start = (index * inner).min(self.values.len());
        let end = (start + inner).min(self.values.len());
        &self.values[start..end]
    }
}

/// One group of a [`MemoryDataset`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryGroup {
    pub dimensions: BTreeMap<String, usize>,
    pub variables: BTreeMap<String, MemoryVariable>,
    pub attributes: Attributes,
}

/// Complete dataset content, keyed by normalized group path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDataset {
    pub groups: BTreeMap<String, MemoryGroup>,
}

impl MemoryDataset {
    fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(String::new(), MemoryGroup::default());
        Self { groups }
    }

    /// Group by path.
    pub fn group(&self, path: &str) -> Option<&MemoryGroup> {
        self.groups.get(&normalize(path))
    }

    /// Variable by group path and name.
    pub fn variable(&self, group: &str, name: &str) -> Option<&MemoryVariable> {
        self.group(group).and_then(|g| g.variables.get(name))
    }

    /// Names of the top-level groups (excluding the root).
    pub fn top_level_groups(&self) -> Vec<&str> {
        self.groups
            .keys()
            .filter(|path| !path.is_empty() && !path.contains('/'))
            .map(String::as_str)
            .collect()
    }

    fn resolve_dimension(&self, group: &str, name: &str) -> Option<usize> {
        let mut current = Some(group);
        while let Some(path) = current {
            if let Some(len) = self.groups.get(path).and_then(|g| g.dimensions.get(name)) {
                return Some(*len);
            }
            current = parent(path);
        }
        None
    }

    fn group_mut(&mut self, path: &str) -> AppResult<&mut MemoryGroup> {
        self.groups
            .get_mut(path)
            .ok_or_else(|| DaqError::Dataset(format!("Group '{}' does not exist", path)))
    }
}

#[derive(Debug)]
struct MemoryInner {
    dataset: MemoryDataset,
    closed: bool,
    close_count: usize,
    persist_to: Option<PathBuf>,
}

/// Dataset held in memory, optionally written out as JSON on close.
///
/// Clones share the same content, which lets callers keep a handle for inspection
/// after the store itself was handed to a writer.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store that is never written to disk.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                dataset: MemoryDataset::new(),
                closed: false,
                close_count: 0,
                persist_to: None,
            })),
        }
    }

    /// Store that is written to `path` as pretty JSON when closed.
    pub fn persisted(path: impl Into<PathBuf>) -> Self {
        let store = Self::new();
        store.lock().persist_to = Some(path.into());
        store
    }

    /// Copy of the current content.
    pub fn snapshot(&self) -> MemoryDataset {
        self.lock().dataset.clone()
    }

    /// Number of successful `close()` calls.
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Read a JSON dataset written by a persisted store.
    pub fn load_json(path: &Path) -> AppResult<MemoryDataset> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_inner(&self) -> AppResult<MutexGuard<'_, MemoryInner>> {
        let inner = self.lock();
        if inner.closed {
            return Err(DaqError::Dataset("Dataset is already closed".to_string()));
        }
        Ok(inner)
    }
}

impl DatasetStore for MemoryStore {
    fn create_group(&mut self, path: &str) -> AppResult<()> {
        let path = normalize(path);
        let mut inner = self.open_inner()?;
        if inner.dataset.groups.contains_key(&path) {
            return Err(DaqError::Dataset(format!("Group '{}' already exists", path)));
        }
        let mut current = Some(path.as_str());
        while let Some(p) = current {
            inner.dataset.groups.entry(p.to_string()).or_default();
            current = parent(p);
        }
        debug!(group = %path, "Created group");
        Ok(())
    }

    fn has_group(&self, path: &str) -> bool {
        self.lock().dataset.groups.contains_key(&normalize(path))
    }

    fn add_dimension(&mut self, group: &str, name: &str, len: usize) -> AppResult<()> {
        let group = normalize(group);
        let mut inner = self.open_inner()?;
        let g = inner.dataset.group_mut(&group)?;
        if g.dimensions.insert(name.to_string(), len).is_some() {
            return Err(DaqError::Dataset(format!(
                "Dimension '{}' already declared on '{}'",
                name, group
            )));
        }
        Ok(())
    }

    fn add_variable(
        &mut self,
        group: &str,
        name: &str,
        dims: &[&str],
        units: &str,
    ) -> AppResult<()> {
        let group = normalize(group);
        let mut inner = self.open_inner()?;
        let shape = dims
            .iter()
            .map(|dim| {
                inner.dataset.resolve_dimension(&group, dim).ok_or_else(|| {
                    DaqError::Dataset(format!("Unknown dimension '{}' for '{}/{}'", dim, group, name))
                })
            })
            .collect::<AppResult<Vec<usize>>>()?;
        let size = shape.iter().product();
        let g = inner.dataset.group_mut(&group)?;
        if g.variables.contains_key(name) {
            return Err(DaqError::Dataset(format!(
                "Variable '{}' already exists in '{}'",
                name, group
            )));
        }
        g.variables.insert(
            name.to_string(),
            MemoryVariable {
                dimensions: dims.iter().map(|d| d.to_string()).collect(),
                shape,
                units: units.to_string(),
                values: vec![f64::NAN; size],
            },
        );
        Ok(())
    }

    fn put_values(
        &mut self,
        group: &str,
        name: &str,
        slice: Option<usize>,
        values: &[f64],
    ) -> AppResult<()> {
        let group = normalize(group);
        let mut inner = self.open_inner()?;
        let variable = inner
            .dataset
            .group_mut(&group)?
            .variables
            .get_mut(name)
            .ok_or_else(|| {
                DaqError::Dataset(format!("Variable '{}' does not exist in '{}'", name, group))
            })?;
        let offset = slice_offset(name, &variable.shape, slice, values.len())?;
        variable.values[offset..offset + values.len()].copy_from_slice(values);
        Ok(())
    }

    fn put_attribute(&mut self, group: &str, name: &str, value: AttrValue) -> AppResult<()> {
        let group = normalize(group);
        let mut inner = self.open_inner()?;
        inner
            .dataset
            .group_mut(&group)?
            .attributes
            .insert(name.to_string(), value);
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        let mut inner = self.open_inner()?;
        inner.closed = true;
        inner.close_count += 1;
        if let Some(path) = inner.persist_to.clone() {
            let file = std::fs::File::create(&path)?;
            serde_json::to_writer_pretty(std::io::BufWriter::new(file), &inner.dataset)?;
            info!(path = %path.display(), "Dataset written");
        }
        Ok(())
    }
}

/// JSON has no NaN; fill values travel as `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        values
            .iter()
            .map(|v| if v.is_nan() { None } else { Some(*v) })
            .collect::<Vec<Option<f64>>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let raw = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_axes() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.add_dimension("", "excitation_wavelengths", 3).unwrap();
        store.add_dimension("", "emission_wavelengths", 4).unwrap();
        store.create_group("x1y1").unwrap();
        store
            .add_variable(
                "x1y1",
                "spectrum",
                &["excitation_wavelengths", "emission_wavelengths"],
                "a.u.",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_variables_start_nan_filled() {
        let store = store_with_axes();
        let snapshot = store.snapshot();
        let var = snapshot.variable("x1y1", "spectrum").unwrap();
        assert_eq!(var.shape, vec![3, 4]);
        assert_eq!(var.units, "a.u.");
        assert!(var.values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_slice_write_targets_leading_axis() {
        let mut store = store_with_axes();
        store
            .put_values("x1y1", "spectrum", Some(1), &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let snapshot = store.snapshot();
        let var = snapshot.variable("x1y1", "spectrum").unwrap();
        assert!(var.row(0).iter().all(|v| v.is_nan()));
        assert_eq!(var.row(1), &[1.0, 2.0, 3.0, 4.0]);
        assert!(var.row(2).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_out_of_range_writes_are_rejected() {
        let mut store = store_with_axes();
        assert!(store.put_values("x1y1", "spectrum", Some(3), &[1.0]).is_err());
        assert!(store
            .put_values("x1y1", "spectrum", Some(0), &[0.0; 5])
            .is_err());
        assert!(store.put_values("x1y1", "missing", None, &[0.0]).is_err());
    }

    #[test]
    fn test_groups_are_created_once() {
        let mut store = MemoryStore::new();
        store.create_group("settings/general").unwrap();
        assert!(store.has_group("settings"));
        assert!(store.has_group("/settings/general/"));
        assert!(store.create_group("settings/general").is_err());
    }

    #[test]
    fn test_unknown_dimension_is_an_error() {
        let mut store = MemoryStore::new();
        store.create_group("dark").unwrap();
        assert!(store.add_variable("dark", "pulses", &["samples"], "").is_err());
    }

    #[test]
    fn test_close_persists_json_with_null_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let mut store = MemoryStore::persisted(&path);
        store.add_dimension("", "xy_position", 2).unwrap();
        store.create_group("dark").unwrap();
        store
            .add_variable("dark", "position", &["xy_position"], "mm")
            .unwrap();
        store.put_values("dark", "position", None, &[20.0]).unwrap();
        store.put_attribute("", "sample", "quartz".into()).unwrap();
        store.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("null"));
        let loaded = MemoryStore::load_json(&path).unwrap();
        let var = loaded.variable("dark", "position").unwrap();
        assert_eq!(var.values[0], 20.0);
        assert!(var.values[1].is_nan());
        assert_eq!(
            loaded.group("").unwrap().attributes.get("sample"),
            Some(&AttrValue::Text("quartz".into()))
        );
    }

    #[test]
    fn test_close_is_final() {
        let mut store = MemoryStore::new();
        let observer = store.clone();
        store.close().unwrap();
        assert!(store.close().is_err());
        assert!(store.create_group("x1y1").is_err());
        assert_eq!(observer.close_count(), 1);
        assert!(observer.is_closed());
    }
}
