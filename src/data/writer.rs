//! Per-experiment dataset schema.
//!
//! [`DatasetWriter`] owns the [`DatasetStore`] of one run. Dimensions are declared on
//! the root group when the file is opened so every point group can reuse them. A point
//! group (`dark`, `lamp`, `x{i}y{j}`) is created together with its variables on the
//! first visit and reused when the same position comes back for the next excitation
//! wavelength.
//!
//! Variables with an excitation axis lead with `excitation_wavelengths` in sample
//! groups and with `single` in the dark group, so every write is addressed the same
//! way: one leading-axis slice per point.

use crate::core::MeasurementData;
use crate::data::calibration::CalibrationTable;
use crate::data::dataset::{AttrValue, Attributes, DatasetStore};
use crate::error::{AppResult, DaqError};
use crate::experiment::grid::{MeasurementPoint, PointKind};
use crate::experiment::ExperimentKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DIM_XY: &str = "xy_position";
const DIM_SINGLE: &str = "single";
const DIM_EMISSION: &str = "emission_wavelengths";
const DIM_INTERVALS: &str = "spectrometer_intervals";
const DIM_EXCITATION: &str = "excitation_wavelengths";
const DIM_POWER: &str = "power_measurements";
const DIM_SAMPLES: &str = "samples";

/// Group holding an embedded beamsplitter calibration.
pub const CALIBRATION_GROUP: &str = "calibration_beamsplitter";

/// Sizes of the shared dimensions, taken from the instruments when the file is opened.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetLayout {
    pub kind: ExperimentKind,
    /// Spectrometer wavelength axis.
    pub emission_wavelengths: Vec<f64>,
    /// Spectrometer averaging; two interval timestamps per exposure.
    pub averaging: u32,
    /// Unique excitation wavelengths without the dark sentinel.
    pub excitation_wavelengths: Vec<f64>,
    /// Power readings per measurement.
    pub power_measurements: usize,
    /// Digitizer record length.
    pub samples: usize,
}

impl DatasetLayout {
    fn intervals(&self) -> usize {
        2 * self.averaging.max(1) as usize
    }
}

/// Data collected for the current point.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointData {
    pub spectrum: Option<(Vec<f64>, Vec<f64>)>,
    pub power: Option<(Vec<f64>, Vec<f64>)>,
    pub pulses: Option<Vec<f64>>,
}

impl PointData {
    /// Keep a run measurement for the next write.
    pub fn store(&mut self, data: MeasurementData) {
        match data {
            MeasurementData::Spectrum {
                intensities,
                interval_times,
                ..
            } => self.spectrum = Some((intensities, interval_times)),
            MeasurementData::Power { powers, times } => self.power = Some((powers, times)),
            MeasurementData::Pulses { samples } => self.pulses = Some(samples),
            other => debug!(?other, "Measurement is not part of the dataset"),
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Writer for one run's dataset.
pub struct DatasetWriter {
    path: PathBuf,
    layout: DatasetLayout,
    store: Option<Box<dyn DatasetStore>>,
}

impl std::fmt::Debug for DatasetWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetWriter")
            .field("path", &self.path)
            .field("kind", &self.layout.kind)
            .field("open", &self.store.is_some())
            .finish()
    }
}

fn missing(what: &str, point: &MeasurementPoint) -> DaqError {
    DaqError::Dataset(format!(
        "No {} data for point {} ({})",
        what, point.index, point.group
    ))
}

impl DatasetWriter {
    /// Declare the shared dimensions and root attributes.
    pub fn create(
        mut store: Box<dyn DatasetStore>,
        path: impl Into<PathBuf>,
        layout: DatasetLayout,
        run_uid: &str,
    ) -> AppResult<Self> {
        let path = path.into();
        store.add_dimension("", DIM_XY, 2)?;
        store.add_dimension("", DIM_SINGLE, 1)?;
        match layout.kind {
            ExperimentKind::Transmission => {
                store.add_dimension("", DIM_EMISSION, layout.emission_wavelengths.len())?;
                store.add_dimension("", DIM_INTERVALS, layout.intervals())?;
            }
            ExperimentKind::ExcitationEmission => {
                store.add_dimension("", DIM_EMISSION, layout.emission_wavelengths.len())?;
                store.add_dimension("", DIM_INTERVALS, layout.intervals())?;
                store.add_dimension("", DIM_EXCITATION, layout.excitation_wavelengths.len())?;
                store.add_dimension("", DIM_POWER, layout.power_measurements)?;
            }
            ExperimentKind::Decay => {
                store.add_dimension("", DIM_EXCITATION, layout.excitation_wavelengths.len())?;
                store.add_dimension("", DIM_SAMPLES, layout.samples)?;
            }
            ExperimentKind::Calibration => {
                return Err(DaqError::Dataset(
                    "Calibration runs write a CSV file, not a dataset".to_string(),
                ))
            }
        }
        store.put_attribute("", "run_uid", run_uid.into())?;
        store.put_attribute("", "created_at", chrono::Local::now().to_rfc3339().into())?;
        store.put_attribute("", "software_version", env!("CARGO_PKG_VERSION").into())?;
        store.put_attribute("", "experiment", layout.kind.as_str().into())?;
        info!(path = %path.display(), kind = %layout.kind, "Dataset opened");
        Ok(Self {
            path,
            layout,
            store: Some(store),
        })
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True until [`close`](Self::close).
    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    fn store(&mut self) -> AppResult<&mut Box<dyn DatasetStore>> {
        self.store
            .as_mut()
            .ok_or_else(|| DaqError::Dataset("Dataset is closed".to_string()))
    }

    /// Write one settings group (`settings/<name>`) from attributes.
    pub fn write_settings(&mut self, name: &str, attributes: &Attributes) -> AppResult<()> {
        let group = format!("settings/{}", name);
        let store = self.store()?;
        if !store.has_group(&group) {
            store.create_group(&group)?;
        }
        for (key, value) in attributes {
            store.put_attribute(&group, key, value.clone())?;
        }
        Ok(())
    }

    /// Copy a beamsplitter calibration into its own group.
    pub fn embed_calibration(&mut self, table: &CalibrationTable, source: &Path) -> AppResult<()> {
        let store = self.store()?;
        store.create_group(CALIBRATION_GROUP)?;
        store.add_dimension(CALIBRATION_GROUP, "powermeasurements", table.len())?;
        for (name, units, values) in [
            ("wavelength", "nm", &table.wavelength),
            ("position", "", &table.position),
            ("power", "W", &table.power),
            ("times", "s", &table.times),
        ] {
            store.add_variable(CALIBRATION_GROUP, name, &["powermeasurements"], units)?;
            store.put_values(CALIBRATION_GROUP, name, None, values)?;
        }
        store.put_attribute(
            CALIBRATION_GROUP,
            "source",
            AttrValue::from(source.display().to_string()),
        )?;
        Ok(())
    }

    fn create_point_group(&mut self, point: &MeasurementPoint) -> AppResult<()> {
        let kind = self.layout.kind;
        let emission = self.layout.emission_wavelengths.clone();
        let excitation = self.layout.excitation_wavelengths.clone();
        let group = point.group.as_str();
        let leading = if point.kind == PointKind::Dark {
            DIM_SINGLE
        } else {
            DIM_EXCITATION
        };

        let store = self.store()?;
        store.create_group(group)?;
        store.add_variable(group, "position", &[DIM_XY], "mm")?;
        match kind {
            ExperimentKind::Transmission => {
                store.add_variable(group, "emission", &[DIM_EMISSION], "nm")?;
                store.put_values(group, "emission", None, &emission)?;
                store.add_variable(group, "spectrum", &[DIM_EMISSION], "a.u.")?;
                store.add_variable(group, "spectrum_t", &[DIM_INTERVALS], "s")?;
            }
            ExperimentKind::ExcitationEmission => {
                store.add_variable(group, "emission", &[DIM_EMISSION], "nm")?;
                store.put_values(group, "emission", None, &emission)?;
                store.add_variable(group, "excitation", &[leading], "nm")?;
                store.add_variable(group, "spectrum", &[leading, DIM_EMISSION], "a.u.")?;
                store.add_variable(group, "spectrum_t", &[leading, DIM_INTERVALS], "s")?;
                store.add_variable(group, "power", &[leading, DIM_POWER], "W")?;
                store.add_variable(group, "power_t", &[leading, DIM_POWER], "s")?;
            }
            ExperimentKind::Decay => {
                store.add_variable(group, "excitation", &[leading], "nm")?;
                store.add_variable(
                    group,
                    "pulses",
                    &[leading, DIM_SAMPLES],
                    "normalized ADC counts",
                )?;
            }
            ExperimentKind::Calibration => {}
        }
        if leading == DIM_EXCITATION && !excitation.is_empty() {
            store.put_values(group, "excitation", None, &excitation)?;
        }
        debug!(group, "Point group created");
        Ok(())
    }

    /// Persist one point.
    pub fn write_point(
        &mut self,
        point: &MeasurementPoint,
        position: Option<(f64, f64)>,
        data: &PointData,
    ) -> AppResult<()> {
        if !self.store()?.has_group(&point.group) {
            self.create_point_group(point)?;
        }
        let kind = self.layout.kind;
        let group = point.group.as_str();
        let slice = point.wavelength_slice;
        let store = self.store()?;

        if let Some((x, y)) = position {
            store.put_values(group, "position", None, &[x, y])?;
        }

        match kind {
            ExperimentKind::Transmission => {
                let (spectrum, times) = data.spectrum.as_ref().ok_or_else(|| missing("spectrum", point))?;
                store.put_values(group, "spectrum", None, spectrum)?;
                store.put_values(group, "spectrum_t", None, times)?;
            }
            ExperimentKind::ExcitationEmission => {
                let (spectrum, times) = data.spectrum.as_ref().ok_or_else(|| missing("spectrum", point))?;
                let (powers, power_times) = data.power.as_ref().ok_or_else(|| missing("power", point))?;
                if point.kind == PointKind::Dark {
                    if let Some(wl) = point.wavelength {
                        store.put_values(group, "excitation", slice, &[wl])?;
                    }
                }
                store.put_values(group, "spectrum", slice, spectrum)?;
                store.put_values(group, "spectrum_t", slice, times)?;
                store.put_values(group, "power", slice, powers)?;
                store.put_values(group, "power_t", slice, power_times)?;
            }
            ExperimentKind::Decay => {
                let pulses = data.pulses.as_ref().ok_or_else(|| missing("pulses", point))?;
                if point.kind == PointKind::Dark {
                    if let Some(wl) = point.wavelength {
                        store.put_values(group, "excitation", slice, &[wl])?;
                    }
                }
                store.put_values(group, "pulses", slice, pulses)?;
            }
            ExperimentKind::Calibration => {}
        }
        debug!(index = point.index, group, ?slice, "Point written");
        Ok(())
    }

    /// Close the dataset. Later calls do nothing.
    pub fn close(&mut self) -> AppResult<()> {
        match self.store.take() {
            Some(mut store) => {
                store.close()?;
                info!(path = %self.path.display(), "Dataset closed");
            }
            None => debug!(path = %self.path.display(), "Dataset already closed"),
        }
        Ok(())
    }
}

impl Drop for DatasetWriter {
    fn drop(&mut self) {
        if self.store.is_some() {
            warn!(path = %self.path.display(), "Dataset dropped while open, closing it");
            if let Err(e) = self.close() {
                warn!(error = %e, "Closing dataset on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::MemoryStore;
    use crate::experiment::geometry::AxisLayout;
    use crate::experiment::grid::Schedule;

    fn layout(positions: Vec<f64>) -> AxisLayout {
        AxisLayout {
            positions,
            off1_mm: 0.0,
            off2_mm: 0.0,
            edge_off1: 2.0,
            edge_off2: 2.0,
        }
    }

    fn spectrum(n: usize, value: f64) -> (Vec<f64>, Vec<f64>) {
        (vec![value; n], vec![0.0, 1.0])
    }

    #[test]
    fn test_transmission_groups() {
        let schedule = Schedule::build(
            ExperimentKind::Transmission,
            Some(&layout(vec![1.0, 2.0])),
            Some(&layout(vec![5.0, 6.0])),
            &[],
        )
        .unwrap();
        let store = MemoryStore::new();
        let mut writer = DatasetWriter::create(
            Box::new(store.clone()),
            "t.json",
            DatasetLayout {
                kind: ExperimentKind::Transmission,
                emission_wavelengths: vec![500.0, 600.0, 700.0],
                averaging: 1,
                excitation_wavelengths: vec![],
                power_measurements: 0,
                samples: 0,
            },
            "run-1",
        )
        .unwrap();
        let data = PointData {
            spectrum: Some(spectrum(3, 7.0)),
            ..PointData::default()
        };
        for k in 0..schedule.len() {
            let point = schedule.point(k).unwrap();
            writer
                .write_point(&point, point.x.zip(point.y), &data)
                .unwrap();
        }
        writer.close().unwrap();
        writer.close().unwrap();
        assert_eq!(store.close_count(), 1);

        let snapshot = store.snapshot();
        let mut groups = snapshot.top_level_groups();
        groups.sort();
        assert_eq!(groups, vec!["dark", "lamp", "x1y1", "x1y2", "x2y1", "x2y2"]);
        let lamp = snapshot.variable("lamp", "position").unwrap();
        assert_eq!(lamp.values, vec![0.0, 0.0]);
        let spectrum_t = snapshot.variable("x2y2", "spectrum_t").unwrap();
        assert_eq!(spectrum_t.units, "s");
        assert_eq!(spectrum_t.shape, vec![2]);
        assert_eq!(
            snapshot.group("").unwrap().attributes.get("run_uid"),
            Some(&AttrValue::from("run-1"))
        );
    }

    #[test]
    fn test_excitation_emission_slices() {
        let schedule = Schedule::build(
            ExperimentKind::ExcitationEmission,
            Some(&layout(vec![1.0])),
            Some(&layout(vec![5.0])),
            &[400.0, 450.0, 500.0],
        )
        .unwrap();
        let store = MemoryStore::new();
        let mut writer = DatasetWriter::create(
            Box::new(store.clone()),
            "ee.json",
            DatasetLayout {
                kind: ExperimentKind::ExcitationEmission,
                emission_wavelengths: vec![600.0, 700.0],
                averaging: 1,
                excitation_wavelengths: schedule.excitation_wavelengths().to_vec(),
                power_measurements: 2,
                samples: 0,
            },
            "run-2",
        )
        .unwrap();
        for k in 0..schedule.len() {
            let point = schedule.point(k).unwrap();
            let data = PointData {
                spectrum: Some(spectrum(2, k as f64)),
                power: Some((vec![k as f64; 2], vec![1.0, 2.0])),
                pulses: None,
            };
            writer.write_point(&point, Some((1.0, 5.0)), &data).unwrap();
        }
        let snapshot = store.snapshot();
        let spectrum = snapshot.variable("x1y1", "spectrum").unwrap();
        assert_eq!(spectrum.shape, vec![3, 2]);
        assert_eq!(spectrum.values, vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let excitation = snapshot.variable("x1y1", "excitation").unwrap();
        assert_eq!(excitation.values, vec![400.0, 450.0, 500.0]);
        let dark = snapshot.variable("dark", "power").unwrap();
        assert_eq!(dark.shape, vec![1, 2]);
        assert_eq!(snapshot.variable("dark", "excitation").unwrap().values, vec![-1.0]);
    }

    #[test]
    fn test_missing_data_is_an_error() {
        let schedule =
            Schedule::build(ExperimentKind::Decay, Some(&layout(vec![1.0])), Some(&layout(vec![2.0])), &[532.0])
                .unwrap();
        let mut writer = DatasetWriter::create(
            Box::new(MemoryStore::new()),
            "d.json",
            DatasetLayout {
                kind: ExperimentKind::Decay,
                emission_wavelengths: vec![],
                averaging: 1,
                excitation_wavelengths: vec![532.0],
                power_measurements: 0,
                samples: 8,
            },
            "run-3",
        )
        .unwrap();
        let point = schedule.point(1).unwrap();
        assert!(matches!(
            writer.write_point(&point, None, &PointData::default()),
            Err(DaqError::Dataset(_))
        ));
    }

    #[test]
    fn test_embed_calibration() {
        let store = MemoryStore::new();
        let mut writer = DatasetWriter::create(
            Box::new(store.clone()),
            "ee.json",
            DatasetLayout {
                kind: ExperimentKind::ExcitationEmission,
                emission_wavelengths: vec![600.0],
                averaging: 1,
                excitation_wavelengths: vec![400.0],
                power_measurements: 1,
                samples: 0,
            },
            "run-4",
        )
        .unwrap();
        let table = CalibrationTable {
            wavelength: vec![400.0, 400.0],
            position: vec![1.0, 2.0],
            power: vec![1e-3, 2e-3],
            times: vec![0.0, 1.0],
        };
        writer
            .embed_calibration(&table, Path::new("bs.csv"))
            .unwrap();
        let snapshot = store.snapshot();
        let power = snapshot.variable(CALIBRATION_GROUP, "power").unwrap();
        assert_eq!(power.values, vec![1e-3, 2e-3]);
        assert_eq!(power.units, "W");
    }
}
