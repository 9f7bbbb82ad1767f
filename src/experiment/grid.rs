//! Measurement-parameter grid.
//!
//! A [`ParameterGrid`] maps axis names to value sequences of one common length N;
//! position k across all sequences is one measurement point. Adding an axis repeats
//! every existing sequence element-wise and tiles the new values, so the first axis
//! added varies slowest and the last one fastest.
//!
//! A [`Schedule`] is the grid of one run plus its reference points and the derived
//! dataset addressing (group name and wavelength slice) of every point.

use crate::error::{AppResult, DaqError};
use crate::experiment::geometry::AxisLayout;
use crate::experiment::ExperimentKind;
use std::fmt;

/// Stage position of the dark reference (mm).
pub const DARK_POSITION: (f64, f64) = (20.0, 68.0);
/// Stage position of the lamp reference (mm).
pub const LAMP_POSITION: (f64, f64) = (0.0, 0.0);
/// Excitation wavelength recorded for the dark reference.
pub const DARK_WAVELENGTH: f64 = -1.0;

/// Scan axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Wl,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Wl => "wl",
        })
    }
}

/// Axis name to value sequence, all sequences of equal length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterGrid {
    axes: Vec<(Axis, Vec<f64>)>,
}

impl ParameterGrid {
    /// Empty grid.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.axes.first().map_or(0, |(_, values)| values.len())
    }

    /// True if no axis was added yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Axes in insertion order.
    pub fn axes(&self) -> impl Iterator<Item = Axis> + '_ {
        self.axes.iter().map(|(axis, _)| *axis)
    }

    /// Values of one axis.
    pub fn values(&self, axis: Axis) -> Option<&[f64]> {
        self.axes
            .iter()
            .find(|(a, _)| *a == axis)
            .map(|(_, values)| values.as_slice())
    }

    /// Add an axis, multiplying the number of points by `values.len()`.
    pub fn add_measurement_parameter(&mut self, axis: Axis, values: &[f64]) -> AppResult<()> {
        if values.is_empty() {
            return Err(DaqError::InvalidInput(format!("Axis '{}' has no values", axis)));
        }
        if self.values(axis).is_some() {
            return Err(DaqError::InvalidInput(format!("Axis '{}' added twice", axis)));
        }

        let n = self.len();
        for (_, existing) in &mut self.axes {
            *existing = existing
                .iter()
                .flat_map(|v| std::iter::repeat(*v).take(values.len()))
                .collect();
        }
        let tiled = if self.axes.is_empty() {
            values.to_vec()
        } else {
            values.iter().copied().cycle().take(n * values.len()).collect()
        };
        self.axes.push((axis, tiled));
        Ok(())
    }

    /// Insert one point at the front. Every axis needs a value.
    pub fn prepend(&mut self, point: &[(Axis, f64)]) -> AppResult<()> {
        for (axis, _) in &self.axes {
            if !point.iter().any(|(a, _)| a == axis) {
                return Err(DaqError::InvalidInput(format!(
                    "Reference point lacks axis '{}'",
                    axis
                )));
            }
        }
        for (axis, values) in &mut self.axes {
            if let Some((_, value)) = point.iter().find(|(a, _)| a == axis) {
                values.insert(0, *value);
            }
        }
        Ok(())
    }
}

/// Role of a point in the schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointKind {
    Dark,
    Lamp,
    Sample,
}

/// One point of a schedule with its dataset addressing.
#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementPoint {
    pub index: usize,
    pub kind: PointKind,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub wavelength: Option<f64>,
    /// `dark`, `lamp` or `x{i}y{j}` (1-based).
    pub group: String,
    /// Slice along `excitation_wavelengths` (always 0 for the dark reference).
    pub wavelength_slice: Option<usize>,
}

/// Ordered schedule of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule {
    kind: ExperimentKind,
    grid: ParameterGrid,
    unique_x: Vec<f64>,
    unique_y: Vec<f64>,
    unique_wl: Vec<f64>,
}

fn sorted_unique(values: &[f64]) -> Vec<f64> {
    let mut out = values.to_vec();
    out.sort_by(f64::total_cmp);
    out.dedup();
    out
}

/// Rejects wavelengths that coincide after rounding to 1e-6 nm.
///
/// Two equal wavelengths would address the same dataset slice.
pub fn ensure_distinct_wavelengths(wavelengths: &[f64]) -> AppResult<()> {
    let mut rounded: Vec<f64> = wavelengths.iter().map(|wl| (wl * 1e6).round() / 1e6).collect();
    rounded.sort_by(f64::total_cmp);
    if let Some(pair) = rounded.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(DaqError::InvalidInput(format!(
            "Excitation wavelength {} nm is selected more than once",
            pair[0]
        )));
    }
    Ok(())
}

fn position_of(sorted: &[f64], value: f64) -> Option<usize> {
    sorted.binary_search_by(|probe| probe.total_cmp(&value)).ok()
}

impl Schedule {
    /// Build the schedule of a run.
    ///
    /// `y` is added before `x`, the excitation wavelengths last, then the reference
    /// points of `kind` are prepended.
    pub fn build(
        kind: ExperimentKind,
        x: Option<&AxisLayout>,
        y: Option<&AxisLayout>,
        wavelengths: &[f64],
    ) -> AppResult<Self> {
        let mut grid = ParameterGrid::new();

        if kind.scans_positions() {
            let (x, y) = x.zip(y).ok_or_else(|| {
                DaqError::InvalidInput(format!("{} needs x and y positions", kind))
            })?;
            grid.add_measurement_parameter(Axis::Y, &y.positions)?;
            grid.add_measurement_parameter(Axis::X, &x.positions)?;
        }
        if kind.has_wavelength_axis() {
            if let Some(bad) = wavelengths.iter().find(|wl| wl.is_nan() || **wl <= 0.0) {
                return Err(DaqError::InvalidInput(format!(
                    "Excitation wavelength {} nm is not positive",
                    bad
                )));
            }
            ensure_distinct_wavelengths(wavelengths)?;
            grid.add_measurement_parameter(Axis::Wl, wavelengths)?;
        }

        let (dark_x, dark_y) = DARK_POSITION;
        match kind {
            ExperimentKind::Transmission => {
                let (lamp_x, lamp_y) = LAMP_POSITION;
                grid.prepend(&[(Axis::X, lamp_x), (Axis::Y, lamp_y)])?;
                grid.prepend(&[(Axis::X, dark_x), (Axis::Y, dark_y)])?;
            }
            ExperimentKind::ExcitationEmission | ExperimentKind::Decay => {
                grid.prepend(&[(Axis::X, dark_x), (Axis::Y, dark_y), (Axis::Wl, DARK_WAVELENGTH)])?;
            }
            ExperimentKind::Calibration => {}
        }

        let skip = kind.reference_points();
        let tail = |axis: Axis| -> Vec<f64> {
            grid.values(axis)
                .map(|v| sorted_unique(&v[skip.min(v.len())..]))
                .unwrap_or_default()
        };
        let unique_x = tail(Axis::X);
        let unique_y = tail(Axis::Y);
        let unique_wl = tail(Axis::Wl);

        Ok(Self {
            kind,
            grid,
            unique_x,
            unique_y,
            unique_wl,
        })
    }

    /// Experiment this schedule belongs to.
    pub fn kind(&self) -> ExperimentKind {
        self.kind
    }

    /// Number of points including references.
    pub fn len(&self) -> usize {
        self.grid.len()
    }

    /// True for an empty schedule.
    pub fn is_empty(&self) -> bool {
        self.grid.is_empty()
    }

    /// Underlying grid.
    pub fn grid(&self) -> &ParameterGrid {
        &self.grid
    }

    /// Sorted unique sample x positions.
    pub fn unique_x(&self) -> &[f64] {
        &self.unique_x
    }

    /// Sorted unique sample y positions.
    pub fn unique_y(&self) -> &[f64] {
        &self.unique_y
    }

    /// Sorted unique excitation wavelengths (without the dark sentinel).
    pub fn excitation_wavelengths(&self) -> &[f64] {
        &self.unique_wl
    }

    /// Point `index`, or `None` past the end.
    pub fn point(&self, index: usize) -> Option<MeasurementPoint> {
        if index >= self.len() {
            return None;
        }
        let at = |axis: Axis| self.grid.values(axis).map(|v| v[index]);
        let (x, y, wavelength) = (at(Axis::X), at(Axis::Y), at(Axis::Wl));

        let kind = match (self.kind, index) {
            (ExperimentKind::Calibration, _) => PointKind::Sample,
            (_, 0) => PointKind::Dark,
            (ExperimentKind::Transmission, 1) => PointKind::Lamp,
            _ => PointKind::Sample,
        };

        let (group, wavelength_slice) = match kind {
            PointKind::Dark => ("dark".to_string(), self.kind.has_wavelength_axis().then_some(0)),
            PointKind::Lamp => ("lamp".to_string(), None),
            PointKind::Sample => {
                let slice = wavelength.and_then(|wl| position_of(&self.unique_wl, wl));
                let group = match (x, y) {
                    (Some(x), Some(y)) => {
                        let i = position_of(&self.unique_x, x).unwrap_or(0);
                        let j = position_of(&self.unique_y, y).unwrap_or(0);
                        format!("x{}y{}", i + 1, j + 1)
                    }
                    _ => self.kind.as_str().to_string(),
                };
                (group, slice)
            }
        };

        Some(MeasurementPoint {
            index,
            kind,
            x,
            y,
            wavelength,
            group,
            wavelength_slice,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(positions: Vec<f64>) -> AxisLayout {
        AxisLayout {
            positions,
            off1_mm: 0.0,
            off2_mm: 0.0,
            edge_off1: 2.0,
            edge_off2: 2.0,
        }
    }

    #[test]
    fn test_grid_invariant_and_order() {
        let mut grid = ParameterGrid::new();
        grid.add_measurement_parameter(Axis::Y, &[1.0, 2.0]).unwrap();
        grid.add_measurement_parameter(Axis::X, &[10.0, 20.0, 30.0]).unwrap();
        grid.add_measurement_parameter(Axis::Wl, &[400.0, 500.0]).unwrap();
        assert_eq!(grid.len(), 12);
        for axis in [Axis::X, Axis::Y, Axis::Wl] {
            assert_eq!(grid.values(axis).unwrap().len(), 12);
        }
        assert_eq!(&grid.values(Axis::Y).unwrap()[..6], &[1.0; 6]);
        assert_eq!(
            &grid.values(Axis::X).unwrap()[..6],
            &[10.0, 10.0, 20.0, 20.0, 30.0, 30.0]
        );
        assert_eq!(
            &grid.values(Axis::Wl).unwrap()[..4],
            &[400.0, 500.0, 400.0, 500.0]
        );
    }

    #[test]
    fn test_grid_is_deterministic() {
        let build = || {
            let mut grid = ParameterGrid::new();
            grid.add_measurement_parameter(Axis::Y, &[3.0, 1.0]).unwrap();
            grid.add_measurement_parameter(Axis::X, &[5.0]).unwrap();
            grid
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_grid_rejects_empty_and_duplicate_axes() {
        let mut grid = ParameterGrid::new();
        assert!(grid.add_measurement_parameter(Axis::X, &[]).is_err());
        grid.add_measurement_parameter(Axis::X, &[1.0]).unwrap();
        assert!(grid.add_measurement_parameter(Axis::X, &[2.0]).is_err());
    }

    #[test]
    fn test_transmission_schedule() {
        let x = layout(vec![5.0, 15.0]);
        let y = layout(vec![50.0, 60.0]);
        let schedule = Schedule::build(ExperimentKind::Transmission, Some(&x), Some(&y), &[]).unwrap();
        assert_eq!(schedule.len(), 6);

        let groups: Vec<String> = (0..6).map(|k| schedule.point(k).unwrap().group).collect();
        assert_eq!(groups, vec!["dark", "lamp", "x1y1", "x2y1", "x1y2", "x2y2"]);

        let dark = schedule.point(0).unwrap();
        assert_eq!((dark.x, dark.y), (Some(20.0), Some(68.0)));
        let lamp = schedule.point(1).unwrap();
        assert_eq!(lamp.kind, PointKind::Lamp);
        assert_eq!((lamp.x, lamp.y), (Some(0.0), Some(0.0)));
        assert!(schedule.point(6).is_none());
    }

    #[test]
    fn test_single_position_still_has_references() {
        let x = layout(vec![12.0]);
        let y = layout(vec![40.0]);
        let schedule = Schedule::build(ExperimentKind::Transmission, Some(&x), Some(&y), &[]).unwrap();
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.point(2).unwrap().group, "x1y1");
    }

    #[test]
    fn test_excitation_emission_schedule() {
        let x = layout(vec![12.0]);
        let y = layout(vec![40.0]);
        let schedule = Schedule::build(
            ExperimentKind::ExcitationEmission,
            Some(&x),
            Some(&y),
            &[400.0, 450.0, 500.0],
        )
        .unwrap();
        assert_eq!(schedule.len(), 4);
        assert_eq!(schedule.excitation_wavelengths(), &[400.0, 450.0, 500.0]);

        let dark = schedule.point(0).unwrap();
        assert_eq!(dark.wavelength, Some(DARK_WAVELENGTH));
        assert_eq!(dark.wavelength_slice, Some(0));
        for (k, wl) in [(1, 400.0), (2, 450.0), (3, 500.0)] {
            let point = schedule.point(k).unwrap();
            assert_eq!(point.group, "x1y1");
            assert_eq!(point.wavelength, Some(wl));
            assert_eq!(point.wavelength_slice, Some(k - 1));
        }
    }

    #[test]
    fn test_decay_schedule_revisits_positions_per_wavelength() {
        let x = layout(vec![12.0]);
        let y = layout(vec![30.0, 50.0]);
        let schedule =
            Schedule::build(ExperimentKind::Decay, Some(&x), Some(&y), &[600.0, 532.0]).unwrap();
        assert_eq!(schedule.len(), 5);
        let points: Vec<(String, Option<usize>)> = (1..5)
            .map(|k| {
                let p = schedule.point(k).unwrap();
                (p.group, p.wavelength_slice)
            })
            .collect();
        // Slices follow the sorted wavelength order, not the scan order.
        assert_eq!(
            points,
            vec![
                ("x1y1".to_string(), Some(1)),
                ("x1y1".to_string(), Some(0)),
                ("x1y2".to_string(), Some(1)),
                ("x1y2".to_string(), Some(0)),
            ]
        );
    }

    #[test]
    fn test_calibration_schedule_is_wavelengths_only() {
        let schedule =
            Schedule::build(ExperimentKind::Calibration, None, None, &[250.0, 260.0, 270.0]).unwrap();
        assert_eq!(schedule.len(), 3);
        let first = schedule.point(0).unwrap();
        assert_eq!(first.kind, PointKind::Sample);
        assert_eq!(first.x, None);
        assert_eq!(first.wavelength, Some(250.0));
    }

    #[test]
    fn test_invalid_wavelength_rejected() {
        let x = layout(vec![12.0]);
        let y = layout(vec![40.0]);
        assert!(Schedule::build(ExperimentKind::Decay, Some(&x), Some(&y), &[-5.0]).is_err());
        assert!(Schedule::build(ExperimentKind::Decay, Some(&x), Some(&y), &[]).is_err());
        assert!(Schedule::build(ExperimentKind::Transmission, None, Some(&y), &[]).is_err());
    }

    #[test]
    fn test_duplicate_wavelengths_rejected() {
        let x = layout(vec![12.0]);
        let y = layout(vec![40.0]);
        let result = Schedule::build(ExperimentKind::Decay, Some(&x), Some(&y), &[400.0, 400.0]);
        assert!(matches!(result, Err(DaqError::InvalidInput(_))));

        let result = Schedule::build(
            ExperimentKind::ExcitationEmission,
            Some(&x),
            Some(&y),
            &[450.0, 400.0, 450.0000000001],
        );
        assert!(matches!(result, Err(DaqError::InvalidInput(_))));

        assert!(ensure_distinct_wavelengths(&[400.0, 400.001]).is_ok());
    }
}
