//! Snapshot of the user's settings (`settings_ui.yaml`).
//!
//! One section per experiment plus `general`. The orchestrator reads the snapshot on
//! entering `parsing configuration`; the UI may replace it at any time before that.

use crate::core::{DigitizerConfig, EnergyLevel};
use crate::error::{AppResult, DaqError};
use crate::experiment::geometry::AxisInput;
use crate::experiment::ExperimentKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run-independent settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub sample: String,
    pub comment: String,
    pub substrate: String,
    pub filter_excitation: String,
    pub filter_emission: String,
}

/// Position grid in percent edge offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSettings {
    pub xnum: usize,
    pub ynum: usize,
    pub x_off_left: f64,
    pub x_off_right: f64,
    pub y_off_top: f64,
    pub y_off_bottom: f64,
}

impl Default for PositionSettings {
    fn default() -> Self {
        Self {
            xnum: 1,
            ynum: 1,
            x_off_left: 0.0,
            x_off_right: 0.0,
            y_off_top: 0.0,
            y_off_bottom: 0.0,
        }
    }
}

impl PositionSettings {
    /// x axis input (near edge = left).
    pub fn x_input(&self) -> AxisInput {
        AxisInput {
            num: self.xnum,
            off1: self.x_off_left,
            off2: self.x_off_right,
        }
    }

    /// y axis input (near edge = top).
    pub fn y_input(&self) -> AxisInput {
        AxisInput {
            num: self.ynum,
            off1: self.y_off_top,
            off2: self.y_off_bottom,
        }
    }
}

/// Spectrometer acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrometerSettings {
    /// Integration time per exposure (ms).
    pub integration_time_ms: f64,
    /// Exposures averaged per point.
    pub averaging: u32,
}

impl Default for SpectrometerSettings {
    fn default() -> Self {
        Self {
            integration_time_ms: 100.0,
            averaging: 1,
        }
    }
}

impl SpectrometerSettings {
    fn validate(&self) -> AppResult<()> {
        if self.integration_time_ms.is_nan() || self.integration_time_ms <= 0.0 {
            return Err(DaqError::InvalidInput(format!(
                "Integration time must be positive, got {} ms",
                self.integration_time_ms
            )));
        }
        if self.averaging == 0 {
            return Err(DaqError::InvalidInput(
                "Averaging must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Upper bound on the number of excitation wavelengths in one run.
pub const MAX_WAVELENGTHS: usize = 10_000;

fn too_many_wavelengths(count: f64) -> DaqError {
    DaqError::InvalidInput(format!(
        "Wavelength selection yields {} points, at most {} are allowed",
        count, MAX_WAVELENGTHS
    ))
}

/// Excitation wavelengths, either explicit or as an inclusive range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Wavelengths {
    List(Vec<f64>),
    Range { start: f64, stop: f64, step: f64 },
}

impl Default for Wavelengths {
    fn default() -> Self {
        Wavelengths::List(Vec::new())
    }
}

impl Wavelengths {
    /// Expanded wavelengths in nm.
    pub fn values(&self) -> AppResult<Vec<f64>> {
        match self {
            Wavelengths::List(values) => {
                if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
                    return Err(DaqError::InvalidInput(format!(
                        "Invalid excitation wavelength {}",
                        bad
                    )));
                }
                if values.len() > MAX_WAVELENGTHS {
                    return Err(too_many_wavelengths(values.len() as f64));
                }
                Ok(values.clone())
            }
            Wavelengths::Range { start, stop, step } => {
                let finite = start.is_finite() && stop.is_finite() && step.is_finite();
                if !finite || *step <= 0.0 || stop < start {
                    return Err(DaqError::InvalidInput(format!(
                        "Invalid wavelength range {}..{} step {}",
                        start, stop, step
                    )));
                }
                let span = ((stop - start) / step + 1e-9).floor();
                if !span.is_finite() || span + 1.0 > MAX_WAVELENGTHS as f64 {
                    return Err(too_many_wavelengths(span + 1.0));
                }
                let count = span as usize + 1;
                Ok((0..count)
                    .map(|i| ((start + step * i as f64) * 1e6).round() / 1e6)
                    .collect())
            }
        }
    }

    /// `(start, step, stop)` as used in calibration file names.
    pub fn bounds(&self) -> AppResult<(f64, f64, f64)> {
        let values = self.values()?;
        let start = values.first().copied().unwrap_or(0.0);
        let stop = values.last().copied().unwrap_or(0.0);
        let step = match self {
            Wavelengths::Range { step, .. } => *step,
            Wavelengths::List(_) if values.len() > 1 => values[1] - values[0],
            Wavelengths::List(_) => 0.0,
        };
        Ok((start, step, stop))
    }
}

/// Transmission section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmissionSettings {
    pub positions: PositionSettings,
    pub spectrometer: SpectrometerSettings,
}

/// Excitation-emission section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcitationEmissionSettings {
    pub positions: PositionSettings,
    pub spectrometer: SpectrometerSettings,
    pub wl: Wavelengths,
    pub energy_level: EnergyLevel,
    /// Calibration CSV embedded as `calibration_beamsplitter`.
    pub calibration_file: Option<PathBuf>,
}

impl Default for ExcitationEmissionSettings {
    fn default() -> Self {
        Self {
            positions: PositionSettings::default(),
            spectrometer: SpectrometerSettings::default(),
            wl: Wavelengths::default(),
            energy_level: EnergyLevel::Adjust,
            calibration_file: None,
        }
    }
}

/// Decay section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecaySettings {
    pub positions: PositionSettings,
    pub wl: Wavelengths,
    pub energy_level: EnergyLevel,
    pub digitizer: DigitizerConfig,
}

impl Default for DecaySettings {
    fn default() -> Self {
        Self {
            positions: PositionSettings::default(),
            wl: Wavelengths::default(),
            energy_level: EnergyLevel::Adjust,
            digitizer: DigitizerConfig::default(),
        }
    }
}

/// Beamsplitter calibration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub wl: Wavelengths,
    pub beamsplitter: String,
    pub energy_level: EnergyLevel,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            wl: Wavelengths::default(),
            beamsplitter: "beamsplitter".to_string(),
            energy_level: EnergyLevel::Max,
        }
    }
}

/// Parsed `settings_ui.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSettings {
    pub general: GeneralSettings,
    pub transmission: TransmissionSettings,
    pub excitation_emission: ExcitationEmissionSettings,
    pub decay: DecaySettings,
    pub calibration: CalibrationSettings,
}

impl UiSettings {
    /// Load a settings snapshot.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Position section of `kind`, if it scans positions.
    pub fn positions(&self, kind: ExperimentKind) -> Option<&PositionSettings> {
        match kind {
            ExperimentKind::Transmission => Some(&self.transmission.positions),
            ExperimentKind::ExcitationEmission => Some(&self.excitation_emission.positions),
            ExperimentKind::Decay => Some(&self.decay.positions),
            ExperimentKind::Calibration => None,
        }
    }

    /// Expanded excitation wavelengths of `kind` (empty for transmission).
    pub fn wavelengths(&self, kind: ExperimentKind) -> AppResult<Vec<f64>> {
        match kind {
            ExperimentKind::Transmission => Ok(Vec::new()),
            ExperimentKind::ExcitationEmission => self.excitation_emission.wl.values(),
            ExperimentKind::Decay => self.decay.wl.values(),
            ExperimentKind::Calibration => self.calibration.wl.values(),
        }
    }

    /// Spectrometer settings used by `kind`.
    pub fn spectrometer(&self, kind: ExperimentKind) -> Option<&SpectrometerSettings> {
        match kind {
            ExperimentKind::Transmission => Some(&self.transmission.spectrometer),
            ExperimentKind::ExcitationEmission => Some(&self.excitation_emission.spectrometer),
            _ => None,
        }
    }

    /// Laser energy level used by `kind`.
    pub fn energy_level(&self, kind: ExperimentKind) -> EnergyLevel {
        match kind {
            ExperimentKind::Transmission => EnergyLevel::Off,
            ExperimentKind::ExcitationEmission => self.excitation_emission.energy_level,
            ExperimentKind::Decay => self.decay.energy_level,
            ExperimentKind::Calibration => self.calibration.energy_level,
        }
    }

    /// Checks that only matter once a run of `kind` is parsed.
    pub fn validate_for(&self, kind: ExperimentKind) -> AppResult<()> {
        if let Some(spectrometer) = self.spectrometer(kind) {
            spectrometer.validate()?;
        }
        if kind.has_wavelength_axis() {
            let wavelengths = self.wavelengths(kind)?;
            if wavelengths.is_empty() {
                return Err(DaqError::InvalidInput(format!(
                    "{} needs at least one excitation wavelength",
                    kind
                )));
            }
            crate::experiment::grid::ensure_distinct_wavelengths(&wavelengths)?;
        }
        if kind == ExperimentKind::Decay {
            let digitizer = &self.decay.digitizer;
            if digitizer.record_length == 0 || digitizer.channels.is_empty() {
                return Err(DaqError::InvalidInput(
                    "Digitizer needs a record length and at least one channel".to_string(),
                ));
            }
            if digitizer.post_trigger_size > 100 {
                return Err(DaqError::InvalidInput(format!(
                    "Post-trigger size {}% exceeds 100%",
                    digitizer.post_trigger_size
                )));
            }
        }
        if kind.scans_positions() && self.general.substrate.is_empty() {
            return Err(DaqError::InvalidInput("No substrate selected".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MeasurementMode;

    const SETTINGS: &str = r#"
general:
  sample: quartz
  substrate: quartz_25
transmission:
  positions: { xnum: 2, ynum: 2 }
  spectrometer: { integration_time_ms: 100, averaging: 1 }
excitation_emission:
  wl: [400, 450, 500]
  energy_level: adjust
decay:
  wl: { start: 532, stop: 600, step: 68 }
  digitizer:
    record_length: 512
    measurement_mode: averageing
calibration:
  wl: { start: 250, stop: 270, step: 10 }
  beamsplitter: bs50
"#;

    #[test]
    fn test_parse_settings() {
        let ui: UiSettings = serde_yaml::from_str(SETTINGS).unwrap();
        assert_eq!(ui.transmission.positions.xnum, 2);
        assert_eq!(ui.transmission.positions.x_off_left, 0.0);
        assert_eq!(
            ui.wavelengths(ExperimentKind::ExcitationEmission).unwrap(),
            vec![400.0, 450.0, 500.0]
        );
        assert_eq!(
            ui.wavelengths(ExperimentKind::Decay).unwrap(),
            vec![532.0, 600.0]
        );
        assert_eq!(ui.decay.digitizer.record_length, 512);
        assert_eq!(ui.decay.digitizer.measurement_mode, MeasurementMode::Averaging);
        assert_eq!(ui.energy_level(ExperimentKind::Calibration), EnergyLevel::Max);
        for kind in ExperimentKind::ALL {
            ui.validate_for(kind).unwrap();
        }
    }

    #[test]
    fn test_range_bounds() {
        let wl = Wavelengths::Range {
            start: 250.0,
            stop: 270.0,
            step: 10.0,
        };
        assert_eq!(wl.values().unwrap(), vec![250.0, 260.0, 270.0]);
        assert_eq!(wl.bounds().unwrap(), (250.0, 10.0, 270.0));

        let bad = Wavelengths::Range {
            start: 300.0,
            stop: 200.0,
            step: 10.0,
        };
        assert!(bad.values().is_err());
    }

    #[test]
    fn test_validation_catches_bad_input() {
        let mut ui: UiSettings = serde_yaml::from_str(SETTINGS).unwrap();
        ui.transmission.spectrometer.averaging = 0;
        assert!(matches!(
            ui.validate_for(ExperimentKind::Transmission),
            Err(DaqError::InvalidInput(_))
        ));

        let mut ui: UiSettings = serde_yaml::from_str(SETTINGS).unwrap();
        ui.excitation_emission.wl = Wavelengths::List(vec![]);
        assert!(ui.validate_for(ExperimentKind::ExcitationEmission).is_err());

        let mut ui: UiSettings = serde_yaml::from_str(SETTINGS).unwrap();
        ui.excitation_emission.wl = Wavelengths::List(vec![400.0, 450.0, 400.0]);
        assert!(matches!(
            ui.validate_for(ExperimentKind::ExcitationEmission),
            Err(DaqError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_non_finite_range_rejected() {
        let wl = Wavelengths::Range {
            start: 400.0,
            stop: f64::INFINITY,
            step: 10.0,
        };
        assert!(matches!(wl.values(), Err(DaqError::InvalidInput(_))));

        let wl = Wavelengths::Range {
            start: f64::NAN,
            stop: 500.0,
            step: 10.0,
        };
        assert!(matches!(wl.values(), Err(DaqError::InvalidInput(_))));

        let wl = Wavelengths::List(vec![400.0, f64::INFINITY]);
        assert!(matches!(wl.values(), Err(DaqError::InvalidInput(_))));
    }

    #[test]
    fn test_oversized_range_rejected() {
        let wl = Wavelengths::Range {
            start: 0.0,
            stop: 1e12,
            step: 1e-3,
        };
        assert!(matches!(wl.values(), Err(DaqError::InvalidInput(_))));

        let at_limit = Wavelengths::Range {
            start: 1.0,
            stop: MAX_WAVELENGTHS as f64,
            step: 1.0,
        };
        assert_eq!(at_limit.values().unwrap().len(), MAX_WAVELENGTHS);
    }
}
