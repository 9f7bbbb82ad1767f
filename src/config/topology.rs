//! Static bench topology (`config_main.yaml`).
//!
//! Maps UI pages to experiments, experiments to their instruments and widgets, and
//! substrate keys to sample-holder geometry.

use crate::core::InstrumentName;
use crate::error::{AppResult, DaqError};
use crate::experiment::geometry::AxisGeometry;
use crate::experiment::ExperimentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Sample-holder geometry of one substrate (mm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstrateGeometry {
    /// Holder-to-sample offset along x.
    pub dfhx: f64,
    /// Holder-to-sample offset along y.
    pub dfhy: f64,
    /// Effective sample width.
    pub ws: f64,
    /// Effective sample height.
    pub hs: f64,
    /// Total sample-holder width.
    pub whse: f64,
    /// Total sample-holder height.
    pub hhse: f64,
    /// Stage coordinates of the light source per experiment.
    #[serde(default)]
    pub lightsource: BTreeMap<ExperimentKind, [f64; 2]>,
}

impl SubstrateGeometry {
    /// x and y axis geometry as seen by the light source of `kind`.
    pub fn axes(&self, kind: ExperimentKind) -> AppResult<(AxisGeometry, AxisGeometry)> {
        let [origin_x, origin_y] = self.lightsource.get(&kind).copied().ok_or_else(|| {
            DaqError::Configuration(format!("Substrate has no lightsource origin for {}", kind))
        })?;
        Ok((
            AxisGeometry {
                start: origin_x + self.dfhx,
                sse: self.whse,
                ss: self.ws,
            },
            AxisGeometry {
                start: origin_y + self.dfhy,
                sse: self.hhse,
                ss: self.hs,
            },
        ))
    }
}

/// Parsed `config_main.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// UI page index to experiment.
    pub experiments: BTreeMap<u32, ExperimentKind>,
    /// Instruments required per experiment.
    pub instruments: BTreeMap<ExperimentKind, Vec<InstrumentName>>,
    /// Live-view widgets per experiment.
    #[serde(default)]
    pub widgets: BTreeMap<ExperimentKind, BTreeMap<String, InstrumentName>>,
    /// Substrate geometries by key.
    pub substrates: BTreeMap<String, SubstrateGeometry>,
    /// UI presentation hints, carried through untouched.
    #[serde(default)]
    pub instrument_pages: serde_yaml::Value,
}

impl Topology {
    /// Load and validate a topology file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate topology YAML.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        let topology: Self = serde_yaml::from_str(text)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Semantic checks beyond the schema.
    pub fn validate(&self) -> AppResult<()> {
        for (kind, widgets) in &self.widgets {
            let required = self.instruments_for(*kind);
            for (widget, instrument) in widgets {
                if !required.contains(instrument) {
                    return Err(DaqError::Configuration(format!(
                        "Widget '{}' of {} shows {}, which {} does not use",
                        widget, kind, instrument, kind
                    )));
                }
            }
        }
        for (key, substrate) in &self.substrates {
            if substrate.ws <= 4.0 || substrate.hs <= 4.0 {
                return Err(DaqError::Configuration(format!(
                    "Substrate '{}' is too small for the 4 mm beam ({} x {} mm)",
                    key, substrate.ws, substrate.hs
                )));
            }
            if substrate.whse < substrate.ws || substrate.hhse < substrate.hs {
                return Err(DaqError::Configuration(format!(
                    "Substrate '{}' is larger than its holder",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Instruments needed by `kind`.
    pub fn instruments_for(&self, kind: ExperimentKind) -> Vec<InstrumentName> {
        self.instruments
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_instruments())
    }

    /// Experiment shown on UI page `page`.
    pub fn experiment_for_page(&self, page: u32) -> Option<ExperimentKind> {
        self.experiments.get(&page).copied()
    }

    /// Geometry of `key`.
    pub fn substrate(&self, key: &str) -> AppResult<&SubstrateGeometry> {
        self.substrates
            .get(key)
            .ok_or_else(|| DaqError::InvalidInput(format!("Unknown substrate '{}'", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
experiments:
  0: transmission
  1: excitation_emission
instruments:
  transmission: [xystage, spectrometer, shuttercontrol]
  excitation_emission: [xystage, spectrometer, shuttercontrol, powermeter, laser]
widgets:
  transmission:
    spectrum_plot: spectrometer
substrates:
  quartz_25:
    dfhx: 1.0
    dfhy: 2.0
    ws: 24.0
    hs: 24.0
    whse: 30.0
    hhse: 30.0
    lightsource:
      transmission: [10.0, 20.0]
"#;

    #[test]
    fn test_parse_topology() {
        let topology = Topology::from_yaml(TOPOLOGY).unwrap();
        assert_eq!(
            topology.experiment_for_page(1),
            Some(ExperimentKind::ExcitationEmission)
        );
        assert_eq!(
            topology.instruments_for(ExperimentKind::Transmission),
            vec![
                InstrumentName::XyStage,
                InstrumentName::Spectrometer,
                InstrumentName::ShutterControl
            ]
        );
        // Not listed: falls back to the built-in set.
        assert_eq!(
            topology.instruments_for(ExperimentKind::Decay),
            ExperimentKind::Decay.default_instruments()
        );
    }

    #[test]
    fn test_substrate_axes() {
        let topology = Topology::from_yaml(TOPOLOGY).unwrap();
        let substrate = topology.substrate("quartz_25").unwrap();
        let (x, y) = substrate.axes(ExperimentKind::Transmission).unwrap();
        assert_eq!(x.start, 11.0);
        assert_eq!(y.start, 22.0);
        assert_eq!(x.sse, 30.0);
        assert!(substrate.axes(ExperimentKind::Decay).is_err());
        assert!(topology.substrate("sapphire").is_err());
    }

    #[test]
    fn test_widget_must_use_required_instrument() {
        let bad = TOPOLOGY.replace("spectrum_plot: spectrometer", "power_plot: powermeter");
        assert!(matches!(
            Topology::from_yaml(&bad),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_instrument_name_rejected() {
        let bad = TOPOLOGY.replace("[xystage, spectrometer, shuttercontrol]", "[camera]");
        assert!(Topology::from_yaml(&bad).is_err());
    }
}
