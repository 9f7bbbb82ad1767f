//! Experiment kinds and schedule construction.
//!
//! An [`ExperimentKind`] selects the instrument set, the grid schema, the dataset
//! schema and the synchronization wiring of a run. The [`grid`] module expands the
//! user's scan axes into the ordered [`grid::Schedule`]; [`geometry`] turns percent
//! edge offsets into stage coordinates.

pub mod geometry;
pub mod grid;

use crate::core::InstrumentName;
use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of acquisition run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    /// Broadband lamp through the sample into the spectrometer.
    Transmission,
    /// Tunable laser excitation, emission spectra plus excitation power.
    ExcitationEmission,
    /// Time-resolved photoluminescence on the digitizer.
    Decay,
    /// Two-position beamsplitter power sweep.
    Calibration,
}

impl ExperimentKind {
    /// Every experiment kind.
    pub const ALL: [ExperimentKind; 4] = [
        ExperimentKind::Transmission,
        ExperimentKind::ExcitationEmission,
        ExperimentKind::Decay,
        ExperimentKind::Calibration,
    ];

    /// Configuration-file spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::Transmission => "transmission",
            ExperimentKind::ExcitationEmission => "excitation_emission",
            ExperimentKind::Decay => "decay",
            ExperimentKind::Calibration => "calibration",
        }
    }

    /// Number of reference points prepended to the schedule.
    ///
    /// Used both when building the schedule and when deriving position indices.
    pub fn reference_points(&self) -> usize {
        match self {
            ExperimentKind::Transmission => 2,
            ExperimentKind::ExcitationEmission | ExperimentKind::Decay => 1,
            ExperimentKind::Calibration => 0,
        }
    }

    /// True if the schedule carries an excitation wavelength axis.
    pub fn has_wavelength_axis(&self) -> bool {
        !matches!(self, ExperimentKind::Transmission)
    }

    /// True if the schedule scans the XY stage over the sample.
    pub fn scans_positions(&self) -> bool {
        !matches!(self, ExperimentKind::Calibration)
    }

    /// Instruments a run of this kind needs when the topology does not say otherwise.
    pub fn default_instruments(&self) -> Vec<InstrumentName> {
        use InstrumentName::*;
        match self {
            ExperimentKind::Transmission => vec![XyStage, Spectrometer, ShutterControl],
            ExperimentKind::ExcitationEmission => {
                vec![XyStage, Spectrometer, ShutterControl, PowerMeter, Laser]
            }
            ExperimentKind::Decay => vec![XyStage, ShutterControl, Laser, Digitizer],
            ExperimentKind::Calibration => vec![XyStage, ShutterControl, PowerMeter, Laser],
        }
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentKind {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExperimentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown experiment '{}'", s)))
    }
}
