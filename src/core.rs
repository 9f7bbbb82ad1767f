//! Core traits and data types for the bench (instrument contract).
//!
//! This module defines the abstractions the orchestrator depends on. Vendor drivers
//! are out of scope; anything that implements these traits can be scheduled.
//!
//! # Architecture Overview
//!
//! - [`Instrument`]: base trait with lifecycle (`connect`/`disconnect`) and `measure`
//! - [`XyStage`], [`Spectrometer`], [`ShutterControl`], [`PowerMeter`], [`Laser`],
//!   [`Digitizer`]: capability traits for the six bench instruments
//! - [`Driver`]: closed set of boxed capability objects owned by an instrument worker
//! - [`MeasurementData`]: typed result of one `measure()` call
//! - [`InstrumentEvent`]: typed completion records delivered to the orchestrator queue
//!
//! # Event Flow
//!
//! ```text
//! worker task --[InstrumentEvent]--> EventSink --> orchestrator queue (single consumer)
//! ```
//!
//! # Thread Safety
//!
//! Drivers are `Send`: each one is moved into its own worker task and never shared.
//! Concurrent callers of one driver are serialized by that worker's command queue.

use crate::data::Attributes;
use crate::error::{AppResult, DaqError};
use crate::messages::OrchestratorMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Names and simple value types
// =============================================================================

/// Stable instrument names used in configuration files, events and datasets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentName {
    XyStage,
    Spectrometer,
    ShutterControl,
    PowerMeter,
    Laser,
    Digitizer,
}

impl InstrumentName {
    /// Every instrument the bench knows about.
    pub const ALL: [InstrumentName; 6] = [
        InstrumentName::XyStage,
        InstrumentName::Spectrometer,
        InstrumentName::ShutterControl,
        InstrumentName::PowerMeter,
        InstrumentName::Laser,
        InstrumentName::Digitizer,
    ];

    /// Configuration-file spelling of the name.
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentName::XyStage => "xystage",
            InstrumentName::Spectrometer => "spectrometer",
            InstrumentName::ShutterControl => "shuttercontrol",
            InstrumentName::PowerMeter => "powermeter",
            InstrumentName::Laser => "laser",
            InstrumentName::Digitizer => "digitizer",
        }
    }
}

impl fmt::Display for InstrumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentName {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InstrumentName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown instrument '{}'", s)))
    }
}

/// Instrument connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Pulsed-laser energy level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyLevel {
    #[default]
    Off,
    Adjust,
    Max,
}

impl EnergyLevel {
    /// Attribute spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnergyLevel::Off => "off",
            EnergyLevel::Adjust => "adjust",
            EnergyLevel::Max => "max",
        }
    }
}

/// How the digitizer reduces a burst of pulses into one record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MeasurementMode {
    /// Average the normalized waveforms.
    #[default]
    #[serde(rename = "averageing", alias = "averaging")]
    Averaging,
    /// Histogram threshold crossings (single-photon counting).
    #[serde(rename = "counting")]
    Counting,
}

impl MeasurementMode {
    /// Attribute spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementMode::Averaging => "averageing",
            MeasurementMode::Counting => "counting",
        }
    }
}

/// Digitizer acquisition parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitizerConfig {
    /// Samples per record.
    pub record_length: usize,
    /// Post-trigger size in percent of the record.
    pub post_trigger_size: u32,
    /// DC offset in percent of full scale.
    pub dc_offset: f64,
    /// Active channel indices.
    pub channels: Vec<u8>,
    /// Reduction mode.
    pub measurement_mode: MeasurementMode,
    /// Channel used for trigger jitter correction.
    pub jitter_channel: Option<u8>,
    /// Single-photon threshold in normalized ADC counts.
    pub threshold: f64,
    /// Pulses accumulated per `measure()`.
    pub pulses: u32,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        Self {
            record_length: 1024,
            post_trigger_size: 90,
            dc_offset: 10.0,
            channels: vec![0],
            measurement_mode: MeasurementMode::Averaging,
            jitter_channel: None,
            threshold: 0.5,
            pulses: 1000,
        }
    }
}

// =============================================================================
// Measurement data and events
// =============================================================================

/// Typed result of one `measure()` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MeasurementData {
    /// Averaged spectrum with the start/stop time of every averaged exposure.
    Spectrum {
        wavelengths: Vec<f64>,
        intensities: Vec<f64>,
        interval_times: Vec<f64>,
    },
    /// Series of power readings taken during one integration window.
    Power { powers: Vec<f64>, times: Vec<f64> },
    /// Processed digitizer record in normalized ADC counts.
    Pulses { samples: Vec<f64> },
    /// Stage readback in mm.
    Position { x: f64, y: f64 },
    /// Laser state readback.
    Laser {
        wavelength_nm: Option<f64>,
        energy: EnergyLevel,
    },
    /// Shutter state readback.
    Shutter { open: bool },
}

/// Why a measurement was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeasureOrigin {
    /// Live readout scheduled by the alignment poller.
    Poll,
    /// Point `index` of run `run`.
    Run { run: u64, index: usize },
}

/// Completion records delivered from instrument workers to the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrumentEvent {
    /// The stage reached its commanded position and stopped.
    StageSettled { x: f64, y: f64 },
    /// The laser finished tuning and its output is stable.
    LaserStable { wavelength_nm: f64 },
    /// The laser wavelength changed (alignment tracking).
    LaserWavelengthChanged { wavelength_nm: f64 },
    /// The spectrometer drained its buffer and starts the exposures of this measurement.
    CacheCleared,
    /// A `measure()` finished.
    MeasurementDone {
        instrument: InstrumentName,
        origin: MeasureOrigin,
        data: MeasurementData,
    },
    /// A command failed on the instrument's own context.
    Failed {
        instrument: InstrumentName,
        operation: String,
        error: String,
        timeout: bool,
    },
}

/// Producer side of the orchestrator queue handed to drivers and workers.
#[derive(Clone, Debug)]
pub struct EventSink {
    instrument: InstrumentName,
    tx: mpsc::UnboundedSender<OrchestratorMessage>,
}

impl EventSink {
    /// Creates a sink tagged with the emitting instrument.
    pub fn new(instrument: InstrumentName, tx: mpsc::UnboundedSender<OrchestratorMessage>) -> Self {
        Self { instrument, tx }
    }

    /// Instrument this sink belongs to.
    pub fn instrument(&self) -> InstrumentName {
        self.instrument
    }

    /// Delivers an event. A closed queue means the orchestrator is gone; the event is dropped.
    pub fn emit(&self, event: InstrumentEvent) {
        if self.tx.send(OrchestratorMessage::Instrument(event)).is_err() {
            tracing::trace!(instrument = %self.instrument, "Orchestrator queue closed, event dropped");
        }
    }
}

// =============================================================================
// Driver traits
// =============================================================================

/// Base trait for all bench instruments.
///
/// `measure()` may take as long as the hardware needs; the worker that owns the driver
/// enforces the communication timeout around it.
#[async_trait]
pub trait Instrument: Send {
    /// Stable instrument name.
    fn name(&self) -> InstrumentName;

    /// Open the device.
    async fn connect(&mut self) -> AppResult<()>;

    /// Release the device.
    async fn disconnect(&mut self) -> AppResult<()>;

    /// Take one logical measurement.
    ///
    /// Drivers may emit intermediate events (the spectrometer's `CacheCleared`) on `events`.
    async fn measure(&mut self, events: &EventSink) -> AppResult<MeasurementData>;

    /// Return to the settings used for live alignment.
    async fn reset_to_alignment_defaults(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Instrument-specific attributes persisted under `settings/<name>`.
    fn describe(&self) -> Attributes {
        Attributes::new()
    }
}

/// Motorized XY stage.
#[async_trait]
pub trait XyStage: Instrument {
    /// Move to an absolute position in mm; returns once the stage has settled.
    async fn move_to(&mut self, x: f64, y: f64) -> AppResult<()>;

    /// Read back the current position in mm.
    async fn position(&mut self) -> AppResult<(f64, f64)>;

    /// Stop both motors immediately.
    async fn stop_motors(&mut self) -> AppResult<()>;
}

/// Array spectrometer.
#[async_trait]
pub trait Spectrometer: Instrument {
    /// Integration time per exposure in ms.
    async fn set_integration_time(&mut self, ms: f64) -> AppResult<()>;

    /// Number of exposures averaged per measurement.
    async fn set_averaging(&mut self, count: u32) -> AppResult<()>;

    /// Emission wavelength axis in nm.
    fn wavelengths(&self) -> Vec<f64>;

    /// Forget stored dark/lamp references and leave transmission mode.
    async fn clear_references(&mut self) -> AppResult<()>;
}

/// Lamp / beam shutter.
#[async_trait]
pub trait ShutterControl: Instrument {
    /// Open the shutter.
    async fn open(&mut self) -> AppResult<()>;

    /// Close the shutter.
    async fn close(&mut self) -> AppResult<()>;
}

/// Optical power meter.
#[async_trait]
pub trait PowerMeter: Instrument {
    /// Wavelength used for the responsivity correction (nm).
    async fn set_wavelength(&mut self, nm: f64) -> AppResult<()>;

    /// Length of the integration window in ms.
    async fn set_integration_time(&mut self, ms: f64) -> AppResult<()>;

    /// Number of readings returned by one `measure()`.
    fn measurements_multiple(&self) -> usize;
}

/// Tunable pulsed laser.
#[async_trait]
pub trait Laser: Instrument {
    /// Tune to `nm`; returns once the output is stable.
    async fn set_wavelength(&mut self, nm: f64) -> AppResult<()>;

    /// Set the output energy level.
    async fn set_energy_level(&mut self, level: EnergyLevel) -> AppResult<()>;
}

/// High-speed waveform digitizer.
#[async_trait]
pub trait Digitizer: Instrument {
    /// Apply acquisition parameters.
    async fn configure(&mut self, config: &DigitizerConfig) -> AppResult<()>;

    /// Clear accumulated waveforms / histograms.
    async fn clear_accumulators(&mut self) -> AppResult<()>;

    /// Produce short bursts for live alignment: `pulses` per `measure()`, bounded by `budget`.
    async fn configure_alignment(&mut self, pulses: u32, budget: Duration) -> AppResult<()>;

    /// Samples per record.
    fn record_length(&self) -> usize;
}

/// A driver as owned by its worker.
pub enum Driver {
    XyStage(Box<dyn XyStage>),
    Spectrometer(Box<dyn Spectrometer>),
    ShutterControl(Box<dyn ShutterControl>),
    PowerMeter(Box<dyn PowerMeter>),
    Laser(Box<dyn Laser>),
    Digitizer(Box<dyn Digitizer>),
}

macro_rules! with_instrument {
    ($driver:expr, $d:ident => $body:expr) => {
        match $driver {
            Driver::XyStage($d) => $body,
            Driver::Spectrometer($d) => $body,
            Driver::ShutterControl($d) => $body,
            Driver::PowerMeter($d) => $body,
            Driver::Laser($d) => $body,
            Driver::Digitizer($d) => $body,
        }
    };
}

impl Driver {
    /// Name of the wrapped instrument.
    pub fn name(&self) -> InstrumentName {
        with_instrument!(self, d => d.name())
    }

    /// See [`Instrument::connect`].
    pub async fn connect(&mut self) -> AppResult<()> {
        with_instrument!(self, d => d.connect().await)
    }

    /// See [`Instrument::disconnect`].
    pub async fn disconnect(&mut self) -> AppResult<()> {
        with_instrument!(self, d => d.disconnect().await)
    }

    /// See [`Instrument::measure`].
    pub async fn measure(&mut self, events: &EventSink) -> AppResult<MeasurementData> {
        with_instrument!(self, d => d.measure(events).await)
    }

    /// See [`Instrument::reset_to_alignment_defaults`].
    pub async fn reset_to_alignment_defaults(&mut self) -> AppResult<()> {
        with_instrument!(self, d => d.reset_to_alignment_defaults().await)
    }

    /// See [`Instrument::describe`].
    pub fn describe(&self) -> Attributes {
        with_instrument!(self, d => d.describe())
    }
}
