//! Mock Instrument Implementations
//!
//! Simulated versions of the six bench instruments. They produce noisy synthetic data
//! with plausible timing so the whole orchestrator can run without hardware, and they
//! carry failure injection for the scenarios the orchestrator must survive.
//!
//! # Available Mocks
//!
//! - `MockStage` - XY stage, 10 mm/s with 50 ms settling, optional transient readback failures
//! - `MockSpectrometer` - Gaussian emission line on a flat background
//! - `MockShutter` - 50 ms actuation
//! - `MockPowerMeter` - one reading every 100 ms of integration
//! - `MockLaser` - 500 ms tuning time, 210..2600 nm
//! - `MockDigitizer` - exponential decay sampled at 1 kHz pulse rate
//!
//! # Timing
//!
//! All delays are multiplied by [`MockOptions::time_scale`]; a scale of `0.0` makes
//! every call complete immediately (tests).
//!
//! All mocks use async-safe operations (`tokio::time::sleep`, not `std::thread::sleep`).

use crate::core::{
    Digitizer, DigitizerConfig, Driver, EnergyLevel, EventSink, Instrument, InstrumentEvent,
    InstrumentName, Laser, MeasurementData, MeasurementMode, PowerMeter, ShutterControl,
    Spectrometer, XyStage,
};
use crate::data::Attributes;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentRegistry;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

// =============================================================================
// Options and probe
// =============================================================================

/// Behaviour of the simulated instrument set.
#[derive(Clone, Debug)]
pub struct MockOptions {
    /// Factor applied to every simulated delay.
    pub time_scale: f64,
    /// Instruments whose `connect()` fails.
    pub fail_connect: Vec<InstrumentName>,
    /// Instruments whose `measure()` never returns.
    pub hang_measure: Vec<InstrumentName>,
    /// Number of stage position readbacks that fail before one succeeds.
    pub position_failures: usize,
    /// Spectrometer pixel count.
    pub pixels: usize,
    /// Shared call counters.
    pub probe: MockProbe,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            fail_connect: Vec::new(),
            hang_measure: Vec::new(),
            position_failures: 0,
            pixels: 256,
            probe: MockProbe::default(),
        }
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    counts: BTreeMap<(InstrumentName, &'static str), usize>,
    connected: BTreeMap<InstrumentName, bool>,
    log: Vec<(InstrumentName, &'static str)>,
    moves: Vec<(f64, f64)>,
}

/// Call counters shared by every mock created from the same [`MockOptions`].
#[derive(Clone, Debug, Default)]
pub struct MockProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl MockProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, name: InstrumentName, op: &'static str) {
        let mut state = self.lock();
        *state.counts.entry((name, op)).or_insert(0) += 1;
        state.log.push((name, op));
    }

    fn set_connected(&self, name: InstrumentName, connected: bool) {
        self.lock().connected.insert(name, connected);
    }

    /// How often `op` was called on `name`.
    pub fn count(&self, name: InstrumentName, op: &str) -> usize {
        self.lock()
            .counts
            .iter()
            .filter(|((n, o), _)| *n == name && *o == op)
            .map(|(_, count)| *count)
            .sum()
    }

    /// Connection state as last reported by the mock.
    pub fn is_connected(&self, name: InstrumentName) -> bool {
        self.lock().connected.get(&name).copied().unwrap_or(false)
    }

    /// Every call in order.
    pub fn log(&self) -> Vec<(InstrumentName, &'static str)> {
        self.lock().log.clone()
    }

    /// Stage targets in order.
    pub fn moves(&self) -> Vec<(f64, f64)> {
        self.lock().moves.clone()
    }
}

// =============================================================================
// Shared plumbing
// =============================================================================

struct MockCore {
    name: InstrumentName,
    options: MockOptions,
    connected: bool,
}

impl MockCore {
    fn new(name: InstrumentName, options: &MockOptions) -> Self {
        Self {
            name,
            options: options.clone(),
            connected: false,
        }
    }

    async fn delay(&self, secs: f64) {
        let scaled = secs * self.options.time_scale;
        if scaled > 0.0 {
            sleep(Duration::from_secs_f64(scaled)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    fn record(&self, op: &'static str) {
        self.options.probe.record(self.name, op);
    }

    fn ensure_connected(&self) -> AppResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(DaqError::instrument(self.name, "not connected"))
        }
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.record("connect");
        self.delay(0.1).await;
        if self.options.fail_connect.contains(&self.name) {
            return Err(DaqError::ConnectionFailed {
                instrument: self.name,
                reason: "simulated device not found".to_string(),
            });
        }
        self.connected = true;
        self.options.probe.set_connected(self.name, true);
        info!(instrument = %self.name, "Simulated instrument connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.record("disconnect");
        self.connected = false;
        self.options.probe.set_connected(self.name, false);
        Ok(())
    }

    async fn maybe_hang(&self) {
        if self.options.hang_measure.contains(&self.name) {
            debug!(instrument = %self.name, "Simulated measure hangs");
            std::future::pending::<()>().await;
        }
    }

    fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("model".into(), "simulated".into());
        attrs.insert("instrument".into(), self.name.as_str().into());
        attrs
    }
}

fn unix_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

// =============================================================================
// MockStage
// =============================================================================

/// Simulated XY stage.
pub struct MockStage {
    core: MockCore,
    position: (f64, f64),
    speed_mm_per_sec: f64,
    failures_left: usize,
}

impl MockStage {
    /// Stage at the origin.
    pub fn new(options: &MockOptions) -> Self {
        Self {
            core: MockCore::new(InstrumentName::XyStage, options),
            position: (0.0, 0.0),
            speed_mm_per_sec: 10.0,
            failures_left: options.position_failures,
        }
    }
}

#[async_trait]
impl Instrument for MockStage {
    fn name(&self) -> InstrumentName {
        self.core.name
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.core.disconnect().await
    }

    async fn measure(&mut self, _events: &EventSink) -> AppResult<MeasurementData> {
        self.core.ensure_connected()?;
        self.core.record("measure");
        self.core.maybe_hang().await;
        let (x, y) = self.position;
        Ok(MeasurementData::Position { x, y })
    }

    fn describe(&self) -> Attributes {
        let mut attrs = self.core.attributes();
        attrs.insert("speed_mm_per_s".into(), self.speed_mm_per_sec.into());
        attrs
    }
}

#[async_trait]
impl XyStage for MockStage {
    async fn move_to(&mut self, x: f64, y: f64) -> AppResult<()> {
        self.core.ensure_connected()?;
        self.core.record("move_to");
        self.core.options.probe.lock().moves.push((x, y));
        let (cx, cy) = self.position;
        let distance = (x - cx).abs().max((y - cy).abs());
        self.core.delay(distance / self.speed_mm_per_sec + 0.05).await;
        self.position = (x, y);
        Ok(())
    }

    async fn position(&mut self) -> AppResult<(f64, f64)> {
        self.core.ensure_connected()?;
        self.core.record("position");
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(DaqError::instrument(
                self.core.name,
                "position readback checksum mismatch",
            ));
        }
        Ok(self.position)
    }

    async fn stop_motors(&mut self) -> AppResult<()> {
        self.core.record("stop_motors");
        Ok(())
    }
}

// =============================================================================
// MockSpectrometer
// =============================================================================

/// Simulated array spectrometer.
pub struct MockSpectrometer {
    core: MockCore,
    wavelengths: Vec<f64>,
    integration_ms: f64,
    averaging: u32,
    rng: StdRng,
}

impl MockSpectrometer {
    /// Spectrometer covering 200..1000 nm.
    pub fn new(options: &MockOptions) -> Self {
        let pixels = options.pixels.max(2);
        let step = 800.0 / (pixels - 1) as f64;
        Self {
            core: MockCore::new(InstrumentName::Spectrometer, options),
            wavelengths: (0..pixels).map(|i| 200.0 + i as f64 * step).collect(),
            integration_ms: 100.0,
            averaging: 1,
            rng: StdRng::from_entropy(),
        }
    }

    fn exposure(&mut self) -> Vec<f64> {
        let rng = &mut self.rng;
        self.wavelengths
            .iter()
            .map(|wl| {
                let line = 4000.0 * (-((wl - 620.0) / 25.0).powi(2)).exp();
                100.0 + line + rng.gen_range(-10.0..10.0)
            })
            .collect()
    }
}

#[async_trait]
impl Instrument for MockSpectrometer {
    fn name(&self) -> InstrumentName {
        self.core.name
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.core.disconnect().await
    }

    async fn measure(&mut self, events: &EventSink) -> AppResult<MeasurementData> {
        self.core.ensure_connected()?;
        self.core.record("measure");
        events.emit(InstrumentEvent::CacheCleared);
        self.core.maybe_hang().await;

        let mut sum = vec![0.0; self.wavelengths.len()];
        let mut interval_times = Vec::with_capacity(2 * self.averaging as usize);
        for _ in 0..self.averaging {
            interval_times.push(unix_seconds());
            self.core.delay(self.integration_ms / 1000.0).await;
            for (acc, value) in sum.iter_mut().zip(self.exposure()) {
                *acc += value;
            }
            interval_times.push(unix_seconds());
        }
        let n = f64::from(self.averaging);
        Ok(MeasurementData::Spectrum {
            wavelengths: self.wavelengths.clone(),
            intensities: sum.into_iter().map(|v| v / n).collect(),
            interval_times,
        })
    }

    async fn reset_to_alignment_defaults(&mut self) -> AppResult<()> {
        self.core.record("reset_to_alignment_defaults");
        self.integration_ms = 100.0;
        self.averaging = 1;
        Ok(())
    }

    fn describe(&self) -> Attributes {
        let mut attrs = self.core.attributes();
        attrs.insert("integration_time_ms".into(), self.integration_ms.into());
        attrs.insert("averaging".into(), self.averaging.into());
        attrs.insert("pixels".into(), self.wavelengths.len().into());
        attrs
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn set_integration_time(&mut self, ms: f64) -> AppResult<()> {
        self.core.record("set_integration_time");
        if ms.is_nan() || ms <= 0.0 {
            return Err(DaqError::instrument(
                self.core.name,
                format!("invalid integration time {} ms", ms),
            ));
        }
        self.integration_ms = ms;
        Ok(())
    }

    async fn set_averaging(&mut self, count: u32) -> AppResult<()> {
        self.core.record("set_averaging");
        self.averaging = count.max(1);
        Ok(())
    }

    fn wavelengths(&self) -> Vec<f64> {
        self.wavelengths.clone()
    }

    async fn clear_references(&mut self) -> AppResult<()> {
        self.core.record("clear_references");
        Ok(())
    }
}

// =============================================================================
// MockShutter
// =============================================================================

/// Simulated shutter.
pub struct MockShutter {
    core: MockCore,
    open: bool,
}

impl MockShutter {
    /// Closed shutter.
    pub fn new(options: &MockOptions) -> Self {
        Self {
            core: MockCore::new(InstrumentName::ShutterControl, options),
            open: false,
        }
    }
}

#[async_trait]
impl Instrument for MockShutter {
    fn name(&self) -> InstrumentName {
        self.core.name
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.core.disconnect().await
    }

    async fn measure(&mut self, _events: &EventSink) -> AppResult<MeasurementData> {
        self.core.ensure_connected()?;
        self.core.record("measure");
        self.core.maybe_hang().await;
        Ok(MeasurementData::Shutter { open: self.open })
    }
}

#[async_trait]
impl ShutterControl for MockShutter {
    async fn open(&mut self) -> AppResult<()> {
        self.core.ensure_connected()?;
        self.core.record("open");
        self.core.delay(0.05).await;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.core.ensure_connected()?;
        self.core.record("close");
        self.core.delay(0.05).await;
        self.open = false;
        Ok(())
    }
}

// =============================================================================
// MockPowerMeter
// =============================================================================

/// Simulated optical power meter.
pub struct MockPowerMeter {
    core: MockCore,
    wavelength_nm: f64,
    integration_ms: f64,
    rng: StdRng,
}

impl MockPowerMeter {
    /// Power meter with a 1 s window at 532 nm.
    pub fn new(options: &MockOptions) -> Self {
        Self {
            core: MockCore::new(InstrumentName::PowerMeter, options),
            wavelength_nm: 532.0,
            integration_ms: 1000.0,
            rng: StdRng::from_entropy(),
        }
    }
}

#[async_trait]
impl Instrument for MockPowerMeter {
    fn name(&self) -> InstrumentName {
        self.core.name
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.core.disconnect().await
    }

    async fn measure(&mut self, _events: &EventSink) -> AppResult<MeasurementData> {
        self.core.ensure_connected()?;
        self.core.record("measure");
        self.core.maybe_hang().await;

        let count = self.measurements_multiple();
        let mut powers = Vec::with_capacity(count);
        let mut times = Vec::with_capacity(count);
        for _ in 0..count {
            self.core.delay(0.1).await;
            let base = 1e-3 * (1.0 + (self.wavelength_nm / 100.0).sin() * 0.2);
            powers.push(base * (1.0 + self.rng.gen_range(-0.01..0.01)));
            times.push(unix_seconds());
        }
        Ok(MeasurementData::Power { powers, times })
    }

    fn describe(&self) -> Attributes {
        let mut attrs = self.core.attributes();
        attrs.insert("wavelength_nm".into(), self.wavelength_nm.into());
        attrs.insert("integration_time_ms".into(), self.integration_ms.into());
        attrs
    }
}

#[async_trait]
impl PowerMeter for MockPowerMeter {
    async fn set_wavelength(&mut self, nm: f64) -> AppResult<()> {
        self.core.record("set_wavelength");
        self.wavelength_nm = nm;
        Ok(())
    }

    async fn set_integration_time(&mut self, ms: f64) -> AppResult<()> {
        self.core.record("set_integration_time");
        self.integration_ms = ms;
        Ok(())
    }

    fn measurements_multiple(&self) -> usize {
        ((self.integration_ms / 100.0).ceil() as usize).max(1)
    }
}

// =============================================================================
// MockLaser
// =============================================================================

/// Simulated tunable laser.
pub struct MockLaser {
    core: MockCore,
    wavelength_nm: Option<f64>,
    energy: EnergyLevel,
}

impl MockLaser {
    /// Tuning range in nm.
    pub const RANGE_NM: (f64, f64) = (210.0, 2600.0);

    /// Laser with output off and no wavelength set.
    pub fn new(options: &MockOptions) -> Self {
        Self {
            core: MockCore::new(InstrumentName::Laser, options),
            wavelength_nm: None,
            energy: EnergyLevel::Off,
        }
    }
}

#[async_trait]
impl Instrument for MockLaser {
    fn name(&self) -> InstrumentName {
        self.core.name
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.core.disconnect().await
    }

    async fn measure(&mut self, _events: &EventSink) -> AppResult<MeasurementData> {
        self.core.ensure_connected()?;
        self.core.record("measure");
        self.core.maybe_hang().await;
        Ok(MeasurementData::Laser {
            wavelength_nm: self.wavelength_nm,
            energy: self.energy,
        })
    }

    async fn reset_to_alignment_defaults(&mut self) -> AppResult<()> {
        self.core.record("reset_to_alignment_defaults");
        self.energy = EnergyLevel::Off;
        Ok(())
    }

    fn describe(&self) -> Attributes {
        let mut attrs = self.core.attributes();
        attrs.insert("energy_level".into(), self.energy.as_str().into());
        attrs
    }
}

#[async_trait]
impl Laser for MockLaser {
    async fn set_wavelength(&mut self, nm: f64) -> AppResult<()> {
        self.core.ensure_connected()?;
        self.core.record("set_wavelength");
        let (low, high) = Self::RANGE_NM;
        if !(low..=high).contains(&nm) {
            return Err(DaqError::instrument(
                self.core.name,
                format!("{} nm is outside {}..{} nm", nm, low, high),
            ));
        }
        self.core.delay(0.5).await;
        self.wavelength_nm = Some(nm);
        Ok(())
    }

    async fn set_energy_level(&mut self, level: EnergyLevel) -> AppResult<()> {
        self.core.record("set_energy_level");
        self.energy = level;
        Ok(())
    }
}

// =============================================================================
// MockDigitizer
// =============================================================================

/// Simulated waveform digitizer.
///
/// Post-processing happens here: averaging mode returns the mean normalized
/// waveform, counting mode a histogram of threshold crossings.
pub struct MockDigitizer {
    core: MockCore,
    config: DigitizerConfig,
    pulses: u32,
    rng: StdRng,
}

impl MockDigitizer {
    /// Pulse repetition rate in Hz.
    pub const REPETITION_RATE_HZ: f64 = 1000.0;

    /// Digitizer with default acquisition parameters.
    pub fn new(options: &MockOptions) -> Self {
        let config = DigitizerConfig::default();
        Self {
            core: MockCore::new(InstrumentName::Digitizer, options),
            pulses: config.pulses,
            config,
            rng: StdRng::from_entropy(),
        }
    }

    fn pulse(&mut self) -> Vec<f64> {
        let length = self.config.record_length;
        let trigger = length * (100 - self.config.post_trigger_size.min(100) as usize) / 100;
        let tau = (length / 8).max(1) as f64;
        let rng = &mut self.rng;
        (0..length)
            .map(|i| {
                let signal = if i >= trigger {
                    (-((i - trigger) as f64) / tau).exp()
                } else {
                    0.0
                };
                signal + rng.gen_range(-0.05..0.05)
            })
            .collect()
    }
}

#[async_trait]
impl Instrument for MockDigitizer {
    fn name(&self) -> InstrumentName {
        self.core.name
    }

    async fn connect(&mut self) -> AppResult<()> {
        self.core.connect().await
    }

    async fn disconnect(&mut self) -> AppResult<()> {
        self.core.disconnect().await
    }

    async fn measure(&mut self, _events: &EventSink) -> AppResult<MeasurementData> {
        self.core.ensure_connected()?;
        self.core.record("measure");
        self.core.maybe_hang().await;

        let pulses = self.pulses.max(1);
        self.core
            .delay(f64::from(pulses) / Self::REPETITION_RATE_HZ)
            .await;
        let length = self.config.record_length;
        let mut acc = vec![0.0; length];
        for _ in 0..pulses {
            let waveform = self.pulse();
            match self.config.measurement_mode {
                MeasurementMode::Averaging => {
                    for (a, v) in acc.iter_mut().zip(waveform) {
                        *a += v;
                    }
                }
                MeasurementMode::Counting => {
                    let threshold = self.config.threshold;
                    if let Some(i) = waveform.iter().position(|v| *v > threshold) {
                        acc[i] += 1.0;
                    }
                }
            }
        }
        if self.config.measurement_mode == MeasurementMode::Averaging {
            let n = f64::from(pulses);
            acc.iter_mut().for_each(|a| *a /= n);
        }
        Ok(MeasurementData::Pulses { samples: acc })
    }

    async fn reset_to_alignment_defaults(&mut self) -> AppResult<()> {
        self.core.record("reset_to_alignment_defaults");
        self.pulses = self.config.pulses;
        Ok(())
    }

    fn describe(&self) -> Attributes {
        let mut attrs = self.core.attributes();
        attrs.insert("record_length".into(), self.config.record_length.into());
        attrs.insert(
            "post_trigger_size".into(),
            self.config.post_trigger_size.into(),
        );
        attrs.insert("dc_offset".into(), self.config.dc_offset.into());
        attrs.insert(
            "measurement_mode".into(),
            self.config.measurement_mode.as_str().into(),
        );
        attrs.insert("threshold".into(), self.config.threshold.into());
        attrs.insert("pulses".into(), self.config.pulses.into());
        attrs
    }
}

#[async_trait]
impl Digitizer for MockDigitizer {
    async fn configure(&mut self, config: &DigitizerConfig) -> AppResult<()> {
        self.core.record("configure");
        if config.record_length == 0 || config.channels.is_empty() {
            return Err(DaqError::instrument(
                self.core.name,
                "record_length and channels must not be empty",
            ));
        }
        self.config = config.clone();
        self.pulses = config.pulses;
        Ok(())
    }

    async fn clear_accumulators(&mut self) -> AppResult<()> {
        self.core.record("clear_accumulators");
        Ok(())
    }

    async fn configure_alignment(&mut self, pulses: u32, budget: Duration) -> AppResult<()> {
        self.core.record("configure_alignment");
        let affordable = (budget.as_secs_f64() * Self::REPETITION_RATE_HZ) as u32;
        self.pulses = pulses.min(affordable).max(1);
        Ok(())
    }

    fn record_length(&self) -> usize {
        self.config.record_length
    }
}

// =============================================================================
// Registry
// =============================================================================

impl InstrumentRegistry {
    /// Registry with the simulated driver set.
    pub fn simulated(options: MockOptions) -> Self {
        let mut registry = Self::new();
        for name in InstrumentName::ALL {
            let options = options.clone();
            registry.register(name, move |name| match name {
                InstrumentName::XyStage => Driver::XyStage(Box::new(MockStage::new(&options))),
                InstrumentName::Spectrometer => {
                    Driver::Spectrometer(Box::new(MockSpectrometer::new(&options)))
                }
                InstrumentName::ShutterControl => {
                    Driver::ShutterControl(Box::new(MockShutter::new(&options)))
                }
                InstrumentName::PowerMeter => {
                    Driver::PowerMeter(Box::new(MockPowerMeter::new(&options)))
                }
                InstrumentName::Laser => Driver::Laser(Box::new(MockLaser::new(&options))),
                InstrumentName::Digitizer => {
                    Driver::Digitizer(Box::new(MockDigitizer::new(&options)))
                }
            });
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn instant() -> MockOptions {
        MockOptions {
            time_scale: 0.0,
            ..MockOptions::default()
        }
    }

    fn sink(name: InstrumentName) -> EventSink {
        let (tx, _rx) = mpsc::unbounded_channel();
        EventSink::new(name, tx)
    }

    #[tokio::test]
    async fn test_stage_transient_readback_failures() {
        let options = MockOptions {
            position_failures: 2,
            ..instant()
        };
        let mut stage = MockStage::new(&options);
        stage.connect().await.unwrap();
        stage.move_to(3.0, 4.0).await.unwrap();
        assert!(stage.position().await.is_err());
        assert!(stage.position().await.is_err());
        assert_eq!(stage.position().await.unwrap(), (3.0, 4.0));
        assert_eq!(options.probe.moves(), vec![(3.0, 4.0)]);
    }

    #[tokio::test]
    async fn test_spectrometer_emits_cache_cleared_and_interval_times() {
        let options = MockOptions {
            pixels: 16,
            ..instant()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = EventSink::new(InstrumentName::Spectrometer, tx);
        let mut spectrometer = MockSpectrometer::new(&options);
        spectrometer.connect().await.unwrap();
        spectrometer.set_averaging(3).await.unwrap();
        match spectrometer.measure(&events).await.unwrap() {
            MeasurementData::Spectrum {
                wavelengths,
                intensities,
                interval_times,
            } => {
                assert_eq!(wavelengths.len(), 16);
                assert_eq!(intensities.len(), 16);
                assert_eq!(interval_times.len(), 6);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            crate::messages::OrchestratorMessage::Instrument(InstrumentEvent::CacheCleared)
        ));
    }

    #[tokio::test]
    async fn test_power_meter_multiple_follows_integration_time() {
        let mut meter = MockPowerMeter::new(&instant());
        meter.set_integration_time(3000.0).await.unwrap();
        assert_eq!(meter.measurements_multiple(), 30);
        meter.set_integration_time(50.0).await.unwrap();
        assert_eq!(meter.measurements_multiple(), 1);
    }

    #[tokio::test]
    async fn test_digitizer_counting_histogram_sums_to_pulses() {
        let mut digitizer = MockDigitizer::new(&instant());
        digitizer.connect().await.unwrap();
        let config = DigitizerConfig {
            record_length: 64,
            measurement_mode: MeasurementMode::Counting,
            pulses: 50,
            ..DigitizerConfig::default()
        };
        digitizer.configure(&config).await.unwrap();
        match digitizer
            .measure(&sink(InstrumentName::Digitizer))
            .await
            .unwrap()
        {
            MeasurementData::Pulses { samples } => {
                assert_eq!(samples.len(), 64);
                assert_eq!(samples.iter().sum::<f64>(), 50.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let options = MockOptions {
            fail_connect: vec![InstrumentName::Spectrometer],
            ..instant()
        };
        let mut spectrometer = MockSpectrometer::new(&options);
        assert!(matches!(
            spectrometer.connect().await,
            Err(DaqError::ConnectionFailed { .. })
        ));
        assert!(!options.probe.is_connected(InstrumentName::Spectrometer));
        assert_eq!(options.probe.count(InstrumentName::Spectrometer, "connect"), 1);
    }

    #[tokio::test]
    async fn test_laser_rejects_out_of_range() {
        let mut laser = MockLaser::new(&instant());
        laser.connect().await.unwrap();
        assert!(laser.set_wavelength(100.0).await.is_err());
        laser.set_wavelength(450.0).await.unwrap();
        match laser.measure(&sink(InstrumentName::Laser)).await.unwrap() {
            MeasurementData::Laser { wavelength_nm, .. } => assert_eq!(wavelength_nm, Some(450.0)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
