//! One worker task per instrument.
//!
//! The worker owns the [`Driver`] and executes [`InstrumentCommand`]s one at a time,
//! so calls into a driver never interleave. Every command runs under the instrument's
//! communication timeout. Completion records ([`InstrumentEvent`]) go straight to the
//! orchestrator queue; commands sent without a reply channel report failures there too.
//!
//! The orchestrator talks to a worker through an [`InstrumentHandle`]; cheap clones of
//! its sending side ([`InstrumentLink`]) are handed to the poll scheduler.

use crate::core::{
    DigitizerConfig, Driver, EnergyLevel, EventSink, InstrumentEvent, InstrumentName,
    MeasureOrigin,
};
use crate::data::Attributes;
use crate::error::{AppResult, DaqError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands understood by instrument workers.
#[derive(Clone, Debug, PartialEq)]
pub enum InstrumentCommand {
    Connect,
    Disconnect,
    /// Disconnect (errors ignored) and connect again.
    Reconnect,
    Measure { origin: MeasureOrigin },
    /// Instrument metadata for the dataset.
    Describe,
    ResetToAlignmentDefaults,

    // XY stage
    MoveTo { x: f64, y: f64 },
    ReadPosition,
    StopMotors,

    // Spectrometer
    SetIntegrationTime(f64),
    SetAveraging(u32),
    ClearReferences,

    // Shutter
    OpenShutter,
    CloseShutter,

    // Power meter
    SetPowerWavelength(f64),
    SetPowerIntegrationTime(f64),

    // Laser
    SetLaserWavelength(f64),
    SetEnergyLevel(EnergyLevel),

    // Digitizer
    ConfigureDigitizer(DigitizerConfig),
    ClearAccumulators,
    ConfigureAlignment { pulses: u32, budget: Duration },
}

impl InstrumentCommand {
    /// Short operation name for logs and errors.
    pub fn operation(&self) -> &'static str {
        match self {
            InstrumentCommand::Connect => "connect",
            InstrumentCommand::Disconnect => "disconnect",
            InstrumentCommand::Reconnect => "reconnect",
            InstrumentCommand::Measure { .. } => "measure",
            InstrumentCommand::Describe => "describe",
            InstrumentCommand::ResetToAlignmentDefaults => "reset_to_alignment_defaults",
            InstrumentCommand::MoveTo { .. } => "move_to",
            InstrumentCommand::ReadPosition => "read_position",
            InstrumentCommand::StopMotors => "stop_motors",
            InstrumentCommand::SetIntegrationTime(_) => "set_integration_time",
            InstrumentCommand::SetAveraging(_) => "set_averaging",
            InstrumentCommand::ClearReferences => "clear_references",
            InstrumentCommand::OpenShutter => "open_shutter",
            InstrumentCommand::CloseShutter => "close_shutter",
            InstrumentCommand::SetPowerWavelength(_) => "set_power_wavelength",
            InstrumentCommand::SetPowerIntegrationTime(_) => "set_power_integration_time",
            InstrumentCommand::SetLaserWavelength(_) => "set_laser_wavelength",
            InstrumentCommand::SetEnergyLevel(_) => "set_energy_level",
            InstrumentCommand::ConfigureDigitizer(_) => "configure_digitizer",
            InstrumentCommand::ClearAccumulators => "clear_accumulators",
            InstrumentCommand::ConfigureAlignment { .. } => "configure_alignment",
        }
    }
}

/// Instrument metadata gathered by `Describe`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstrumentInfo {
    pub attributes: Attributes,
    /// Spectrometer emission axis.
    pub wavelengths: Vec<f64>,
    /// Power readings per measurement.
    pub measurements_multiple: Option<usize>,
    /// Digitizer samples per record.
    pub record_length: Option<usize>,
}

/// Successful command result.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Done,
    Position { x: f64, y: f64 },
    Info(InstrumentInfo),
}

struct Envelope {
    command: InstrumentCommand,
    reply: Option<oneshot::Sender<AppResult<Reply>>>,
}

enum WorkerMessage {
    Command(Envelope),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
struct SharedFlags {
    connected: AtomicBool,
    measuring: AtomicBool,
}

/// Cloneable sending side of a worker.
#[derive(Clone)]
pub struct InstrumentLink {
    name: InstrumentName,
    timeout: Duration,
    flags: Arc<SharedFlags>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl std::fmt::Debug for InstrumentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentLink")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("measuring", &self.is_measuring())
            .finish()
    }
}

impl InstrumentLink {
    /// Instrument name.
    pub fn name(&self) -> InstrumentName {
        self.name
    }

    /// Communication timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True after a successful connect.
    pub fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::Acquire)
    }

    /// True while a `measure()` is queued or running.
    pub fn is_measuring(&self) -> bool {
        self.flags.measuring.load(Ordering::Acquire)
    }

    /// Fire-and-forget. Failures arrive as [`InstrumentEvent::Failed`].
    pub fn send(&self, command: InstrumentCommand) -> AppResult<()> {
        self.tx
            .send(WorkerMessage::Command(Envelope {
                command,
                reply: None,
            }))
            .map_err(|_| DaqError::WorkerGone(self.name))
    }

    /// Send and wait for the reply.
    ///
    /// Bounded by twice the timeout: once for commands queued ahead, once for this one.
    pub async fn request(&self, command: InstrumentCommand) -> AppResult<Reply> {
        let operation = command.operation();
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Command(Envelope {
                command,
                reply: Some(tx),
            }))
            .map_err(|_| DaqError::WorkerGone(self.name))?;
        match tokio::time::timeout(self.timeout * 2, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DaqError::WorkerGone(self.name)),
            Err(_) => Err(DaqError::Timeout {
                instrument: self.name,
                operation: operation.to_string(),
                seconds: (self.timeout * 2).as_secs_f64(),
            }),
        }
    }

    /// Queue a measurement unless one is already pending. Returns false if skipped.
    pub fn try_measure(&self, origin: MeasureOrigin) -> bool {
        if self
            .flags
            .measuring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if self.send(InstrumentCommand::Measure { origin }).is_err() {
            self.flags.measuring.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Queue a measurement even if another one is pending.
    pub fn measure(&self, origin: MeasureOrigin) -> AppResult<()> {
        self.flags.measuring.store(true, Ordering::Release);
        self.send(InstrumentCommand::Measure { origin })
    }
}

/// Owner side of a worker.
pub struct InstrumentHandle {
    link: InstrumentLink,
    task: JoinHandle<()>,
}

impl std::ops::Deref for InstrumentHandle {
    type Target = InstrumentLink;

    fn deref(&self) -> &Self::Target {
        &self.link
    }
}

impl InstrumentHandle {
    /// Spawn a worker for `driver`.
    pub fn spawn(driver: Driver, events: EventSink, timeout: Duration) -> Self {
        let name = driver.name();
        let flags = Arc::new(SharedFlags {
            connected: AtomicBool::new(false),
            measuring: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            name,
            driver,
            events,
            timeout,
            flags: flags.clone(),
        };
        let task = tokio::spawn(worker.run(rx));
        debug!(instrument = %name, "Instrument worker spawned");
        Self {
            link: InstrumentLink {
                name,
                timeout,
                flags,
                tx,
            },
            task,
        }
    }

    /// Cloneable sending side.
    pub fn link(&self) -> InstrumentLink {
        self.link.clone()
    }

    /// Disconnect and stop the worker, waiting at most one timeout.
    pub async fn shutdown(self) {
        let name = self.link.name;
        let (tx, rx) = oneshot::channel();
        if self.link.tx.send(WorkerMessage::Shutdown(tx)).is_ok()
            && tokio::time::timeout(self.link.timeout, rx).await.is_err()
        {
            warn!(instrument = %name, "Worker did not stop in time, aborting it");
            self.task.abort();
            return;
        }
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(instrument = %name, error = %e, "Worker task failed");
            }
        }
    }
}

struct Worker {
    name: InstrumentName,
    driver: Driver,
    events: EventSink,
    timeout: Duration,
    flags: Arc<SharedFlags>,
}

fn unsupported(name: InstrumentName, command: &InstrumentCommand) -> DaqError {
    DaqError::UnsupportedCommand {
        instrument: name,
        command: command.operation().to_string(),
    }
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Command(Envelope { command, reply }) => {
                    self.handle(command, reply).await;
                }
                WorkerMessage::Shutdown(done) => {
                    if self.flags.connected.load(Ordering::Acquire) {
                        if let Err(e) = self.driver.disconnect().await {
                            warn!(instrument = %self.name, error = %e, "Disconnect on shutdown failed");
                        }
                        self.flags.connected.store(false, Ordering::Release);
                    }
                    let _ = done.send(());
                    break;
                }
            }
        }
        debug!(instrument = %self.name, "Instrument worker stopped");
    }

    async fn handle(
        &mut self,
        command: InstrumentCommand,
        reply: Option<oneshot::Sender<AppResult<Reply>>>,
    ) {
        let operation = command.operation();
        let is_measure = matches!(command, InstrumentCommand::Measure { .. });
        let result = match tokio::time::timeout(self.timeout, self.execute(command)).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::Timeout {
                instrument: self.name,
                operation: operation.to_string(),
                seconds: self.timeout.as_secs_f64(),
            }),
        };
        if is_measure {
            self.flags.measuring.store(false, Ordering::Release);
        }

        match reply {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(instrument = %self.name, operation, error = %e, "Instrument command failed");
                    self.events.emit(InstrumentEvent::Failed {
                        instrument: self.name,
                        operation: operation.to_string(),
                        timeout: e.is_timeout(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    async fn execute(&mut self, command: InstrumentCommand) -> AppResult<Reply> {
        let name = self.name;
        match (&mut self.driver, command) {
            (driver, InstrumentCommand::Connect) => {
                driver.connect().await?;
                self.flags.connected.store(true, Ordering::Release);
                info!(instrument = %name, "Connected");
            }
            (driver, InstrumentCommand::Disconnect) => {
                self.flags.connected.store(false, Ordering::Release);
                driver.disconnect().await?;
                info!(instrument = %name, "Disconnected");
            }
            (driver, InstrumentCommand::Reconnect) => {
                self.flags.connected.store(false, Ordering::Release);
                if let Err(e) = driver.disconnect().await {
                    debug!(instrument = %name, error = %e, "Disconnect before reconnect failed");
                }
                driver.connect().await?;
                self.flags.connected.store(true, Ordering::Release);
                info!(instrument = %name, "Reconnected");
            }
            (driver, InstrumentCommand::Measure { origin }) => {
                let data = driver.measure(&self.events).await?;
                self.events.emit(InstrumentEvent::MeasurementDone {
                    instrument: name,
                    origin,
                    data,
                });
            }
            (driver, InstrumentCommand::ResetToAlignmentDefaults) => {
                driver.reset_to_alignment_defaults().await?;
            }
            (driver, InstrumentCommand::Describe) => {
                let mut info = InstrumentInfo {
                    attributes: driver.describe(),
                    ..InstrumentInfo::default()
                };
                match driver {
                    Driver::Spectrometer(d) => info.wavelengths = d.wavelengths(),
                    Driver::PowerMeter(d) => {
                        info.measurements_multiple = Some(d.measurements_multiple())
                    }
                    Driver::Digitizer(d) => info.record_length = Some(d.record_length()),
                    _ => {}
                }
                return Ok(Reply::Info(info));
            }

            (Driver::XyStage(d), InstrumentCommand::MoveTo { x, y }) => {
                d.move_to(x, y).await?;
                self.events.emit(InstrumentEvent::StageSettled { x, y });
            }
            (Driver::XyStage(d), InstrumentCommand::ReadPosition) => {
                let (x, y) = d.position().await?;
                return Ok(Reply::Position { x, y });
            }
            (Driver::XyStage(d), InstrumentCommand::StopMotors) => d.stop_motors().await?,

            (Driver::Spectrometer(d), InstrumentCommand::SetIntegrationTime(ms)) => {
                d.set_integration_time(ms).await?
            }
            (Driver::Spectrometer(d), InstrumentCommand::SetAveraging(n)) => {
                d.set_averaging(n).await?
            }
            (Driver::Spectrometer(d), InstrumentCommand::ClearReferences) => {
                d.clear_references().await?
            }

            (Driver::ShutterControl(d), InstrumentCommand::OpenShutter) => d.open().await?,
            (Driver::ShutterControl(d), InstrumentCommand::CloseShutter) => d.close().await?,

            (Driver::PowerMeter(d), InstrumentCommand::SetPowerWavelength(nm)) => {
                d.set_wavelength(nm).await?
            }
            (Driver::PowerMeter(d), InstrumentCommand::SetPowerIntegrationTime(ms)) => {
                d.set_integration_time(ms).await?
            }

            (Driver::Laser(d), InstrumentCommand::SetLaserWavelength(nm)) => {
                self.events
                    .emit(InstrumentEvent::LaserWavelengthChanged { wavelength_nm: nm });
                d.set_wavelength(nm).await?;
                self.events
                    .emit(InstrumentEvent::LaserStable { wavelength_nm: nm });
            }
            (Driver::Laser(d), InstrumentCommand::SetEnergyLevel(level)) => {
                d.set_energy_level(level).await?
            }

            (Driver::Digitizer(d), InstrumentCommand::ConfigureDigitizer(config)) => {
                d.configure(&config).await?
            }
            (Driver::Digitizer(d), InstrumentCommand::ClearAccumulators) => {
                d.clear_accumulators().await?
            }
            (Driver::Digitizer(d), InstrumentCommand::ConfigureAlignment { pulses, budget }) => {
                d.configure_alignment(pulses, budget).await?
            }

            (_, command) => return Err(unsupported(name, &command)),
        }
        Ok(Reply::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MeasurementData;
    use crate::instrument::mock::{MockOptions, MockProbe};
    use crate::instrument::InstrumentRegistry;
    use crate::messages::OrchestratorMessage;

    fn spawn(
        name: InstrumentName,
        options: MockOptions,
        timeout: Duration,
    ) -> (InstrumentHandle, mpsc::UnboundedReceiver<OrchestratorMessage>) {
        let registry = InstrumentRegistry::simulated(options);
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = registry.create(name).unwrap();
        let handle = InstrumentHandle::spawn(driver, EventSink::new(name, tx), timeout);
        (handle, rx)
    }

    fn fast() -> MockOptions {
        MockOptions {
            time_scale: 0.0,
            ..MockOptions::default()
        }
    }

    #[tokio::test]
    async fn test_connect_sets_flag() {
        let (handle, _rx) = spawn(InstrumentName::XyStage, fast(), Duration::from_secs(1));
        assert!(!handle.is_connected());
        handle.request(InstrumentCommand::Connect).await.unwrap();
        assert!(handle.is_connected());
        handle.request(InstrumentCommand::Disconnect).await.unwrap();
        assert!(!handle.is_connected());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_move_emits_stage_settled() {
        let (handle, mut rx) = spawn(InstrumentName::XyStage, fast(), Duration::from_secs(1));
        handle.request(InstrumentCommand::Connect).await.unwrap();
        handle
            .request(InstrumentCommand::MoveTo { x: 1.0, y: 2.0 })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            OrchestratorMessage::Instrument(InstrumentEvent::StageSettled { x, y }) => {
                assert_eq!((x, y), (1.0, 2.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        let reply = handle.request(InstrumentCommand::ReadPosition).await.unwrap();
        assert_eq!(reply, Reply::Position { x: 1.0, y: 2.0 });
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_measure_clears_flag_and_reports() {
        let (handle, mut rx) =
            spawn(InstrumentName::PowerMeter, fast(), Duration::from_secs(1));
        handle.request(InstrumentCommand::Connect).await.unwrap();
        assert!(handle.try_measure(MeasureOrigin::Poll));
        match rx.recv().await.unwrap() {
            OrchestratorMessage::Instrument(InstrumentEvent::MeasurementDone {
                instrument,
                origin,
                data: MeasurementData::Power { powers, .. },
            }) => {
                assert_eq!(instrument, InstrumentName::PowerMeter);
                assert_eq!(origin, MeasureOrigin::Poll);
                assert!(!powers.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!handle.is_measuring());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_hanging_measure_times_out() {
        let options = MockOptions {
            hang_measure: vec![InstrumentName::Digitizer],
            ..fast()
        };
        let (handle, mut rx) = spawn(InstrumentName::Digitizer, options, Duration::from_millis(50));
        handle.request(InstrumentCommand::Connect).await.unwrap();
        handle
            .measure(MeasureOrigin::Run { run: 1, index: 0 })
            .unwrap();
        match rx.recv().await.unwrap() {
            OrchestratorMessage::Instrument(InstrumentEvent::Failed {
                instrument,
                timeout,
                ..
            }) => {
                assert_eq!(instrument, InstrumentName::Digitizer);
                assert!(timeout);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!handle.is_measuring());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (handle, _rx) = spawn(InstrumentName::Laser, fast(), Duration::from_secs(1));
        let err = handle
            .request(InstrumentCommand::StopMotors)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::UnsupportedCommand { .. }));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let probe = MockProbe::default();
        let options = MockOptions {
            probe: probe.clone(),
            ..fast()
        };
        let (handle, _rx) = spawn(InstrumentName::Spectrometer, options, Duration::from_secs(1));
        handle.request(InstrumentCommand::Connect).await.unwrap();
        let link = handle.link();
        handle.shutdown().await;
        assert!(!link.is_connected());
        assert_eq!(probe.count(InstrumentName::Spectrometer, "disconnect"), 1);
        assert!(link.send(InstrumentCommand::Connect).is_err());
    }
}
