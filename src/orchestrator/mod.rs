//! Experiment orchestrator.
//!
//! One actor task owns the state machine, the instrument workers and the open output
//! file. Everything it reacts to arrives on a single queue: commands from the UI,
//! completion records from instrument workers and barrier completions. State mutations
//! therefore never race, and the UI talks to the actor only through
//! [`OrchestratorHandle`].
//!
//! Entry actions never fire triggers themselves. They queue them, and the queue is
//! drained once the current entry action has returned, so a transition always runs to
//! completion before the next one starts.
//!
//! Submodules:
//! - [`state`]: states, triggers and the transition table
//! - [`wiring`]: per-experiment routing of instrument events to actions
//! - [`barrier`]: multiple-signal barriers used by the routing
//! - [`poll`]: alignment-mode poll scheduler
//! - [`progress`]: progress and estimated completion time
//! - [`calibration`]: two-position beamsplitter calibration bookkeeping

pub mod barrier;
pub mod calibration;
pub mod poll;
pub mod progress;
pub mod state;
pub mod wiring;

use crate::config::{AppConfig, BenchConfig, Topology, UiSettings};
use crate::core::{EnergyLevel, EventSink, InstrumentEvent, InstrumentName, MeasureOrigin};
use crate::data::calibration::{calibration_file_name, read_calibration};
use crate::data::storage::dataset_file_name;
use crate::data::writer::DatasetLayout;
use crate::data::{DatasetWriter, PointData, StoreFactory};
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_with_recovery, RetryPolicy};
use crate::experiment::geometry::{expand_axis, AxisLayout};
use crate::experiment::grid::{MeasurementPoint, PointKind, Schedule};
use crate::experiment::ExperimentKind;
use crate::instrument::{InstrumentCommand, InstrumentHandle, InstrumentLink, InstrumentRegistry, Reply};
use crate::messages::{
    InstrumentStatus, OrchestratorCommand, OrchestratorMessage, OrchestratorStatus, UiEvent,
};
use crate::metadata::{xystage_attributes, RunMetadataBuilder};
use calibration::CalibrationRun;
use chrono::Local;
use futures::future::join_all;
use poll::PollScheduler;
use progress::ProgressTracker;
use state::{Guard, State, TransitionOutcome, TransitionTable, Trigger};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};
use wiring::{Route, Signal, Wiring, WiringGroup, MEASURE_BARRIER, PREPARE_BARRIER};

/// Capacity of the UI event broadcast channel.
const UI_EVENT_CAPACITY: usize = 1024;

/// Digitizer pulses per second of polltime requested while aligning.
const ALIGNMENT_PULSE_RATE: f64 = 101.0;

/// Power meter integration time of a calibration point (ms).
const CALIBRATION_POWER_INTEGRATION_MS: f64 = 3000.0;

/// Timing and output settings of the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestratorOptions {
    pub polltime: Duration,
    pub instrument_timeout: Duration,
    /// Stage position during a calibration run (mm).
    pub calibration_park_position: (f64, f64),
    /// Policy for the position readback.
    pub retry: RetryPolicy,
    /// Directory of datasets and calibration files. Relative calibration files are
    /// resolved against it too.
    pub output_dir: PathBuf,
}

impl OrchestratorOptions {
    pub fn from_config(app: &AppConfig) -> Self {
        let [park_x, park_y] = app.orchestrator.calibration_park_position;
        Self {
            polltime: app.orchestrator.polltime,
            instrument_timeout: app.orchestrator.instrument_timeout,
            calibration_park_position: (park_x, park_y),
            retry: app.retry.clone(),
            output_dir: app.storage.output_dir.clone(),
        }
    }
}

/// Everything the actor needs to start.
pub struct OrchestratorSetup {
    pub transitions: TransitionTable,
    pub topology: Topology,
    pub ui: UiSettings,
    pub options: OrchestratorOptions,
    pub registry: InstrumentRegistry,
    pub store_factory: Arc<dyn StoreFactory>,
}

impl OrchestratorSetup {
    /// Setup from a loaded configuration directory.
    pub fn from_bench(
        bench: BenchConfig,
        registry: InstrumentRegistry,
        store_factory: Arc<dyn StoreFactory>,
    ) -> Self {
        Self {
            options: OrchestratorOptions::from_config(&bench.app),
            transitions: bench.transitions,
            topology: bench.topology,
            ui: bench.ui,
            registry,
            store_factory,
        }
    }
}

/// Actor that owns the state machine and the instruments.
pub struct Orchestrator {
    state: State,
    table: TransitionTable,
    topology: Topology,
    ui: UiSettings,
    options: OrchestratorOptions,
    registry: InstrumentRegistry,
    store_factory: Arc<dyn StoreFactory>,
    experiment: Option<ExperimentKind>,
    instruments: BTreeMap<InstrumentName, InstrumentHandle>,
    wiring: Option<Wiring>,
    poll: Option<PollScheduler>,
    schedule: Option<Schedule>,
    layouts: Option<(AxisLayout, AxisLayout)>,
    progress: ProgressTracker,
    writer: Option<DatasetWriter>,
    calibration: Option<CalibrationRun>,
    point_data: PointData,
    run_id: u64,
    pending: VecDeque<Trigger>,
    abort_reason: Option<String>,
    tx: mpsc::UnboundedSender<OrchestratorMessage>,
    ui_events: broadcast::Sender<UiEvent>,
}

impl Orchestrator {
    /// Spawn the actor task and return its handle.
    pub fn spawn(setup: OrchestratorSetup) -> OrchestratorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ui_events, _) = broadcast::channel(UI_EVENT_CAPACITY);
        let actor = Self {
            state: setup.transitions.initial(),
            table: setup.transitions,
            topology: setup.topology,
            ui: setup.ui,
            options: setup.options,
            registry: setup.registry,
            store_factory: setup.store_factory,
            experiment: None,
            instruments: BTreeMap::new(),
            wiring: None,
            poll: None,
            schedule: None,
            layouts: None,
            progress: ProgressTracker::default(),
            writer: None,
            calibration: None,
            point_data: PointData::default(),
            run_id: 0,
            pending: VecDeque::new(),
            abort_reason: None,
            tx: tx.clone(),
            ui_events: ui_events.clone(),
        };
        tokio::spawn(actor.run(rx));
        OrchestratorHandle { tx, ui_events }
    }

    /// Main actor loop - processes messages until shutdown
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<OrchestratorMessage>) {
        info!(state = %self.state, "Orchestrator started");

        while let Some(message) = rx.recv().await {
            match message {
                OrchestratorMessage::Command(OrchestratorCommand::Fire { trigger, response }) => {
                    let outcome = self.transition(trigger).await;
                    let _ = response.send(outcome);
                }
                OrchestratorMessage::Command(OrchestratorCommand::SelectExperiment {
                    kind,
                    response,
                }) => {
                    let result = self.select_experiment(kind);
                    let _ = response.send(result);
                }
                OrchestratorMessage::Command(OrchestratorCommand::UpdateSettings {
                    settings,
                    response,
                }) => {
                    self.update_settings(*settings);
                    let _ = response.send(());
                }
                OrchestratorMessage::Command(OrchestratorCommand::Instrument {
                    instrument,
                    command,
                    response,
                }) => {
                    self.forward_manual(instrument, command, response);
                }
                OrchestratorMessage::Command(OrchestratorCommand::GetStatus { response }) => {
                    let _ = response.send(self.status());
                }
                OrchestratorMessage::Command(OrchestratorCommand::Shutdown { response }) => {
                    info!("Shutdown command received");
                    self.shutdown().await;
                    let _ = response.send(());
                    break;
                }
                OrchestratorMessage::Instrument(event) => self.on_instrument_event(event),
                OrchestratorMessage::BarrierDone { barrier } => {
                    debug!(barrier = %barrier, "Barrier complete");
                    self.route_signal(Signal::BarrierDone(barrier), None);
                }
            }
            self.drain().await;
        }

        info!("Orchestrator stopped");
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    async fn drain(&mut self) {
        while let Some(trigger) = self.pending.pop_front() {
            self.transition(trigger).await;
        }
    }

    async fn transition(&mut self, trigger: Trigger) -> TransitionOutcome {
        let (dest, guard) = match self.table.resolve(self.state, trigger) {
            Some(transition) => (transition.dest, transition.unless),
            None => {
                warn!(state = %self.state, %trigger, "Trigger not valid in this state, ignored");
                return TransitionOutcome::Ignored;
            }
        };
        if guard == Some(Guard::IsDone) && self.progress.is_done() {
            debug!(state = %self.state, %trigger, "Transition blocked, schedule exhausted");
            return TransitionOutcome::Blocked;
        }

        let from = self.state;
        if from == State::Align && dest != State::Align {
            self.leave_align().await;
        }
        self.state = dest;
        info!(%from, to = %dest, %trigger, "State changed");
        self.emit(UiEvent::StateChanged(dest));

        if let Err(e) = self.on_enter(dest).await {
            self.entry_failed(dest, e);
        }
        TransitionOutcome::Transitioned(dest)
    }

    async fn on_enter(&mut self, state: State) -> AppResult<()> {
        match state {
            State::Waiting => self.enter_waiting().await,
            State::Connecting => self.enter_connecting().await,
            State::Align => self.enter_align().await,
            State::SetExperiment => Ok(()),
            State::ParsingConfiguration => self.enter_parsing().await,
            State::OpeningFile => self.enter_opening_file().await,
            State::MeasurementPreparing => self.enter_preparing().await,
            State::MeasurementMeasuring => self.enter_measuring(),
            State::MeasurementProcessingData => {
                self.progress.end_phase();
                self.pending.push_back(Trigger::WriteFile);
                Ok(())
            }
            State::MeasurementWritingToFile => self.enter_writing().await,
            State::MeasurementCalculatingProgress => self.enter_calculating().await,
            State::WaitingForUser => Ok(()),
            State::MeasurementCompleted => self.enter_completed().await,
            State::MeasurementAborted => self.enter_aborted().await,
        }
    }

    fn entry_failed(&mut self, state: State, error: DaqError) {
        error!(%state, error = %error, "Entry action failed");
        match state {
            State::Connecting => {
                self.pending.clear();
                self.pending.push_back(Trigger::ConnectFailed);
            }
            s if s.is_run() || s == State::MeasurementCompleted => {
                self.abort_run(error.to_string())
            }
            _ => {}
        }
    }

    /// Drop whatever was queued and abort the run.
    fn abort_run(&mut self, reason: String) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
        self.pending.clear();
        self.pending.push_back(Trigger::MeasurementAborted);
    }

    // ------------------------------------------------------------------
    // Entry actions
    // ------------------------------------------------------------------

    async fn enter_waiting(&mut self) -> AppResult<()> {
        self.stop_poll().await;
        if let Err(e) = self.close_outputs() {
            error!(error = %e, "Closing output files failed");
        }
        if let Some(wiring) = self.wiring.as_mut() {
            wiring.disconnect_all();
        }
        self.schedule = None;
        self.layouts = None;
        self.point_data.clear();
        self.abort_reason = None;
        Ok(())
    }

    async fn enter_connecting(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        let needed = self.topology.instruments_for(kind);

        let unused: Vec<InstrumentName> = self
            .instruments
            .keys()
            .filter(|name| !needed.contains(name))
            .copied()
            .collect();
        for name in unused {
            if let Some(handle) = self.instruments.remove(&name) {
                debug!(instrument = %name, experiment = %kind, "Instrument not needed, releasing it");
                handle.shutdown().await;
            }
        }
        for name in &needed {
            if !self.instruments.contains_key(name) {
                let driver = self.registry.create(*name)?;
                let events = EventSink::new(*name, self.tx.clone());
                let handle = InstrumentHandle::spawn(driver, events, self.options.instrument_timeout);
                self.instruments.insert(*name, handle);
            }
        }

        let links: Vec<InstrumentLink> = self
            .instruments
            .values()
            .filter(|handle| !handle.is_connected())
            .map(|handle| handle.link())
            .collect();
        let results = join_all(links.into_iter().map(|link| async move {
            let result = link.request(InstrumentCommand::Connect).await;
            (link.name(), result)
        }))
        .await;
        let failures: Vec<(InstrumentName, DaqError)> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        if !failures.is_empty() {
            for (name, e) in &failures {
                error!(instrument = %name, error = %e, "Connection failed");
                self.emit(UiEvent::InstrumentConnectFailed {
                    instrument: *name,
                    error: e.to_string(),
                });
            }
            self.release_instruments().await;
            self.pending.push_back(Trigger::ConnectFailed);
            return Ok(());
        }

        info!(experiment = %kind, instruments = self.instruments.len(), "All instruments connected");
        self.wiring = Some(Wiring::new(kind, self.tx.clone()));
        self.emit(UiEvent::InstrumentConnectSuccessful);
        self.emit(UiEvent::InitInstrumentThreads);
        self.pending.push_back(Trigger::Align);
        Ok(())
    }

    async fn enter_align(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        self.wiring_mut()?.connect(WiringGroup::Alignment);

        let configured = if kind == ExperimentKind::Decay {
            let budget = self.options.polltime;
            let pulses = (budget.as_secs_f64() * ALIGNMENT_PULSE_RATE).ceil().max(1.0) as u32;
            self.link(InstrumentName::Digitizer)?
                .request(InstrumentCommand::ConfigureAlignment { pulses, budget })
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        let links = self.instruments.values().map(|handle| handle.link()).collect();
        self.poll = Some(PollScheduler::start(links, self.options.polltime));
        self.emit(UiEvent::EnableMainGui(true));
        configured
    }

    async fn leave_align(&mut self) {
        self.stop_poll().await;
        if let Some(wiring) = self.wiring.as_mut() {
            wiring.disconnect(WiringGroup::Alignment);
        }
        if matches!(
            self.experiment,
            Some(ExperimentKind::ExcitationEmission | ExperimentKind::Decay)
        ) {
            self.request_logged(InstrumentName::ShutterControl, InstrumentCommand::CloseShutter)
                .await;
            self.request_logged(
                InstrumentName::Laser,
                InstrumentCommand::SetEnergyLevel(EnergyLevel::Off),
            )
            .await;
        }
    }

    async fn enter_parsing(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        self.ui.validate_for(kind)?;

        let layouts = if kind.scans_positions() {
            let substrate = self.topology.substrate(&self.ui.general.substrate)?;
            let (x_geometry, y_geometry) = substrate.axes(kind)?;
            let positions = self.ui.positions(kind).ok_or_else(|| {
                DaqError::InvalidInput(format!("{} has no position settings", kind))
            })?;
            Some((
                expand_axis("x", positions.x_input(), x_geometry)?,
                expand_axis("y", positions.y_input(), y_geometry)?,
            ))
        } else {
            None
        };
        let wavelengths = self.ui.wavelengths(kind)?;
        let schedule = Schedule::build(
            kind,
            layouts.as_ref().map(|(x, _)| x),
            layouts.as_ref().map(|(_, y)| y),
            &wavelengths,
        )?;
        info!(experiment = %kind, points = schedule.len(), "Schedule built");
        self.progress.reset(schedule.len());
        self.schedule = Some(schedule);
        self.layouts = layouts;

        let energy = self.ui.energy_level(kind);
        match kind {
            ExperimentKind::Transmission => self.configure_spectrometer(kind).await?,
            ExperimentKind::ExcitationEmission => {
                self.configure_spectrometer(kind).await?;
                let spectrometer = &self.ui.excitation_emission.spectrometer;
                let integration =
                    spectrometer.integration_time_ms * f64::from(spectrometer.averaging);
                self.link(InstrumentName::PowerMeter)?
                    .request(InstrumentCommand::SetPowerIntegrationTime(integration))
                    .await?;
                self.link(InstrumentName::Laser)?
                    .request(InstrumentCommand::SetEnergyLevel(energy))
                    .await?;
                self.wiring_mut()?.connect(WiringGroup::Configuration);
            }
            ExperimentKind::Decay => {
                let digitizer = self.ui.decay.digitizer.clone();
                self.link(InstrumentName::Digitizer)?
                    .request(InstrumentCommand::ConfigureDigitizer(digitizer))
                    .await?;
                self.link(InstrumentName::Laser)?
                    .request(InstrumentCommand::SetEnergyLevel(energy))
                    .await?;
            }
            ExperimentKind::Calibration => {
                self.link(InstrumentName::Laser)?
                    .request(InstrumentCommand::SetEnergyLevel(energy))
                    .await?;
                self.link(InstrumentName::PowerMeter)?
                    .request(InstrumentCommand::SetPowerIntegrationTime(
                        CALIBRATION_POWER_INTEGRATION_MS,
                    ))
                    .await?;
                // start_experiment is fired by the stage settling at the park position.
                self.wiring_mut()?.connect(WiringGroup::Configuration);
                let (x, y) = self.options.calibration_park_position;
                self.link(InstrumentName::XyStage)?
                    .send(InstrumentCommand::MoveTo { x, y })?;
                return Ok(());
            }
        }
        self.pending.push_back(Trigger::StartExperiment);
        Ok(())
    }

    async fn configure_spectrometer(&mut self, kind: ExperimentKind) -> AppResult<()> {
        let settings = self.ui.spectrometer(kind).cloned().unwrap_or_default();
        let spectrometer = self.link(InstrumentName::Spectrometer)?;
        spectrometer
            .request(InstrumentCommand::SetIntegrationTime(settings.integration_time_ms))
            .await?;
        spectrometer
            .request(InstrumentCommand::SetAveraging(settings.averaging))
            .await?;
        spectrometer
            .request(InstrumentCommand::ClearReferences)
            .await?;
        Ok(())
    }

    async fn enter_opening_file(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        let total = self.schedule.as_ref().map(Schedule::len).unwrap_or(0);
        self.run_id += 1;
        self.progress.reset(total);
        self.point_data.clear();

        if kind == ExperimentKind::Calibration {
            let bounds = self.ui.calibration.wl.bounds()?;
            let name = calibration_file_name(&self.ui.calibration.beamsplitter, bounds, Local::now());
            self.calibration = Some(CalibrationRun::start(&self.options.output_dir.join(name))?);
            self.wiring_mut()?.disconnect(WiringGroup::Configuration);
        } else {
            let writer = self.open_dataset(kind).await?;
            self.writer = Some(writer);
        }

        self.wiring_mut()?.connect(WiringGroup::Loop);
        self.emit(UiEvent::EnableMainGui(false));
        info!(run = self.run_id, experiment = %kind, points = total, "Run started");
        self.pending.push_back(Trigger::Prepare);
        Ok(())
    }

    async fn open_dataset(&mut self, kind: ExperimentKind) -> AppResult<DatasetWriter> {
        let links: Vec<InstrumentLink> = self.instruments.values().map(|h| h.link()).collect();
        let mut infos = BTreeMap::new();
        for link in links {
            if let Reply::Info(info) = link.request(InstrumentCommand::Describe).await? {
                infos.insert(link.name(), info);
            }
        }

        let schedule = self
            .schedule
            .as_ref()
            .ok_or_else(|| DaqError::Dataset("No schedule to write".to_string()))?;
        let averaging = self.ui.spectrometer(kind).map(|s| s.averaging).unwrap_or(1);
        let layout = DatasetLayout {
            kind,
            emission_wavelengths: infos
                .get(&InstrumentName::Spectrometer)
                .map(|info| info.wavelengths.clone())
                .unwrap_or_default(),
            averaging,
            excitation_wavelengths: schedule.excitation_wavelengths().to_vec(),
            power_measurements: infos
                .get(&InstrumentName::PowerMeter)
                .and_then(|info| info.measurements_multiple)
                .unwrap_or(0),
            samples: infos
                .get(&InstrumentName::Digitizer)
                .and_then(|info| info.record_length)
                .unwrap_or(0),
        };

        let mut metadata = RunMetadataBuilder::new(kind).general(&self.ui.general);
        if let Some((x, y)) = &self.layouts {
            let substrate = self.topology.substrate(&self.ui.general.substrate)?;
            metadata = metadata.section("xystage", xystage_attributes(substrate, x, y));
        }
        for (name, info) in &infos {
            metadata = metadata.section(name.as_str(), info.attributes.clone());
        }
        if let Some(spectrometer) = self.ui.spectrometer(kind) {
            metadata = metadata
                .attribute("spectrometer", "integration_time_ms", spectrometer.integration_time_ms)
                .attribute("spectrometer", "averaging", spectrometer.averaging);
        }
        if kind.has_wavelength_axis() {
            metadata = metadata
                .attribute("laser", "energy_level", self.ui.energy_level(kind).as_str())
                .attribute("laser", "wavelengths", schedule.excitation_wavelengths().to_vec());
        }
        if kind == ExperimentKind::Decay {
            let digitizer = &self.ui.decay.digitizer;
            metadata = metadata
                .attribute("digitizer", "measurement_mode", digitizer.measurement_mode.as_str())
                .attribute("digitizer", "pulses", digitizer.pulses)
                .attribute("digitizer", "post_trigger_size", digitizer.post_trigger_size)
                .attribute("digitizer", "threshold", digitizer.threshold);
        }
        let metadata = metadata.build()?;

        let name = dataset_file_name(
            &self.ui.general.sample,
            kind,
            Local::now(),
            self.store_factory.extension(),
        );
        let path = self.options.output_dir.join(name);
        let store = self.store_factory.open(&path)?;
        let run_uid = uuid::Uuid::new_v4().to_string();
        let mut writer = DatasetWriter::create(store, path, layout, &run_uid)?;
        for (group, attributes) in metadata.groups() {
            writer.write_settings(&group, &attributes)?;
        }

        if kind == ExperimentKind::ExcitationEmission {
            if let Some(file) = &self.ui.excitation_emission.calibration_file {
                let source = if file.is_relative() {
                    self.options.output_dir.join(file)
                } else {
                    file.clone()
                };
                let table = read_calibration(&source)?;
                writer.embed_calibration(&table, &source)?;
                debug!(rows = table.len(), source = %source.display(), "Calibration embedded");
            }
        }
        Ok(writer)
    }

    async fn enter_preparing(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        let point = self.current_point()?;
        self.progress.start_phase();
        self.point_data.clear();
        if let Some(wiring) = self.wiring.as_ref() {
            wiring.reset_barrier(PREPARE_BARRIER);
            wiring.reset_barrier(MEASURE_BARRIER);
        }
        if self.progress.index() == 0 {
            if let Some(run) = self.calibration.as_ref() {
                self.emit(UiEvent::CalibrationStatus(run.status()));
            }
        }
        debug!(index = point.index, group = %point.group, wavelength = ?point.wavelength, "Preparing point");

        let shutter = if point.kind == PointKind::Dark {
            InstrumentCommand::CloseShutter
        } else {
            InstrumentCommand::OpenShutter
        };
        self.link(InstrumentName::ShutterControl)?
            .request(shutter)
            .await?;

        match kind {
            ExperimentKind::Transmission => {}
            ExperimentKind::ExcitationEmission | ExperimentKind::Decay => {
                if kind == ExperimentKind::Decay {
                    self.link(InstrumentName::Digitizer)?
                        .request(InstrumentCommand::ClearAccumulators)
                        .await?;
                }
                match point.wavelength.filter(|_| point.kind != PointKind::Dark) {
                    Some(wavelength) => {
                        if kind == ExperimentKind::ExcitationEmission {
                            self.link(InstrumentName::PowerMeter)?
                                .request(InstrumentCommand::SetPowerWavelength(wavelength))
                                .await?;
                        }
                        self.link(InstrumentName::Laser)?
                            .send(InstrumentCommand::SetLaserWavelength(wavelength))?;
                    }
                    // The laser is not tuned for the dark reference.
                    None => {
                        self.wiring()?
                            .set_flag(PREPARE_BARRIER, InstrumentName::Laser)?;
                    }
                }
            }
            ExperimentKind::Calibration => {
                let wavelength = point.wavelength.ok_or_else(|| {
                    DaqError::Dataset(format!("Calibration point {} has no wavelength", point.index))
                })?;
                self.link(InstrumentName::PowerMeter)?
                    .request(InstrumentCommand::SetPowerWavelength(wavelength))
                    .await?;
                self.link(InstrumentName::Laser)?
                    .send(InstrumentCommand::SetLaserWavelength(wavelength))?;
            }
        }

        if kind.scans_positions() {
            let (x, y) = point.x.zip(point.y).ok_or_else(|| {
                DaqError::Dataset(format!("Point {} has no stage position", point.index))
            })?;
            self.link(InstrumentName::XyStage)?
                .send(InstrumentCommand::MoveTo { x, y })?;
        }
        Ok(())
    }

    fn enter_measuring(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        if let Some(wiring) = self.wiring.as_ref() {
            wiring.reset_barrier(MEASURE_BARRIER);
        }
        let instrument = match kind {
            ExperimentKind::Transmission | ExperimentKind::ExcitationEmission => {
                InstrumentName::Spectrometer
            }
            ExperimentKind::Decay => InstrumentName::Digitizer,
            ExperimentKind::Calibration => InstrumentName::PowerMeter,
        };
        self.link(instrument)?.measure(self.origin())
    }

    async fn enter_writing(&mut self) -> AppResult<()> {
        self.progress.start_phase();
        let kind = self.kind()?;
        let point = self.current_point()?;

        if kind == ExperimentKind::Calibration {
            let (powers, times) = self.point_data.power.clone().ok_or_else(|| {
                DaqError::Dataset(format!("No power readings for point {}", point.index))
            })?;
            let run = self
                .calibration
                .as_mut()
                .ok_or_else(|| DaqError::Dataset("Calibration file is not open".to_string()))?;
            run.record(point.wavelength.unwrap_or_default(), &powers, &times)?;
        } else {
            let position = self.read_position().await?;
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| DaqError::Dataset("Dataset is not open".to_string()))?;
            writer.write_point(&point, Some(position), &self.point_data)?;
        }

        self.pending.push_back(Trigger::CalculateProgress);
        Ok(())
    }

    /// Stage readback, reconnecting the stage between failed attempts.
    async fn read_position(&mut self) -> AppResult<(f64, f64)> {
        let stage = self.link(InstrumentName::XyStage)?;
        let reply = retry_with_recovery(
            &self.options.retry,
            "position readback",
            || {
                let stage = stage.clone();
                async move { stage.request(InstrumentCommand::ReadPosition).await }
            },
            || {
                let stage = stage.clone();
                async move {
                    stage
                        .request(InstrumentCommand::Reconnect)
                        .await
                        .map(|_| ())
                }
            },
        )
        .await?;
        match reply {
            Reply::Position { x, y } => Ok((x, y)),
            other => Err(DaqError::instrument(
                InstrumentName::XyStage,
                format!("Unexpected reply to position readback: {:?}", other),
            )),
        }
    }

    async fn enter_calculating(&mut self) -> AppResult<()> {
        self.progress.end_phase();
        let report = self.progress.advance();
        self.emit(UiEvent::Progress(report.percent));
        self.emit(UiEvent::Ect(report.ect_seconds));
        info!(
            index = report.index,
            total = self.progress.total(),
            percent = report.percent,
            ect_s = report.ect_seconds,
            "Point finished"
        );

        if !self.progress.is_done() {
            self.pending.push_back(Trigger::Prepare);
            return Ok(());
        }

        let second_position = self
            .calibration
            .as_mut()
            .map(CalibrationRun::next_position)
            .unwrap_or(false);
        if second_position {
            self.link(InstrumentName::ShutterControl)?
                .request(InstrumentCommand::CloseShutter)
                .await?;
            self.progress.rewind();
            info!("Calibration position 1 done, waiting for the operator");
            self.emit(UiEvent::CalibrationHalf);
            self.emit(UiEvent::CalibrationStatus(
                "Move the power sensor to position 2 and continue".to_string(),
            ));
            self.pending.push_back(Trigger::WaitForUser);
        } else {
            self.pending.push_back(Trigger::MeasurementComplete);
        }
        Ok(())
    }

    async fn enter_completed(&mut self) -> AppResult<()> {
        let kind = self.kind()?;
        self.close_outputs()?;
        if let Some(wiring) = self.wiring.as_mut() {
            wiring.disconnect(WiringGroup::Loop);
            wiring.disconnect(WiringGroup::Configuration);
        }
        self.link(InstrumentName::ShutterControl)?
            .request(InstrumentCommand::CloseShutter)
            .await?;

        info!(run = self.run_id, experiment = %kind, "Run completed");
        if kind == ExperimentKind::Calibration {
            self.emit(UiEvent::CalibrationComplete);
            self.emit(UiEvent::CalibrationStatus("Calibration complete".to_string()));
        }
        self.emit(UiEvent::EnableMainGui(true));
        self.emit(UiEvent::ReturnSetExperiment);
        self.pending.push_back(Trigger::ReturnSetexperiment);
        Ok(())
    }

    async fn enter_aborted(&mut self) -> AppResult<()> {
        let reason = self
            .abort_reason
            .take()
            .unwrap_or_else(|| "Aborted by user".to_string());
        warn!(reason = %reason, run = self.run_id, "Measurement aborted");

        if let Err(e) = self.close_outputs() {
            error!(error = %e, "Closing output files failed");
        }
        self.stop_poll().await;
        if let Some(wiring) = self.wiring.as_mut() {
            wiring.disconnect_all();
        }

        let links: Vec<InstrumentLink> = self
            .instruments
            .values()
            .filter(|handle| handle.is_connected())
            .map(|handle| handle.link())
            .collect();
        if let Some(stage) = links.iter().find(|l| l.name() == InstrumentName::XyStage) {
            if let Err(e) = stage.request(InstrumentCommand::StopMotors).await {
                warn!(error = %e, "Stopping the stage failed");
            }
        }
        let resets = join_all(links.into_iter().map(|link| async move {
            let result = link
                .request(InstrumentCommand::ResetToAlignmentDefaults)
                .await;
            (link.name(), result)
        }))
        .await;
        for (name, result) in resets {
            if let Err(e) = result {
                warn!(instrument = %name, error = %e, "Reset to alignment defaults failed");
            }
        }

        self.emit(UiEvent::MeasurementAborted { reason });
        self.emit(UiEvent::EnableMainGui(true));
        self.pending.push_back(Trigger::Finalize);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instrument events and routing
    // ------------------------------------------------------------------

    fn on_instrument_event(&mut self, event: InstrumentEvent) {
        let mut wavelength = None;
        match &event {
            InstrumentEvent::MeasurementDone {
                instrument,
                origin,
                data,
            } => {
                self.emit(UiEvent::Readout {
                    instrument: *instrument,
                    data: data.clone(),
                });
                match origin {
                    MeasureOrigin::Poll => return,
                    MeasureOrigin::Run { run, index } => {
                        if !self.state.is_run()
                            || *run != self.run_id
                            || *index != self.progress.index()
                        {
                            debug!(instrument = %instrument, run, index, "Stale measurement discarded");
                            return;
                        }
                        self.point_data.store(data.clone());
                    }
                }
            }
            InstrumentEvent::Failed {
                instrument,
                operation,
                error,
                timeout,
            } => {
                if self.state.is_run() {
                    error!(instrument = %instrument, %operation, %error, timeout, "Instrument failed during a run");
                    self.abort_run(format!("{} failed during {}: {}", instrument, operation, error));
                } else {
                    warn!(instrument = %instrument, %operation, %error, state = %self.state, "Instrument command failed");
                }
                return;
            }
            InstrumentEvent::LaserWavelengthChanged { wavelength_nm } => {
                wavelength = Some(*wavelength_nm)
            }
            _ => {}
        }
        if let Some(signal) = Signal::from_event(&event, self.run_id) {
            self.route_signal(signal, wavelength);
        }
    }

    fn route_signal(&mut self, signal: Signal, wavelength: Option<f64>) {
        let routes = match self.wiring.as_ref() {
            Some(wiring) => wiring.routes(&signal),
            None => return,
        };
        for route in routes {
            if let Err(e) = self.apply_route(route, wavelength) {
                if self.state.is_run() {
                    self.abort_run(e.to_string());
                    return;
                }
                warn!(error = %e, ?signal, "Routed action failed");
            }
        }
    }

    fn apply_route(&mut self, route: Route, wavelength: Option<f64>) -> AppResult<()> {
        match route {
            Route::Fire(trigger) => self.pending.push_back(trigger),
            Route::SetFlag { barrier, flag } => {
                self.wiring()?.set_flag(barrier, flag)?;
            }
            Route::Measure(instrument) => {
                if self.state == State::MeasurementMeasuring {
                    self.link(instrument)?.measure(self.origin())?;
                } else {
                    trace!(instrument = %instrument, state = %self.state, "Measure route outside measuring ignored");
                }
            }
            Route::TrackPowerWavelength => {
                if let Some(wavelength) = wavelength {
                    self.link(InstrumentName::PowerMeter)?
                        .send(InstrumentCommand::SetPowerWavelength(wavelength))?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn select_experiment(&mut self, kind: ExperimentKind) -> AppResult<()> {
        if self.state != State::Waiting {
            return Err(DaqError::InvalidInput(format!(
                "The experiment can only be changed while waiting, not in {}",
                self.state
            )));
        }
        info!(experiment = %kind, "Experiment selected");
        self.experiment = Some(kind);
        Ok(())
    }

    fn update_settings(&mut self, settings: UiSettings) {
        if self.state.is_run() {
            warn!(state = %self.state, "Settings update ignored during a run");
            return;
        }
        debug!("UI settings replaced");
        self.ui = settings;
    }

    /// Manual control runs on its own task so a slow instrument never blocks the queue.
    fn forward_manual(
        &self,
        instrument: InstrumentName,
        command: InstrumentCommand,
        response: oneshot::Sender<AppResult<Reply>>,
    ) {
        if self.state.is_run() {
            let _ = response.send(Err(DaqError::InvalidInput(
                "Manual instrument control is disabled during a run".to_string(),
            )));
            return;
        }
        match self.link(instrument) {
            Ok(link) => {
                tokio::spawn(async move {
                    let _ = response.send(link.request(command).await);
                });
            }
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            state: self.state,
            experiment: self.experiment,
            index: self.progress.index(),
            total: self.progress.total(),
            polling: self.poll.as_ref().is_some_and(PollScheduler::is_running),
            calibration_position: self.calibration.as_ref().map(CalibrationRun::position),
            instruments: self
                .instruments
                .values()
                .map(|handle| InstrumentStatus {
                    name: handle.name(),
                    connected: handle.is_connected(),
                    measuring: handle.is_measuring(),
                })
                .collect(),
        }
    }

    async fn shutdown(&mut self) {
        self.stop_poll().await;
        if let Err(e) = self.close_outputs() {
            error!(error = %e, "Closing output files failed");
        }
        self.release_instruments().await;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn emit(&self, event: UiEvent) {
        // No subscriber is not an error.
        let _ = self.ui_events.send(event);
    }

    fn kind(&self) -> AppResult<ExperimentKind> {
        self.experiment.ok_or(DaqError::NoExperiment)
    }

    fn link(&self, instrument: InstrumentName) -> AppResult<InstrumentLink> {
        self.instruments
            .get(&instrument)
            .map(InstrumentHandle::link)
            .ok_or(DaqError::InstrumentMissing(instrument))
    }

    fn wiring(&self) -> AppResult<&Wiring> {
        self.wiring.as_ref().ok_or(DaqError::NoExperiment)
    }

    fn wiring_mut(&mut self) -> AppResult<&mut Wiring> {
        self.wiring.as_mut().ok_or(DaqError::NoExperiment)
    }

    fn origin(&self) -> MeasureOrigin {
        MeasureOrigin::Run {
            run: self.run_id,
            index: self.progress.index(),
        }
    }

    fn current_point(&self) -> AppResult<MeasurementPoint> {
        let index = self.progress.index();
        self.schedule
            .as_ref()
            .and_then(|schedule| schedule.point(index))
            .ok_or_else(|| DaqError::Dataset(format!("No measurement point at index {}", index)))
    }

    /// Best-effort command used while cleaning up.
    async fn request_logged(&mut self, instrument: InstrumentName, command: InstrumentCommand) {
        let Ok(link) = self.link(instrument) else {
            return;
        };
        if let Err(e) = link.request(command).await {
            warn!(instrument = %instrument, error = %e, "Cleanup command failed");
        }
    }

    async fn stop_poll(&mut self) {
        if let Some(poll) = self.poll.take() {
            poll.stop().await;
        }
    }

    /// Close the dataset and the calibration file, reporting the first failure.
    fn close_outputs(&mut self) -> AppResult<()> {
        let mut result = Ok(());
        if let Some(mut writer) = self.writer.take() {
            result = writer.close();
        }
        if let Some(mut run) = self.calibration.take() {
            let closed = run.close();
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }

    async fn release_instruments(&mut self) {
        let handles = std::mem::take(&mut self.instruments);
        join_all(handles.into_values().map(InstrumentHandle::shutdown)).await;
        self.wiring = None;
    }
}

/// Cloneable client of the orchestrator actor.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<OrchestratorMessage>,
    ui_events: broadcast::Sender<UiEvent>,
}

impl OrchestratorHandle {
    async fn call<T>(&self, (command, rx): (OrchestratorCommand, oneshot::Receiver<T>)) -> AppResult<T> {
        self.tx
            .send(OrchestratorMessage::Command(command))
            .map_err(|_| DaqError::OrchestratorGone)?;
        rx.await.map_err(|_| DaqError::OrchestratorGone)
    }

    /// Fire a trigger. Returns once its transition and entry action have run.
    pub async fn fire(&self, trigger: Trigger) -> AppResult<TransitionOutcome> {
        self.call(OrchestratorCommand::fire(trigger)).await
    }

    /// Choose the experiment for the next `init_experiment`.
    pub async fn select_experiment(&self, kind: ExperimentKind) -> AppResult<()> {
        self.call(OrchestratorCommand::select_experiment(kind)).await?
    }

    /// Replace the UI settings snapshot.
    pub async fn update_settings(&self, settings: UiSettings) -> AppResult<()> {
        self.call(OrchestratorCommand::update_settings(settings)).await
    }

    /// Manual instrument control outside a run.
    pub async fn instrument(
        &self,
        instrument: InstrumentName,
        command: InstrumentCommand,
    ) -> AppResult<Reply> {
        self.call(OrchestratorCommand::instrument(instrument, command))
            .await?
    }

    pub async fn status(&self) -> AppResult<OrchestratorStatus> {
        self.call(OrchestratorCommand::get_status()).await
    }

    /// Receive UI events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_events.subscribe()
    }

    /// Release all instruments and stop the actor.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.call(OrchestratorCommand::shutdown()).await
    }
}
