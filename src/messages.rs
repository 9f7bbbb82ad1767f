//! Message types for actor-based communication
//!
//! This module defines the messages that flow into the orchestrator's single-consumer
//! queue and the events it publishes for the user interface. Commands carry a
//! `oneshot` responder; the helper constructors return the command together with the
//! receiving end, mirroring a request/response call over the queue.

use crate::config::UiSettings;
use crate::core::{InstrumentEvent, InstrumentName, MeasurementData};
use crate::error::AppResult;
use crate::experiment::ExperimentKind;
use crate::instrument::worker::{InstrumentCommand, Reply};
use crate::orchestrator::state::{State, Trigger, TransitionOutcome};
use serde::Serialize;
use tokio::sync::oneshot;

/// Everything the orchestrator consumes, in arrival order.
#[derive(Debug)]
pub enum OrchestratorMessage {
    /// Request from the UI or the CLI.
    Command(OrchestratorCommand),
    /// Completion record from an instrument worker.
    Instrument(InstrumentEvent),
    /// A multiple-signal barrier completed.
    BarrierDone { barrier: String },
}

/// Commands that can be sent to the orchestrator
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Fire a trigger (queued behind any transition in flight)
    Fire {
        trigger: Trigger,
        response: oneshot::Sender<TransitionOutcome>,
    },

    /// Choose the experiment for the next `init_experiment`
    SelectExperiment {
        kind: ExperimentKind,
        response: oneshot::Sender<AppResult<()>>,
    },

    /// Replace the UI settings snapshot
    UpdateSettings {
        settings: Box<UiSettings>,
        response: oneshot::Sender<()>,
    },

    /// Manual instrument control (alignment mode)
    Instrument {
        instrument: InstrumentName,
        command: InstrumentCommand,
        response: oneshot::Sender<AppResult<Reply>>,
    },

    /// Current state and progress
    GetStatus {
        response: oneshot::Sender<OrchestratorStatus>,
    },

    /// Release all instruments and stop the actor
    Shutdown { response: oneshot::Sender<()> },
}

impl OrchestratorCommand {
    /// Helper to create a Fire command
    pub fn fire(trigger: Trigger) -> (Self, oneshot::Receiver<TransitionOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Fire {
                trigger,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a SelectExperiment command
    pub fn select_experiment(kind: ExperimentKind) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SelectExperiment { kind, response: tx }, rx)
    }

    /// Helper to create an UpdateSettings command
    pub fn update_settings(settings: UiSettings) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::UpdateSettings {
                settings: Box::new(settings),
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create an Instrument command
    pub fn instrument(
        instrument: InstrumentName,
        command: InstrumentCommand,
    ) -> (Self, oneshot::Receiver<AppResult<Reply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Instrument {
                instrument,
                command,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetStatus command
    pub fn get_status() -> (Self, oneshot::Receiver<OrchestratorStatus>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetStatus { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

/// Connection state of one instrument as seen by the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstrumentStatus {
    pub name: InstrumentName,
    pub connected: bool,
    pub measuring: bool,
}

/// Snapshot returned by `GetStatus`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrchestratorStatus {
    #[serde(serialize_with = "serialize_display")]
    pub state: State,
    pub experiment: Option<ExperimentKind>,
    pub index: usize,
    pub total: usize,
    pub polling: bool,
    pub calibration_position: Option<u8>,
    pub instruments: Vec<InstrumentStatus>,
}

fn serialize_display<S: serde::Serializer>(state: &State, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(state.as_str())
}

/// Events published to the user interface.
#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    /// `signalstatechange`
    StateChanged(State),
    /// Percent of the schedule done.
    Progress(u8),
    /// Estimated seconds to completion.
    Ect(u64),
    /// Position 1 of a calibration is done; the operator must move the power sensor.
    CalibrationHalf,
    /// Both calibration positions are done.
    CalibrationComplete,
    /// Free-text calibration status.
    CalibrationStatus(String),
    InstrumentConnectSuccessful,
    InstrumentConnectFailed {
        instrument: InstrumentName,
        error: String,
    },
    /// Instruments run on their own workers from now on.
    InitInstrumentThreads,
    /// Whether the settings widgets may be edited.
    EnableMainGui(bool),
    /// The run finished and the machine is back in `set_experiment`.
    ReturnSetExperiment,
    /// Live readout while aligning.
    Readout {
        instrument: InstrumentName,
        data: MeasurementData,
    },
    /// The run was aborted.
    MeasurementAborted { reason: String },
}
