//! States, triggers and the transition table.
//!
//! The table is declared in `statemachine.yaml` (a copy is embedded in the binary).
//! Nested states are flattened with `_`, so `measurement.preparing` becomes
//! `measurement_preparing`. `source: "*"` matches every state; explicit sources win
//! over `*` when both match.

use crate::error::{AppResult, DaqError};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const BUILTIN_STATE_MACHINE: &str = include_str!("../../config/statemachine.yaml");

/// Orchestrator state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum State {
    Waiting,
    Connecting,
    Align,
    SetExperiment,
    ParsingConfiguration,
    OpeningFile,
    MeasurementPreparing,
    MeasurementMeasuring,
    MeasurementProcessingData,
    MeasurementWritingToFile,
    MeasurementCalculatingProgress,
    WaitingForUser,
    MeasurementCompleted,
    MeasurementAborted,
}

impl State {
    /// Every state.
    pub const ALL: [State; 14] = [
        State::Waiting,
        State::Connecting,
        State::Align,
        State::SetExperiment,
        State::ParsingConfiguration,
        State::OpeningFile,
        State::MeasurementPreparing,
        State::MeasurementMeasuring,
        State::MeasurementProcessingData,
        State::MeasurementWritingToFile,
        State::MeasurementCalculatingProgress,
        State::WaitingForUser,
        State::MeasurementCompleted,
        State::MeasurementAborted,
    ];

    /// Flattened state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Waiting => "waiting",
            State::Connecting => "connecting",
            State::Align => "align",
            State::SetExperiment => "set_experiment",
            State::ParsingConfiguration => "parsing_configuration",
            State::OpeningFile => "opening_file",
            State::MeasurementPreparing => "measurement_preparing",
            State::MeasurementMeasuring => "measurement_measuring",
            State::MeasurementProcessingData => "measurement_processing_data",
            State::MeasurementWritingToFile => "measurement_writing_to_file",
            State::MeasurementCalculatingProgress => "measurement_calculating_progress",
            State::WaitingForUser => "waiting_for_user",
            State::MeasurementCompleted => "measurement_completed",
            State::MeasurementAborted => "measurement_aborted",
        }
    }

    /// True between `parsing configuration` and the end of the loop.
    pub fn is_run(&self) -> bool {
        matches!(
            self,
            State::ParsingConfiguration
                | State::OpeningFile
                | State::MeasurementPreparing
                | State::MeasurementMeasuring
                | State::MeasurementProcessingData
                | State::MeasurementWritingToFile
                | State::MeasurementCalculatingProgress
                | State::WaitingForUser
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown state '{}'", s)))
    }
}

/// Named trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    InitExperiment,
    ConnectAll,
    ConnectFailed,
    Align,
    AlignExperiment,
    ParseConfig,
    StartExperiment,
    Prepare,
    Measure,
    ProcessData,
    WriteFile,
    CalculateProgress,
    ContinueExperiment,
    WaitForUser,
    MeasurementComplete,
    MeasurementAborted,
    Abort,
    ReturnSetexperiment,
    Finalize,
}

impl Trigger {
    /// Every trigger.
    pub const ALL: [Trigger; 19] = [
        Trigger::InitExperiment,
        Trigger::ConnectAll,
        Trigger::ConnectFailed,
        Trigger::Align,
        Trigger::AlignExperiment,
        Trigger::ParseConfig,
        Trigger::StartExperiment,
        Trigger::Prepare,
        Trigger::Measure,
        Trigger::ProcessData,
        Trigger::WriteFile,
        Trigger::CalculateProgress,
        Trigger::ContinueExperiment,
        Trigger::WaitForUser,
        Trigger::MeasurementComplete,
        Trigger::MeasurementAborted,
        Trigger::Abort,
        Trigger::ReturnSetexperiment,
        Trigger::Finalize,
    ];

    /// Trigger name as used in the table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::InitExperiment => "init_experiment",
            Trigger::ConnectAll => "connect_all",
            Trigger::ConnectFailed => "connect_failed",
            Trigger::Align => "align",
            Trigger::AlignExperiment => "align_experiment",
            Trigger::ParseConfig => "parse_config",
            Trigger::StartExperiment => "start_experiment",
            Trigger::Prepare => "prepare",
            Trigger::Measure => "measure",
            Trigger::ProcessData => "process_data",
            Trigger::WriteFile => "write_file",
            Trigger::CalculateProgress => "calculate_progress",
            Trigger::ContinueExperiment => "continue_experiment",
            Trigger::WaitForUser => "wait_for_user",
            Trigger::MeasurementComplete => "measurement_complete",
            Trigger::MeasurementAborted => "measurement_aborted",
            Trigger::Abort => "abort",
            Trigger::ReturnSetexperiment => "return_setexperiment",
            Trigger::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trigger::ALL
            .into_iter()
            .find(|trigger| trigger.as_str() == s)
            .ok_or_else(|| DaqError::Configuration(format!("Unknown trigger '{}'", s)))
    }
}

/// Transition guard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Guard {
    /// The schedule is exhausted.
    IsDone,
}

/// Where a transition may start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Any,
    States(Vec<State>),
}

/// One row of the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub trigger: Trigger,
    pub source: Source,
    pub dest: State,
    /// Transition is blocked while the guard holds.
    pub unless: Option<Guard>,
}

/// Result of firing a trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The machine moved to the given state.
    Transitioned(State),
    /// The trigger is not valid in the current state.
    Ignored,
    /// An `unless` guard blocked the transition.
    Blocked,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StateSpec {
    Leaf(String),
    Nested {
        name: String,
        children: Vec<StateSpec>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SourceSpec {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct TransitionSpec {
    trigger: String,
    source: SourceSpec,
    dest: String,
    #[serde(default)]
    unless: Option<String>,
}

#[derive(Deserialize)]
struct StateMachineSpec {
    initial: String,
    #[serde(default)]
    queued: bool,
    states: Vec<StateSpec>,
    transitions: Vec<TransitionSpec>,
}

fn flatten(prefix: &str, specs: &[StateSpec], out: &mut Vec<String>) {
    for spec in specs {
        match spec {
            StateSpec::Leaf(name) if prefix.is_empty() => out.push(name.clone()),
            StateSpec::Leaf(name) => out.push(format!("{}_{}", prefix, name)),
            StateSpec::Nested { name, children } => {
                let nested = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}_{}", prefix, name)
                };
                flatten(&nested, children, out);
            }
        }
    }
}

/// Validated transition table.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionTable {
    initial: State,
    transitions: Vec<Transition>,
}

impl TransitionTable {
    /// The table shipped with the crate.
    pub fn builtin() -> AppResult<Self> {
        Self::from_yaml(BUILTIN_STATE_MACHINE)
    }

    /// Load a table from a YAML file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DaqError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a table.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        let spec: StateMachineSpec = serde_yaml::from_str(text)?;
        if !spec.queued {
            return Err(DaqError::Configuration(
                "State machine must be declared with 'queued: true'".to_string(),
            ));
        }

        let mut declared = Vec::new();
        flatten("", &spec.states, &mut declared);
        let declared = declared
            .iter()
            .map(|name| name.parse::<State>())
            .collect::<AppResult<Vec<State>>>()?;
        if let Some(missing) = State::ALL.iter().find(|s| !declared.contains(s)) {
            return Err(DaqError::Configuration(format!(
                "State '{}' is not declared",
                missing
            )));
        }

        let initial: State = spec.initial.parse()?;
        let transitions = spec
            .transitions
            .into_iter()
            .map(|t| {
                let source = match t.source {
                    SourceSpec::One(s) if s == "*" => Source::Any,
                    SourceSpec::One(s) => Source::States(vec![s.parse()?]),
                    SourceSpec::Many(list) => Source::States(
                        list.iter()
                            .map(|s| s.parse())
                            .collect::<AppResult<Vec<State>>>()?,
                    ),
                };
                let unless = match t.unless.as_deref() {
                    None => None,
                    Some("is_done") => Some(Guard::IsDone),
                    Some(other) => {
                        return Err(DaqError::Configuration(format!("Unknown guard '{}'", other)))
                    }
                };
                Ok(Transition {
                    trigger: t.trigger.parse()?,
                    source,
                    dest: t.dest.parse()?,
                    unless,
                })
            })
            .collect::<AppResult<Vec<Transition>>>()?;

        Ok(Self {
            initial,
            transitions,
        })
    }

    /// Initial state.
    pub fn initial(&self) -> State {
        self.initial
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// True for an empty table.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Row that `trigger` selects in `state`, if any.
    pub fn resolve(&self, state: State, trigger: Trigger) -> Option<&Transition> {
        let candidates = || self.transitions.iter().filter(move |t| t.trigger == trigger);
        candidates()
            .find(|t| matches!(&t.source, Source::States(states) if states.contains(&state)))
            .or_else(|| candidates().find(|t| t.source == Source::Any))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = TransitionTable::builtin().unwrap();
        assert_eq!(table.initial(), State::Waiting);
        assert!(!table.is_empty());
    }

    #[test]
    fn test_measurement_loop_edges() {
        let table = TransitionTable::builtin().unwrap();
        let step = |state, trigger| table.resolve(state, trigger).map(|t| t.dest);
        assert_eq!(
            step(State::OpeningFile, Trigger::Prepare),
            Some(State::MeasurementPreparing)
        );
        assert_eq!(
            step(State::MeasurementCalculatingProgress, Trigger::Prepare),
            Some(State::MeasurementPreparing)
        );
        assert_eq!(
            step(State::MeasurementPreparing, Trigger::Measure),
            Some(State::MeasurementMeasuring)
        );
        assert_eq!(step(State::Waiting, Trigger::Measure), None);
        let prepare = table
            .resolve(State::OpeningFile, Trigger::Prepare)
            .unwrap();
        assert_eq!(prepare.unless, Some(Guard::IsDone));
        let write = table
            .resolve(State::MeasurementProcessingData, Trigger::WriteFile)
            .unwrap();
        assert_eq!(write.unless, None);
    }

    #[test]
    fn test_align_experiment_toggles() {
        let table = TransitionTable::builtin().unwrap();
        assert_eq!(
            table.resolve(State::Align, Trigger::AlignExperiment).unwrap().dest,
            State::SetExperiment
        );
        assert_eq!(
            table
                .resolve(State::SetExperiment, Trigger::AlignExperiment)
                .unwrap()
                .dest,
            State::Align
        );
    }

    #[test]
    fn test_abort_and_finalize_from_any_state() {
        let table = TransitionTable::builtin().unwrap();
        for state in State::ALL {
            assert_eq!(
                table.resolve(state, Trigger::Abort).unwrap().dest,
                State::MeasurementAborted
            );
            assert_eq!(
                table.resolve(state, Trigger::Finalize).unwrap().dest,
                State::Waiting
            );
        }
    }

    #[test]
    fn test_rejects_unqueued_machine() {
        let yaml = BUILTIN_STATE_MACHINE.replace("queued: true", "queued: false");
        assert!(TransitionTable::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_rejects_unknown_names() {
        let yaml = format!(
            "{}\n  - {{ trigger: teleport, source: waiting, dest: align }}\n",
            BUILTIN_STATE_MACHINE.trim_end()
        );
        assert!(TransitionTable::from_yaml(&yaml).is_err());

        let yaml = BUILTIN_STATE_MACHINE.replace("- waiting_for_user", "- waiting_for_godot");
        assert!(TransitionTable::from_yaml(&yaml).is_err());
    }
}
