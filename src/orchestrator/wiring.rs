//! Per-experiment event wiring.
//!
//! Instrument completion records are turned into [`Signal`]s on the orchestrator's
//! context. A [`Wiring`] holds the routes that are currently connected and maps each
//! signal to the [`Route`]s the orchestrator must execute: fire a trigger, set a barrier
//! flag, start a measurement, or retune the power meter.
//!
//! Routes come in three groups with different lifetimes:
//!
//! | Group | Connected | Disconnected |
//! |---|---|---|
//! | `Alignment` | entering `align` | leaving `align` |
//! | `Configuration` | entering `parsing_configuration` | end of run |
//! | `Loop` | entering `opening_file` | end of run |

use crate::core::{InstrumentEvent, InstrumentName, MeasureOrigin};
use crate::error::{AppResult, DaqError};
use crate::experiment::ExperimentKind;
use crate::messages::OrchestratorMessage;
use crate::orchestrator::barrier::MultipleSignal;
use crate::orchestrator::state::Trigger;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Barrier fed by stage settling and laser tuning.
pub const PREPARE_BARRIER: &str = "prepare";
/// Barrier fed by the measurement completions of one point.
pub const MEASURE_BARRIER: &str = "measure";

/// Something that happened and may be routed.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    StageSettled,
    LaserStable,
    LaserWavelengthChanged,
    CacheCleared,
    MeasurementDone(InstrumentName),
    BarrierDone(String),
}

impl Signal {
    /// Signal carried by an instrument event.
    ///
    /// Only measurements of run `run` count; poll readouts and results of earlier runs
    /// produce no signal.
    pub fn from_event(event: &InstrumentEvent, run: u64) -> Option<Signal> {
        match event {
            InstrumentEvent::StageSettled { .. } => Some(Signal::StageSettled),
            InstrumentEvent::LaserStable { .. } => Some(Signal::LaserStable),
            InstrumentEvent::LaserWavelengthChanged { .. } => Some(Signal::LaserWavelengthChanged),
            InstrumentEvent::CacheCleared => Some(Signal::CacheCleared),
            InstrumentEvent::MeasurementDone {
                instrument,
                origin: MeasureOrigin::Run { run: r, .. },
                ..
            } if *r == run => Some(Signal::MeasurementDone(*instrument)),
            InstrumentEvent::MeasurementDone { .. } | InstrumentEvent::Failed { .. } => None,
        }
    }
}

/// What the orchestrator does when a routed signal arrives.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// Queue a trigger.
    Fire(Trigger),
    /// Set one flag of a barrier.
    SetFlag {
        barrier: &'static str,
        flag: InstrumentName,
    },
    /// Start a run measurement on an instrument.
    Measure(InstrumentName),
    /// Follow the laser wavelength with the power meter.
    TrackPowerWavelength,
}

/// Lifetime class of a route.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WiringGroup {
    Alignment,
    Configuration,
    Loop,
}

#[derive(Clone, Debug)]
struct Binding {
    group: WiringGroup,
    signal: Signal,
    route: Route,
}

fn bind(group: WiringGroup, signal: Signal, route: Route) -> Binding {
    Binding {
        group,
        signal,
        route,
    }
}

fn bindings(kind: ExperimentKind, group: WiringGroup) -> Vec<Binding> {
    use ExperimentKind as K;
    use InstrumentName as I;
    use WiringGroup as G;

    let prepare_barrier = || {
        vec![
            bind(
                G::Loop,
                Signal::StageSettled,
                Route::SetFlag {
                    barrier: PREPARE_BARRIER,
                    flag: I::XyStage,
                },
            ),
            bind(
                G::Loop,
                Signal::LaserStable,
                Route::SetFlag {
                    barrier: PREPARE_BARRIER,
                    flag: I::Laser,
                },
            ),
            bind(
                G::Loop,
                Signal::BarrierDone(PREPARE_BARRIER.to_string()),
                Route::Fire(Trigger::Measure),
            ),
        ]
    };

    match (kind, group) {
        (K::Transmission, G::Loop) => vec![
            bind(G::Loop, Signal::StageSettled, Route::Fire(Trigger::Measure)),
            bind(
                G::Loop,
                Signal::MeasurementDone(I::Spectrometer),
                Route::Fire(Trigger::ProcessData),
            ),
        ],

        (K::ExcitationEmission, G::Alignment) => vec![bind(
            G::Alignment,
            Signal::LaserWavelengthChanged,
            Route::TrackPowerWavelength,
        )],
        (K::ExcitationEmission, G::Configuration) => vec![bind(
            G::Configuration,
            Signal::CacheCleared,
            Route::Measure(I::PowerMeter),
        )],
        (K::ExcitationEmission, G::Loop) => {
            let mut routes = prepare_barrier();
            routes.extend([
                bind(
                    G::Loop,
                    Signal::MeasurementDone(I::Spectrometer),
                    Route::SetFlag {
                        barrier: MEASURE_BARRIER,
                        flag: I::Spectrometer,
                    },
                ),
                bind(
                    G::Loop,
                    Signal::MeasurementDone(I::PowerMeter),
                    Route::SetFlag {
                        barrier: MEASURE_BARRIER,
                        flag: I::PowerMeter,
                    },
                ),
                bind(
                    G::Loop,
                    Signal::BarrierDone(MEASURE_BARRIER.to_string()),
                    Route::Fire(Trigger::ProcessData),
                ),
            ]);
            routes
        }

        (K::Decay, G::Loop) => {
            let mut routes = prepare_barrier();
            routes.push(bind(
                G::Loop,
                Signal::MeasurementDone(I::Digitizer),
                Route::Fire(Trigger::ProcessData),
            ));
            routes
        }

        (K::Calibration, G::Configuration) => vec![bind(
            G::Configuration,
            Signal::StageSettled,
            Route::Fire(Trigger::StartExperiment),
        )],
        (K::Calibration, G::Loop) => vec![
            bind(G::Loop, Signal::LaserStable, Route::Fire(Trigger::Measure)),
            bind(
                G::Loop,
                Signal::MeasurementDone(I::PowerMeter),
                Route::Fire(Trigger::ProcessData),
            ),
        ],

        _ => Vec::new(),
    }
}

fn barrier_signals(kind: ExperimentKind) -> Vec<(&'static str, Vec<InstrumentName>)> {
    match kind {
        ExperimentKind::ExcitationEmission => vec![
            (
                PREPARE_BARRIER,
                vec![InstrumentName::XyStage, InstrumentName::Laser],
            ),
            (
                MEASURE_BARRIER,
                vec![InstrumentName::Spectrometer, InstrumentName::PowerMeter],
            ),
        ],
        ExperimentKind::Decay => vec![(
            PREPARE_BARRIER,
            vec![InstrumentName::XyStage, InstrumentName::Laser],
        )],
        ExperimentKind::Transmission | ExperimentKind::Calibration => Vec::new(),
    }
}

/// Routes and barriers of one experiment.
pub struct Wiring {
    kind: ExperimentKind,
    bindings: Vec<Binding>,
    barriers: BTreeMap<&'static str, MultipleSignal>,
    done: mpsc::UnboundedSender<OrchestratorMessage>,
}

impl std::fmt::Debug for Wiring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wiring")
            .field("kind", &self.kind)
            .field("bindings", &self.bindings.len())
            .field("barriers", &self.barriers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Wiring {
    /// Nothing connected.
    pub fn new(kind: ExperimentKind, done: mpsc::UnboundedSender<OrchestratorMessage>) -> Self {
        Self {
            kind,
            bindings: Vec::new(),
            barriers: BTreeMap::new(),
            done,
        }
    }

    /// Experiment this wiring belongs to.
    pub fn kind(&self) -> ExperimentKind {
        self.kind
    }

    /// Connect one group. Connecting twice replaces the earlier routes.
    pub fn connect(&mut self, group: WiringGroup) {
        self.disconnect(group);
        let routes = bindings(self.kind, group);
        debug!(kind = %self.kind, ?group, routes = routes.len(), "Wiring connected");
        self.bindings.extend(routes);
        if group == WiringGroup::Loop {
            for (name, signals) in barrier_signals(self.kind) {
                let flags: Vec<&str> = signals.iter().map(|s| s.as_str()).collect();
                self.barriers
                    .insert(name, MultipleSignal::new(name, &flags, self.done.clone()));
            }
        }
    }

    /// Disconnect one group.
    pub fn disconnect(&mut self, group: WiringGroup) {
        let before = self.bindings.len();
        self.bindings.retain(|b| b.group != group);
        if group == WiringGroup::Loop {
            self.barriers.clear();
        }
        if before != self.bindings.len() {
            debug!(kind = %self.kind, ?group, "Wiring disconnected");
        }
    }

    /// Disconnect every group.
    pub fn disconnect_all(&mut self) {
        self.bindings.clear();
        self.barriers.clear();
    }

    /// True if any route of `group` is connected.
    pub fn is_connected(&self, group: WiringGroup) -> bool {
        self.bindings.iter().any(|b| b.group == group)
    }

    /// Routes connected to `signal`.
    pub fn routes(&self, signal: &Signal) -> Vec<Route> {
        let routes: Vec<Route> = self
            .bindings
            .iter()
            .filter(|b| &b.signal == signal)
            .map(|b| b.route.clone())
            .collect();
        trace!(?signal, routes = routes.len(), "Signal routed");
        routes
    }

    /// Barrier by name.
    pub fn barrier(&self, name: &str) -> Option<&MultipleSignal> {
        self.barriers.get(name)
    }

    /// Start a new cycle of a barrier. Unknown barriers are ignored.
    pub fn reset_barrier(&self, name: &str) {
        if let Some(barrier) = self.barriers.get(name) {
            barrier.reset();
        }
    }

    /// Set a barrier flag. Returns true if this completed the barrier.
    pub fn set_flag(&self, barrier: &str, flag: InstrumentName) -> AppResult<bool> {
        self.barriers
            .get(barrier)
            .ok_or_else(|| DaqError::UnknownSignal {
                barrier: barrier.to_string(),
                signal: flag.as_str().to_string(),
            })?
            .set(flag.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MeasurementData;

    fn wiring(kind: ExperimentKind) -> (Wiring, mpsc::UnboundedReceiver<OrchestratorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Wiring::new(kind, tx), rx)
    }

    #[test]
    fn test_stale_and_poll_measurements_produce_no_signal() {
        let done = |origin| InstrumentEvent::MeasurementDone {
            instrument: InstrumentName::Spectrometer,
            origin,
            data: MeasurementData::Shutter { open: true },
        };
        assert_eq!(Signal::from_event(&done(MeasureOrigin::Poll), 3), None);
        assert_eq!(
            Signal::from_event(&done(MeasureOrigin::Run { run: 2, index: 0 }), 3),
            None
        );
        assert_eq!(
            Signal::from_event(&done(MeasureOrigin::Run { run: 3, index: 0 }), 3),
            Some(Signal::MeasurementDone(InstrumentName::Spectrometer))
        );
    }

    #[test]
    fn test_transmission_loop_routes() {
        let (mut wiring, _rx) = wiring(ExperimentKind::Transmission);
        assert!(wiring.routes(&Signal::StageSettled).is_empty());
        wiring.connect(WiringGroup::Loop);
        assert_eq!(
            wiring.routes(&Signal::StageSettled),
            vec![Route::Fire(Trigger::Measure)]
        );
        assert_eq!(
            wiring.routes(&Signal::MeasurementDone(InstrumentName::Spectrometer)),
            vec![Route::Fire(Trigger::ProcessData)]
        );
        wiring.disconnect(WiringGroup::Loop);
        assert!(wiring.routes(&Signal::StageSettled).is_empty());
    }

    #[test]
    fn test_excitation_emission_barriers_fire_once() {
        let (mut wiring, mut rx) = wiring(ExperimentKind::ExcitationEmission);
        wiring.connect(WiringGroup::Configuration);
        wiring.connect(WiringGroup::Loop);
        assert_eq!(
            wiring.routes(&Signal::CacheCleared),
            vec![Route::Measure(InstrumentName::PowerMeter)]
        );
        assert!(!wiring
            .set_flag(PREPARE_BARRIER, InstrumentName::XyStage)
            .unwrap());
        assert!(wiring.set_flag(PREPARE_BARRIER, InstrumentName::Laser).unwrap());
        match rx.try_recv().unwrap() {
            OrchestratorMessage::BarrierDone { barrier } => {
                assert_eq!(
                    wiring.routes(&Signal::BarrierDone(barrier)),
                    vec![Route::Fire(Trigger::Measure)]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert!(wiring
            .set_flag(MEASURE_BARRIER, InstrumentName::Laser)
            .is_err());
    }

    #[test]
    fn test_disconnect_drops_barriers() {
        let (mut wiring, _rx) = wiring(ExperimentKind::Decay);
        wiring.connect(WiringGroup::Loop);
        assert!(wiring.barrier(PREPARE_BARRIER).is_some());
        assert!(wiring.barrier(MEASURE_BARRIER).is_none());
        wiring.disconnect_all();
        assert!(wiring.barrier(PREPARE_BARRIER).is_none());
        assert!(!wiring.is_connected(WiringGroup::Loop));
        assert!(wiring
            .set_flag(PREPARE_BARRIER, InstrumentName::XyStage)
            .is_err());
    }

    #[test]
    fn test_calibration_start_is_configuration_scoped() {
        let (mut wiring, _rx) = wiring(ExperimentKind::Calibration);
        wiring.connect(WiringGroup::Configuration);
        assert_eq!(
            wiring.routes(&Signal::StageSettled),
            vec![Route::Fire(Trigger::StartExperiment)]
        );
        wiring.disconnect(WiringGroup::Configuration);
        wiring.connect(WiringGroup::Loop);
        assert!(wiring.routes(&Signal::StageSettled).is_empty());
        assert_eq!(
            wiring.routes(&Signal::LaserStable),
            vec![Route::Fire(Trigger::Measure)]
        );
    }
}
