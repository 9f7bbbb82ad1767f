//! Multiple-signal barrier.
//!
//! A named set of flags. Contributors set their own flag once per cycle; the call
//! that completes the set posts a single `BarrierDone` to the orchestrator queue, so
//! the continuation always runs on the orchestrator's own context. `reset()` starts a
//! new cycle. Flags and the fired marker live under one mutex, which makes the
//! "exactly once per cycle" guarantee hold for racing setters on any thread.

use crate::error::{AppResult, DaqError};
use crate::messages::OrchestratorMessage;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug)]
struct Flags {
    flags: BTreeMap<String, bool>,
    fired: bool,
}

/// Fan-in node over a declared set of completion signals.
#[derive(Debug)]
pub struct MultipleSignal {
    name: String,
    state: Mutex<Flags>,
    done: mpsc::UnboundedSender<OrchestratorMessage>,
}

impl MultipleSignal {
    /// Barrier with all flags false.
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        signals: &[S],
        done: mpsc::UnboundedSender<OrchestratorMessage>,
    ) -> Self {
        let flags = signals
            .iter()
            .map(|s| (s.as_ref().to_string(), false))
            .collect();
        Self {
            name: name.into(),
            state: Mutex::new(Flags {
                flags,
                fired: false,
            }),
            done,
        }
    }

    /// Barrier name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mark `signal` as arrived. Returns true if this call completed the set.
    pub fn set(&self, signal: &str) -> AppResult<bool> {
        let mut state = self.lock();
        let flag = state
            .flags
            .get_mut(signal)
            .ok_or_else(|| DaqError::UnknownSignal {
                barrier: self.name.clone(),
                signal: signal.to_string(),
            })?;
        if *flag {
            debug!(barrier = %self.name, signal, "Signal already set in this cycle");
        }
        *flag = true;

        if state.fired || !state.flags.values().all(|set| *set) {
            trace!(barrier = %self.name, signal, "Barrier flag set");
            return Ok(false);
        }
        state.fired = true;
        drop(state);

        debug!(barrier = %self.name, "Barrier complete");
        if self
            .done
            .send(OrchestratorMessage::BarrierDone {
                barrier: self.name.clone(),
            })
            .is_err()
        {
            debug!(barrier = %self.name, "Orchestrator queue closed");
        }
        Ok(true)
    }

    /// Clear all flags and start a new cycle.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.flags.values_mut().for_each(|flag| *flag = false);
        state.fired = false;
    }

    /// Current value of one flag.
    pub fn is_set(&self, signal: &str) -> bool {
        self.lock().flags.get(signal).copied().unwrap_or(false)
    }

    /// True when every flag is set.
    pub fn all_set(&self) -> bool {
        self.lock().flags.values().all(|set| *set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<OrchestratorMessage>) -> usize {
        let mut count = 0;
        while let Ok(msg) = rx.try_recv() {
            assert!(matches!(msg, OrchestratorMessage::BarrierDone { ref barrier } if barrier == "measure"));
            count += 1;
        }
        count
    }

    #[test]
    fn test_fires_once_all_flags_set() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let barrier = MultipleSignal::new("measure", &["spectrometer", "powermeter"], tx);
        assert!(!barrier.set("spectrometer").unwrap());
        assert_eq!(drain(&mut rx), 0);
        assert!(barrier.set("powermeter").unwrap());
        assert_eq!(drain(&mut rx), 1);
        // A late duplicate does not fire again.
        assert!(!barrier.set("powermeter").unwrap());
        assert_eq!(drain(&mut rx), 0);
    }

    #[test]
    fn test_reset_round_trip_single_signal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let barrier = MultipleSignal::new("measure", &["digitizer"], tx);
        assert!(barrier.set("digitizer").unwrap());
        barrier.reset();
        assert!(!barrier.is_set("digitizer"));
        assert!(!barrier.all_set());
        assert!(barrier.set("digitizer").unwrap());
        assert_eq!(drain(&mut rx), 2);
    }

    #[test]
    fn test_unknown_signal_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let barrier = MultipleSignal::new("prepare", &["xystage", "laser"], tx);
        assert!(matches!(
            barrier.set("spectrometer"),
            Err(DaqError::UnknownSignal { .. })
        ));
    }

    #[test]
    fn test_racing_setters_fire_exactly_once() {
        for _ in 0..50 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let names: Vec<String> = (0..8).map(|i| format!("s{}", i)).collect();
            let barrier = Arc::new(MultipleSignal::new("measure", &names, tx));
            let threads: Vec<_> = names
                .iter()
                .cloned()
                .map(|name| {
                    let barrier = barrier.clone();
                    std::thread::spawn(move || barrier.set(&name).unwrap())
                })
                .collect();
            let fired: usize = threads
                .into_iter()
                .map(|t| usize::from(t.join().unwrap()))
                .sum();
            assert_eq!(fired, 1);
            assert_eq!(drain(&mut rx), 1);
        }
    }
}
