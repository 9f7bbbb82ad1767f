//! Alignment-mode poll scheduler.
//!
//! A background task ticks at `polltime` and queues a poll measurement on every
//! connected instrument that is not already measuring. It never waits for a result;
//! readouts come back through the orchestrator queue like any other event.

use crate::core::MeasureOrigin;
use crate::instrument::InstrumentLink;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Handle of a running poll task.
pub struct PollScheduler {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<u64>,
}

impl PollScheduler {
    /// Start polling `links`.
    pub fn start(links: Vec<InstrumentLink>, polltime: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = interval(polltime);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        ticks += 1;
                        for link in links.iter().filter(|l| l.is_connected()) {
                            if !link.try_measure(MeasureOrigin::Poll) {
                                trace!(instrument = %link.name(), "Still measuring, tick skipped");
                            }
                        }
                    }
                }
            }
            ticks
        });
        debug!(?polltime, "Poll scheduler started");
        Self {
            stop: Some(stop_tx),
            task,
        }
    }

    /// True until [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.stop.is_some() && !self.task.is_finished()
    }

    /// Stop ticking. Measurements already queued still complete.
    pub async fn stop(mut self) -> u64 {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(ticks) => {
                debug!(ticks, "Poll scheduler stopped");
                ticks
            }
            Err(_) => 0,
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventSink, InstrumentEvent, InstrumentName};
    use crate::instrument::mock::MockOptions;
    use crate::instrument::{InstrumentCommand, InstrumentHandle, InstrumentRegistry};
    use crate::messages::OrchestratorMessage;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_polls_only_connected_instruments() {
        let options = MockOptions {
            time_scale: 0.0,
            ..MockOptions::default()
        };
        let probe = options.probe.clone();
        let registry = InstrumentRegistry::simulated(options);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spawn = |name| {
            InstrumentHandle::spawn(
                registry.create(name).unwrap(),
                EventSink::new(name, tx.clone()),
                Duration::from_secs(1),
            )
        };
        let meter = spawn(InstrumentName::PowerMeter);
        let laser = spawn(InstrumentName::Laser);
        meter.request(InstrumentCommand::Connect).await.unwrap();

        let poll = PollScheduler::start(vec![meter.link(), laser.link()], Duration::from_millis(10));
        assert!(poll.is_running());
        let mut readouts = 0;
        while readouts < 3 {
            if let Some(OrchestratorMessage::Instrument(InstrumentEvent::MeasurementDone {
                instrument,
                ..
            })) = rx.recv().await
            {
                assert_eq!(instrument, InstrumentName::PowerMeter);
                readouts += 1;
            }
        }
        let ticks = poll.stop().await;
        assert!(ticks >= 3);
        assert_eq!(probe.count(InstrumentName::Laser, "measure"), 0);

        let after = probe.count(InstrumentName::PowerMeter, "measure");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.count(InstrumentName::PowerMeter, "measure"), after);
        meter.shutdown().await;
        laser.shutdown().await;
    }
}
