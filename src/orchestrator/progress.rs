//! Progress and estimated completion time.
//!
//! Wall-clock time is accumulated over the prepare, measure and write phases of every
//! point. Reference points count toward both the index and the total.

use std::time::{Duration, Instant};

/// Progress of one run (or one calibration position).
#[derive(Clone, Debug, Default)]
pub struct ProgressTracker {
    total: usize,
    index: usize,
    measurement_duration: Duration,
    phase_start: Option<Instant>,
}

/// Values reported after a point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressReport {
    pub index: usize,
    pub percent: u8,
    pub ect_seconds: u64,
}

impl ProgressTracker {
    /// Start over with `total` points.
    pub fn reset(&mut self, total: usize) {
        *self = Self {
            total,
            ..Self::default()
        };
    }

    /// Rewind the index without forgetting the total (second calibration position).
    pub fn rewind(&mut self) {
        self.index = 0;
        self.measurement_duration = Duration::ZERO;
        self.phase_start = None;
    }

    /// Entry of a timed phase.
    pub fn start_phase(&mut self) {
        self.phase_start = Some(Instant::now());
    }

    /// End of a timed phase; adds its duration.
    pub fn end_phase(&mut self) {
        if let Some(start) = self.phase_start.take() {
            self.measurement_duration += start.elapsed();
        }
    }

    /// Count one finished point.
    pub fn advance(&mut self) -> ProgressReport {
        self.index = (self.index + 1).min(self.total);
        let percent = (self.index * 100).checked_div(self.total).unwrap_or(100);
        let remaining = self.total - self.index;
        let per_point = self.measurement_duration.as_secs_f64() / self.index.max(1) as f64;
        ProgressReport {
            index: self.index,
            percent: percent.min(100) as u8,
            ect_seconds: (per_point * remaining as f64).round() as u64,
        }
    }

    /// Points finished so far.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Points in the schedule.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Time spent in timed phases.
    pub fn measurement_duration(&self) -> Duration {
        self.measurement_duration
    }

    /// Guard of the loop transitions.
    pub fn is_done(&self) -> bool {
        self.index >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_and_done() {
        let mut progress = ProgressTracker::default();
        progress.reset(6);
        assert!(!progress.is_done());
        let reports: Vec<u8> = (0..6).map(|_| progress.advance().percent).collect();
        assert_eq!(reports, vec![16, 33, 50, 66, 83, 100]);
        assert!(progress.is_done());
        // Never runs past the end.
        assert_eq!(progress.advance().index, 6);
    }

    #[test]
    fn test_ect_from_measured_phases() {
        let mut progress = ProgressTracker::default();
        progress.reset(4);
        progress.measurement_duration = Duration::from_secs(10);
        let report = progress.advance();
        assert_eq!(report.ect_seconds, 30);
        progress.measurement_duration = Duration::from_secs(20);
        assert_eq!(progress.advance().ect_seconds, 20);
    }

    #[test]
    fn test_rewind_keeps_total() {
        let mut progress = ProgressTracker::default();
        progress.reset(3);
        progress.start_phase();
        progress.end_phase();
        for _ in 0..3 {
            progress.advance();
        }
        progress.rewind();
        assert_eq!(progress.total(), 3);
        assert_eq!(progress.index(), 0);
        assert!(!progress.is_done());
    }

    #[test]
    fn test_empty_schedule_is_done() {
        let mut progress = ProgressTracker::default();
        progress.reset(0);
        assert!(progress.is_done());
        assert_eq!(progress.advance().percent, 100);
    }
}
