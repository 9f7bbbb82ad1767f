//! Two-position beamsplitter calibration bookkeeping.
//!
//! The power sensor is measured at position 1 over the whole wavelength list, the
//! operator moves it, then position 2 repeats the list. Every power reading becomes
//! one CSV row.

use crate::data::calibration::{CalibrationRow, CalibrationWriter};
use crate::error::{AppResult, DaqError};
use std::path::Path;
use tracing::info;

/// Calibration run in progress.
pub struct CalibrationRun {
    position: u8,
    writer: CalibrationWriter,
}

impl CalibrationRun {
    /// Create the CSV file and start at position 1.
    pub fn start(path: &Path) -> AppResult<Self> {
        let writer = CalibrationWriter::create(path)?;
        info!(path = %path.display(), "Calibration started");
        Ok(Self {
            position: 1,
            writer,
        })
    }

    /// Sensor position being measured (1 or 2).
    pub fn position(&self) -> u8 {
        self.position
    }

    /// CSV location.
    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Append one row per reading. Returns the number of rows written.
    pub fn record(&mut self, wavelength: f64, powers: &[f64], times: &[f64]) -> AppResult<usize> {
        if powers.len() != times.len() {
            return Err(DaqError::Dataset(format!(
                "{} power readings but {} timestamps at {} nm",
                powers.len(),
                times.len(),
                wavelength
            )));
        }
        for (power, time) in powers.iter().zip(times) {
            self.writer.append(&CalibrationRow {
                wavelength,
                position: self.position,
                power: *power,
                time: *time,
            })?;
        }
        Ok(powers.len())
    }

    /// Switch to position 2. Returns false if position 2 was already measured.
    pub fn next_position(&mut self) -> bool {
        if self.position >= 2 {
            return false;
        }
        self.position = 2;
        true
    }

    /// Operator-facing status line.
    pub fn status(&self) -> String {
        match self.position {
            1 => "Measuring power sensor position 1".to_string(),
            _ => "Measuring power sensor position 2".to_string(),
        }
    }

    /// Flush and close the CSV file.
    pub fn close(&mut self) -> AppResult<()> {
        self.writer.close()
    }
}
