//! Beamsplitter calibration CSV with clean feature flag handling.
//!
//! One row per `(wavelength, position, power reading)`; the writer flushes after every
//! row so a crash never loses more than the reading in flight. The reader loads a
//! finished calibration for embedding into an ExcitationEmission dataset.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Column names in file order.
pub const CALIBRATION_HEADER: [&str; 4] = ["Wavelength [nm]", "Position", "Power [W]", "Time [s]"];

/// One CSV row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRow {
    #[serde(rename = "Wavelength [nm]")]
    pub wavelength: f64,
    #[serde(rename = "Position")]
    pub position: u8,
    #[serde(rename = "Power [W]")]
    pub power: f64,
    #[serde(rename = "Time [s]")]
    pub time: f64,
}

/// Column-oriented copy of a calibration file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationTable {
    pub wavelength: Vec<f64>,
    pub position: Vec<f64>,
    pub power: Vec<f64>,
    pub times: Vec<f64>,
}

impl CalibrationTable {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.wavelength.len()
    }

    /// True without rows.
    pub fn is_empty(&self) -> bool {
        self.wavelength.is_empty()
    }

    fn push(&mut self, row: CalibrationRow) {
        self.wavelength.push(row.wavelength);
        self.position.push(f64::from(row.position));
        self.power.push(row.power);
        self.times.push(row.time);
    }
}

/// `{beamsplitter}_{start}_{step}_{stop}_nm_{YYMMDDHHMM}.csv`
pub fn calibration_file_name(
    beamsplitter: &str,
    (start, step, stop): (f64, f64, f64),
    at: DateTime<Local>,
) -> String {
    let beamsplitter = if beamsplitter.trim().is_empty() {
        "beamsplitter"
    } else {
        beamsplitter.trim()
    };
    format!(
        "{}_{}_{}_{}_nm_{}.csv",
        beamsplitter,
        start,
        step,
        stop,
        at.format("%y%m%d%H%M")
    )
}

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::File;
    use std::path::PathBuf;
    use tracing::info;

    /// Row writer for a calibration run.
    pub struct CalibrationWriter {
        path: PathBuf,
        writer: Option<csv::Writer<File>>,
        rows: usize,
    }

    impl CalibrationWriter {
        /// Create the file and write the header.
        pub fn create(path: &Path) -> AppResult<Self> {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let file = File::create(path)?;
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            writer.write_record(CALIBRATION_HEADER)?;
            writer.flush()?;
            info!(path = %path.display(), "Calibration file created");
            Ok(Self {
                path: path.to_path_buf(),
                writer: Some(writer),
                rows: 0,
            })
        }

        /// File location.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Rows written so far.
        pub fn rows(&self) -> usize {
            self.rows
        }

        /// Append one row and flush it.
        pub fn append(&mut self, row: &CalibrationRow) -> AppResult<()> {
            let writer = self.writer.as_mut().ok_or_else(|| {
                DaqError::Dataset(format!("{} is already closed", self.path.display()))
            })?;
            writer.serialize(row)?;
            writer.flush()?;
            self.rows += 1;
            Ok(())
        }

        /// Flush and release the file. Later calls do nothing.
        pub fn close(&mut self) -> AppResult<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush()?;
                info!(path = %self.path.display(), rows = self.rows, "Calibration file closed");
            }
            Ok(())
        }
    }

    /// Load a calibration file written by [`CalibrationWriter`].
    pub fn read_calibration(path: &Path) -> AppResult<CalibrationTable> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.iter().ne(CALIBRATION_HEADER.iter().copied()) {
            return Err(DaqError::Configuration(format!(
                "{} is not a calibration file (header {:?})",
                path.display(),
                headers
            )));
        }
        let mut table = CalibrationTable::default();
        for row in reader.deserialize() {
            table.push(row?);
        }
        Ok(table)
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;

    /// Placeholder used when the `storage_csv` feature is off.
    pub struct CalibrationWriter;

    impl CalibrationWriter {
        pub fn create(_path: &Path) -> AppResult<Self> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn path(&self) -> &Path {
            Path::new("")
        }

        pub fn rows(&self) -> usize {
            0
        }

        pub fn append(&mut self, _row: &CalibrationRow) -> AppResult<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
        }

        pub fn close(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    pub fn read_calibration(_path: &Path) -> AppResult<CalibrationTable> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::{read_calibration, CalibrationWriter};

#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::{read_calibration, CalibrationWriter};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_file_name_pattern() {
        let at = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap();
        assert_eq!(
            calibration_file_name("BS50", (250.0, 10.0, 270.0), at),
            "BS50_250_10_270_nm_2403051407.csv"
        );
        assert!(calibration_file_name(" ", (250.5, 0.5, 260.0), at).starts_with("beamsplitter_250.5_0.5_260_nm_"));
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_rows_are_flushed_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.csv");
        let mut writer = CalibrationWriter::create(&path).unwrap();
        writer
            .append(&CalibrationRow {
                wavelength: 250.0,
                position: 1,
                power: 1.5e-3,
                time: 1.0,
            })
            .unwrap();

        // Visible on disk before close.
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Wavelength [nm],Position,Power [W],Time [s]"));
        assert_eq!(text.lines().count(), 2);

        writer
            .append(&CalibrationRow {
                wavelength: 260.0,
                position: 2,
                power: 1.4e-3,
                time: 2.0,
            })
            .unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.append(&CalibrationRow {
            wavelength: 0.0,
            position: 1,
            power: 0.0,
            time: 0.0
        })
        .is_err());

        let table = read_calibration(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.wavelength, vec![250.0, 260.0]);
        assert_eq!(table.position, vec![1.0, 2.0]);
    }

    #[cfg(feature = "storage_csv")]
    #[test]
    fn test_rejects_foreign_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.csv");
        std::fs::write(&path, "a,b\n1,2\n").unwrap();
        assert!(matches!(
            read_calibration(&path),
            Err(DaqError::Configuration(_))
        ));
    }
}
