//! Append-only record sinks for sweep data.
//!
//! Every repeat, every completed level and every calibration fit is appended as one
//! delimited line as soon as it exists, so an aborted sweep still leaves a complete
//! record of everything measured up to the failure. Nothing is ever rewritten.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::aggregator::LevelResult;
use crate::calibration::CalibrationFit;
use crate::error::CalResult;
use crate::registers::ChannelReading;

/// One row destined for the record sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    /// Free-text heading that opens a phase.
    Section { title: String },
    /// One scope acquisition.
    Repeat {
        level_index: usize,
        repeat_index: usize,
        stimulus: f64,
        intensity: f64,
        charge: f64,
    },
    /// A completed scope level.
    Level(LevelResult),
    /// One poll of the device registers.
    RegisterPoll {
        level_index: usize,
        poll_index: usize,
        reference_charge: f64,
        readings: Vec<ChannelReading>,
    },
    /// Per-level mean of one register channel.
    ChannelLevel {
        level_index: usize,
        stimulus: f64,
        channel: String,
        mean: f64,
        saturated: usize,
    },
    /// A calibration fit over the trusted prefix.
    Fit {
        channel: String,
        fit: CalibrationFit,
        existing_rms: Option<f64>,
    },
    /// One paired reference/device row of the final summary.
    Summary {
        level_index: usize,
        stimulus: f64,
        reference_intensity: f64,
        reference_charge: f64,
        device_response: f64,
        ratio: Option<f64>,
    },
}

/// Destination for sweep records.
pub trait RecordSink: Send {
    fn append(&mut self, record: &Record) -> CalResult<()>;

    fn flush(&mut self) -> CalResult<()> {
        Ok(())
    }
}

/// Keeps records in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    pub records: Vec<Record>,
}

impl RecordSink for MemoryRecordSink {
    fn append(&mut self, record: &Record) -> CalResult<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Writes raw rows to `<stem>.raw.csv` and summary rows to `<stem>_summary.csv`.
pub struct CsvRecordSink {
    raw_path: PathBuf,
    summary_path: PathBuf,
    raw: csv::Writer<File>,
    summary: Option<csv::Writer<File>>,
}

impl CsvRecordSink {
    /// Open (append mode) the record files for `stem` inside `directory`.
    pub fn create(directory: &Path, stem: &str) -> CalResult<Self> {
        std::fs::create_dir_all(directory)?;
        let raw_path = directory.join(format!("{stem}.raw.csv"));
        let summary_path = directory.join(format!("{stem}_summary.csv"));
        let raw = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(open_append(&raw_path)?);
        info!(path = %raw_path.display(), "record sink opened");
        Ok(Self {
            raw_path,
            summary_path,
            raw,
            summary: None,
        })
    }

    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    fn summary_writer(&mut self) -> CalResult<&mut csv::Writer<File>> {
        let writer = match self.summary.take() {
            Some(writer) => writer,
            None => csv::WriterBuilder::new()
                .flexible(true)
                .from_writer(open_append(&self.summary_path)?),
        };
        Ok(self.summary.insert(writer))
    }
}

fn open_append(path: &Path) -> CalResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(String::new, |v| format!("{v:.precision$}"))
}

impl RecordSink for CsvRecordSink {
    fn append(&mut self, record: &Record) -> CalResult<()> {
        match record {
            Record::Section { title } => {
                let stamp = chrono::Utc::now().to_rfc3339();
                self.raw.write_record([format!("# {title} ({stamp})")])?;
            }
            Record::Repeat {
                level_index,
                repeat_index,
                stimulus,
                intensity,
                charge,
            } => {
                self.raw.write_record([
                    level_index.to_string(),
                    repeat_index.to_string(),
                    stimulus.to_string(),
                    format!("{intensity:.3}"),
                    format!("{charge:.4}"),
                ])?;
            }
            Record::Level(level) => {
                self.raw.write_record([
                    "level".to_string(),
                    level.level_index.to_string(),
                    level.stimulus.to_string(),
                    format!("{:.3}", level.mean_intensity),
                    format!("{:.4}", level.mean_charge),
                    level.samples.to_string(),
                ])?;
            }
            Record::RegisterPoll {
                level_index,
                poll_index,
                reference_charge,
                readings,
            } => {
                let mut row = vec![
                    level_index.to_string(),
                    poll_index.to_string(),
                    format!("{reference_charge:.3}"),
                ];
                for r in readings {
                    row.push(r.primary.to_string());
                    row.push(r.secondary.map_or_else(String::new, |b| b.to_string()));
                }
                self.raw.write_record(&row)?;
            }
            Record::ChannelLevel {
                level_index,
                stimulus,
                channel,
                mean,
                saturated,
            } => {
                self.raw.write_record([
                    "channel_level".to_string(),
                    level_index.to_string(),
                    stimulus.to_string(),
                    channel.clone(),
                    format!("{mean:.3}"),
                    saturated.to_string(),
                ])?;
            }
            Record::Fit {
                channel,
                fit,
                existing_rms,
            } => {
                let coefficients = fit
                    .polynomial
                    .coefficients
                    .iter()
                    .map(|c| format!("{c:.6e}"))
                    .collect::<Vec<_>>()
                    .join(";");
                self.raw.write_record([
                    "fit".to_string(),
                    channel.clone(),
                    fit.degree.to_string(),
                    coefficients,
                    fmt_opt(fit.correlation, 4),
                    format!("{:.2}", fit.rms_residual),
                    fit.verdict.to_string(),
                    fit.points_used.to_string(),
                    fmt_opt(*existing_rms, 2),
                ])?;
            }
            Record::Summary {
                level_index,
                stimulus,
                reference_intensity,
                reference_charge,
                device_response,
                ratio,
            } => {
                let row = [
                    level_index.to_string(),
                    format!("{stimulus:.2}"),
                    format!("{reference_intensity:.4}"),
                    format!("{reference_charge:.4}"),
                    format!("{device_response:.4}"),
                    fmt_opt(*ratio, 2),
                ];
                self.summary_writer()?.write_record(row)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> CalResult<()> {
        self.raw.flush()?;
        if let Some(summary) = self.summary.as_mut() {
            summary.flush()?;
        }
        Ok(())
    }
}

impl Drop for CsvRecordSink {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(error = %err, "failed to flush record sink on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationPolynomial, Verdict};

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_repeat_and_level_rows() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = CsvRecordSink::create(dir.path(), "run1").unwrap();
            sink.append(&Record::Repeat {
                level_index: 0,
                repeat_index: 3,
                stimulus: 1.0,
                intensity: 5.12345,
                charge: 0.102468,
            })
            .unwrap();
            sink.append(&Record::Level(LevelResult {
                level_index: 0,
                stimulus: 1.0,
                mean_charge: 0.1,
                mean_intensity: 5.0,
                samples: 25,
            }))
            .unwrap();
        }
        let text = read(&dir.path().join("run1.raw.csv"));
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "0,3,1,5.123,0.1025");
        assert_eq!(lines[1], "level,0,1,5.000,0.1000,25");
    }

    #[test]
    fn test_append_only_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        for title in ["first", "second"] {
            let mut sink = CsvRecordSink::create(dir.path(), "run").unwrap();
            sink.append(&Record::Section {
                title: title.to_string(),
            })
            .unwrap();
        }
        let text = read(&dir.path().join("run.raw.csv"));
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().next().unwrap().starts_with("# first"));
    }

    #[test]
    fn test_summary_goes_to_separate_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvRecordSink::create(dir.path(), "run").unwrap();
        sink.append(&Record::Summary {
            level_index: 1,
            stimulus: 2.0,
            reference_intensity: 10.0,
            reference_charge: 0.2,
            device_response: 0.02,
            ratio: Some(10.0),
        })
        .unwrap();
        sink.flush().unwrap();
        assert_eq!(
            read(sink.summary_path()).trim(),
            "1,2.00,10.0000,0.2000,0.0200,10.00"
        );
        assert_eq!(read(sink.raw_path()), "");
    }

    #[test]
    fn test_fit_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvRecordSink::create(dir.path(), "run").unwrap();
        sink.append(&Record::Fit {
            channel: "beam".into(),
            fit: CalibrationFit {
                degree: 1,
                polynomial: CalibrationPolynomial::new(vec![2.0, 1.0]),
                correlation: Some(1.0),
                residuals: vec![0.0; 4],
                rms_residual: 0.0,
                verdict: Verdict::Pass,
                points_used: 4,
            },
            existing_rms: None,
        })
        .unwrap();
        sink.flush().unwrap();
        assert_eq!(
            read(sink.raw_path()).trim(),
            "fit,beam,1,2.000000e0;1.000000e0,1.0000,0.00,PASS,4,"
        );
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemoryRecordSink::default();
        sink.append(&Record::Section {
            title: "x".into(),
        })
        .unwrap();
        assert_eq!(sink.records.len(), 1);
    }
}
