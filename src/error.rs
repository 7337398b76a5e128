//! Custom error types for the calibration pipeline.
//!
//! This module defines the primary error type, `CalError`, shared by every stage of
//! the acquisition-and-calibration pipeline. Using the `thiserror` crate, it gives a
//! single, consistent taxonomy from block decoding up to sweep orchestration.
//!
//! ## Error Hierarchy
//!
//! - **`MalformedBlock`**: A raw capture violated the binary block structure. The
//!   acquisition retry driver treats this as transient and re-acquires; it never
//!   reaches the sweep controller.
//! - **`InsufficientSamples`**: A trace is too short to estimate a baseline. This is a
//!   configuration problem (record length too small), so it is fatal to the repeat and
//!   propagates upward.
//! - **`AcquisitionExhausted`**: Only produced when a bounded [`RetryPolicy`] is in use
//!   and every attempt failed.
//! - **`SweepAborted`**: Wraps any fatal condition inside a sweep together with the
//!   phase name and the last fully completed level so an operator can resume manually.
//! - **`Instrument`**: Transport or protocol failures reported by an instrument link.
//! - **`Config`** / **`Configuration`**: Figment extraction failures and semantic
//!   validation failures respectively.
//!
//! Note that "not enough levels for a fit yet" is deliberately *not* an error; see
//! [`FitOutcome::InsufficientData`](crate::calibration::FitOutcome::InsufficientData).
//!
//! [`RetryPolicy`]: crate::acquisition::RetryPolicy

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type CalResult<T> = std::result::Result<T, CalError>;

#[derive(Error, Debug)]
pub enum CalError {
    #[error("Malformed binary block: {0}")]
    MalformedBlock(String),

    #[error("Insufficient samples for baseline: found {found}, need at least {required}")]
    InsufficientSamples { found: usize, required: usize },

    #[error("Acquisition exhausted after {attempts} attempts; last error: {last_error}")]
    AcquisitionExhausted { attempts: u32, last_error: String },

    #[error("Sweep aborted during phase '{phase}' (last completed level: {})", display_level(.last_completed_level))]
    SweepAborted {
        phase: String,
        last_completed_level: Option<usize>,
        #[source]
        source: Box<CalError>,
    },

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Least-squares system is singular: {0}")]
    SingularFit(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

fn display_level(level: &Option<usize>) -> String {
    level.map_or_else(|| "none".to_string(), |l| l.to_string())
}

impl CalError {
    /// Wrap an instrument-link failure, keeping the full `anyhow` context chain.
    pub fn instrument(err: anyhow::Error) -> Self {
        CalError::Instrument(format!("{err:#}"))
    }

    /// Last completed level carried by a `SweepAborted` error, if any.
    pub fn resume_level(&self) -> Option<usize> {
        match self {
            CalError::SweepAborted {
                last_completed_level,
                ..
            } => *last_completed_level,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CalError::MalformedBlock("missing '#' marker".to_string());
        assert_eq!(err.to_string(), "Malformed binary block: missing '#' marker");
    }

    #[test]
    fn test_sweep_aborted_display() {
        let err = CalError::SweepAborted {
            phase: "reference".into(),
            last_completed_level: Some(4),
            source: Box::new(CalError::InsufficientSamples {
                found: 12,
                required: 50,
            }),
        };
        let text = err.to_string();
        assert!(text.contains("reference"));
        assert!(text.contains("last completed level: 4"));
        assert_eq!(err.resume_level(), Some(4));
    }

    #[test]
    fn test_sweep_aborted_before_first_level() {
        let err = CalError::SweepAborted {
            phase: "device".into(),
            last_completed_level: None,
            source: Box::new(CalError::Instrument("link down".into())),
        };
        assert!(err.to_string().contains("last completed level: none"));
        assert_eq!(err.resume_level(), None);
    }

    #[test]
    fn test_instrument_keeps_context_chain() {
        let err = anyhow::anyhow!("timeout").context("CURVE? failed");
        let err = CalError::instrument(err);
        assert_eq!(err.to_string(), "Instrument error: CURVE? failed: timeout");
    }
}
