//! Core library for the `charge_cal` bench application.
//!
//! The crate drives a pulse generator, a digitizing oscilloscope and optionally the
//! register interface of a charge monitor through a stimulus sweep. Each level's
//! captures are decoded ([`waveform`]), integrated into charge ([`integrator`]) and
//! averaged ([`aggregator`]). Device responses are then fitted against the reference
//! charge ([`calibration`]). Every intermediate result is appended to a record sink
//! ([`records`]) while the sweep runs.
//!
//! The [`sweep::SweepController`] owns the state machine. Instruments are reached
//! through the capability traits in [`instrument::capabilities`]; transient capture
//! failures are retried by [`acquisition::AcquisitionDriver`].

pub mod acquisition;
pub mod aggregator;
pub mod calibration;
pub mod config;
pub mod error;
pub mod instrument;
pub mod integrator;
pub mod logging;
pub mod records;
pub mod registers;
pub mod report;
pub mod sweep;
pub mod waveform;

pub use error::{CalError, CalResult};
