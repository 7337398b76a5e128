//! Instrument links used by a calibration bench.
//!
//! - [`capabilities`]: the traits the sweep controller drives.
//! - [`scpi`]: line-oriented SCPI transports over TCP, serial or VISA.
//! - [`tektronix`]: Tektronix oscilloscope driver.
//! - [`hp8114`]: HP 8114A pulse generator behind a Prologix GPIB bridge.
//! - [`mock`]: scripted doubles and a seeded simulated bench.

pub mod capabilities;
pub mod hp8114;
pub mod mock;
pub mod scpi;
pub mod tektronix;
