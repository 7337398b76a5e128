//! Capability traits for the instruments a calibration sweep talks to.
//!
//! The sweep controller owns one handle per capability for the lifetime of a run and
//! passes them down by `&mut`, so implementations never need internal locking for the
//! pipeline's sake. All methods may fail with a transport error; the acquisition retry
//! driver treats any `ScopeLink` failure as retryable.

use anyhow::Result;
use async_trait::async_trait;

use crate::waveform::{RawCapture, ScaleParameters};

/// Per-level vertical and trigger settings applied before a level is acquired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSetting {
    /// Vertical scale in volts per division.
    pub volts_per_div: f64,
    /// Trigger threshold in volts.
    pub trigger_level: f64,
}

/// Digitizing oscilloscope used for single-shot waveform captures.
#[async_trait]
pub trait ScopeLink: Send {
    /// Arm a single-sequence acquisition of up to `sample_count` samples.
    async fn arm(&mut self, sample_count: usize) -> Result<()>;

    /// Block until the instrument reports all pending operations complete.
    async fn wait_operation_complete(&mut self) -> Result<()>;

    /// Read the waveform preamble for the capture just taken.
    async fn read_scale_parameters(&mut self) -> Result<ScaleParameters>;

    /// Transfer the curve data for the capture just taken.
    async fn read_raw_block(&mut self) -> Result<RawCapture>;

    /// Apply per-level channel scale and trigger threshold.
    async fn configure_level(&mut self, _setting: &ChannelSetting) -> Result<()> {
        Ok(())
    }
}

/// Pulse source whose amplitude defines the stimulus level.
#[async_trait]
pub trait StimulusSource: Send {
    /// Command the output amplitude. No acknowledgement is awaited.
    async fn set_level(&mut self, value: f64) -> Result<()>;
}

/// Register interface of the device under test (e.g. a PLC tag server).
#[async_trait]
pub trait RegisterLink: Send {
    /// Read one named register as a number.
    async fn read_register(&mut self, name: &str) -> Result<f64>;
}

/// Which side of a calibration a phase measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseRole {
    /// Pulser wired straight into the scope.
    Reference,
    /// Pulser wired into the device under test.
    Device,
}

/// Human in the loop for cable changes between sweep phases.
#[async_trait]
pub trait Operator: Send {
    /// Show `message` and wait until the operator confirms.
    async fn confirm(&mut self, message: &str) -> Result<()>;

    /// Called once every prompt of a phase has been confirmed.
    async fn wiring_ready(&mut self, _role: PhaseRole) -> Result<()> {
        Ok(())
    }
}

/// Operator that confirms every prompt immediately, for unattended and simulated runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl Operator for AutoConfirm {
    async fn confirm(&mut self, message: &str) -> Result<()> {
        tracing::info!(prompt = message, "auto-confirming operator prompt");
        Ok(())
    }
}

/// Operator prompts on stdout, confirmation by pressing Enter on stdin.
#[derive(Debug, Default)]
pub struct StdinOperator;

#[async_trait]
impl Operator for StdinOperator {
    async fn confirm(&mut self, message: &str) -> Result<()> {
        use anyhow::Context;
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(format!("{message}  Hit <Enter> when done.\n").as_bytes())
            .await
            .context("Failed to write operator prompt")?;
        stdout.flush().await.context("Failed to flush stdout")?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .context("Failed to read operator confirmation")?;
        Ok(())
    }
}
