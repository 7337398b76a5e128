//! HP 8114A high-power pulse generator behind a Prologix GPIB bridge.
//!
//! The Prologix adapter is driven in controller mode with read-after-write enabled,
//! so queries answer on the same line-oriented stream as plain commands. Amplitude
//! changes are fire-and-forget; the sweep's settle delay covers the output slew.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::instrument::capabilities::StimulusSource;
use crate::instrument::scpi::ScpiTransport;
use crate::integrator::Polarity;

/// Pulse shape and bridge addressing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulserSetup {
    pub gpib_address: u8,
    /// Expected substring of the `*IDN?` response. Not checked when absent.
    pub identity: Option<String>,
    pub output_polarity: Polarity,
    /// Pulse delay in SCPI notation, e.g. `5US`.
    pub pulse_delay: String,
    /// Pulse width in SCPI notation, e.g. `50.0NS`.
    pub pulse_width: String,
    /// Pause after each setup command.
    #[serde(with = "humantime_serde")]
    pub command_delay: Duration,
}

impl Default for PulserSetup {
    fn default() -> Self {
        Self {
            gpib_address: 14,
            identity: Some("8114".to_string()),
            output_polarity: Polarity::Negative,
            pulse_delay: "5US".to_string(),
            pulse_width: "50.0NS".to_string(),
            command_delay: Duration::from_millis(500),
        }
    }
}

fn polarity_keyword(polarity: Polarity) -> &'static str {
    match polarity {
        Polarity::Negative => "NEG",
        Polarity::Positive => "POS",
    }
}

/// Pulse generator reached through any [`ScpiTransport`].
pub struct Hp8114<T> {
    transport: T,
}

impl<T> Hp8114<T>
where
    T: ScpiTransport,
{
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Address the bridge, identify the generator and program the pulse shape.
    /// The output is left at 0 V.
    pub async fn connect(transport: T, setup: &PulserSetup) -> Result<Self> {
        let mut pulser = Self::new(transport);
        for command in [
            "++mode 1".to_string(),
            format!("++addr {}", setup.gpib_address),
            "++auto 1".to_string(),
        ] {
            pulser
                .transport
                .write(&command)
                .await
                .with_context(|| format!("Prologix bridge rejected '{command}'"))?;
        }

        let idn = pulser
            .transport
            .query("*IDN?")
            .await
            .context("Pulse generator did not answer *IDN?")?;
        if let Some(expected) = &setup.identity {
            if !idn.contains(expected.as_str()) {
                bail!("Expected pulse generator '{expected}', found '{idn}'");
            }
        }
        info!("Pulse generator found: {}", idn);

        let commands = [
            ":SOUR:VOLT 0.0".to_string(),
            format!(":OUTP:POL {}", polarity_keyword(setup.output_polarity)),
            format!(":SOUR:PULS:DEL {}", setup.pulse_delay),
            format!(":SOUR:PULS:WIDT {}", setup.pulse_width),
        ];
        for command in &commands {
            pulser.transport.write(command).await?;
            if !setup.command_delay.is_zero() {
                tokio::time::sleep(setup.command_delay).await;
            }
        }
        Ok(pulser)
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[async_trait]
impl<T> StimulusSource for Hp8114<T>
where
    T: ScpiTransport,
{
    async fn set_level(&mut self, value: f64) -> Result<()> {
        debug!("Pulser amplitude -> {} V", value);
        self.transport
            .write(&format!(":SOUR:VOLT {value}"))
            .await
            .with_context(|| format!("Failed to set pulser amplitude to {value} V"))
    }
}
