//! Tektronix MSO-series oscilloscope driver.
//!
//! Captures are single-sequence acquisitions transferred as 16-bit signed big-endian
//! curve data (`DATA:ENC RIB`, `DATA:WIDTH 2`). The preamble is queried after every
//! `*OPC?` so the scale parameters always belong to the capture being read.
//!
//! ## Configuration
//!
//! ```toml
//! [scope]
//! endpoint = { kind = "tcp", address = "10.0.128.110:4000" }
//! identity = "MSO64B"
//! record_length = 2000
//! sample_rate = 3.125e9
//! horizontal_scale = 3.2e-8
//! trigger_slope = "fall"
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::instrument::capabilities::{ChannelSetting, ScopeLink};
use crate::instrument::scpi::{parse_number, ScpiTransport};
use crate::waveform::{RawCapture, ScaleParameters};

/// Edge the trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSlope {
    Rise,
    Fall,
}

impl TriggerSlope {
    fn as_scpi(self) -> &'static str {
        match self {
            TriggerSlope::Rise => "RISE",
            TriggerSlope::Fall => "FALL",
        }
    }
}

/// One-time horizontal, trigger and channel setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSetup {
    /// Source channel, e.g. `CH1`.
    pub channel: String,
    /// Expected substring of the `*IDN?` response. Not checked when absent.
    pub identity: Option<String>,
    pub record_length: usize,
    /// Samples per second.
    pub sample_rate: f64,
    /// Seconds per division.
    pub horizontal_scale: f64,
    /// Trigger position in percent of the record.
    pub horizontal_position: f64,
    /// Channel offset in divisions.
    pub channel_position: f64,
    /// Volts per division until the first level is configured.
    pub initial_scale: f64,
    pub trigger_slope: TriggerSlope,
}

impl Default for ScopeSetup {
    fn default() -> Self {
        Self {
            channel: "CH1".to_string(),
            identity: None,
            record_length: 2000,
            sample_rate: 3.125e9,
            horizontal_scale: 3.2e-8,
            horizontal_position: 10.0,
            channel_position: 4.5,
            initial_scale: 0.2,
            trigger_slope: TriggerSlope::Fall,
        }
    }
}

/// Bytes per curve point with `DATA:WIDTH 2`.
const BYTES_PER_POINT: usize = 2;

/// Largest curve payload for `points` requested samples. `DATA:START 0` and
/// `DATA:STOP n` are both inclusive.
fn curve_byte_limit(points: usize) -> usize {
    points.saturating_add(1).saturating_mul(BYTES_PER_POINT)
}

/// A Tektronix scope reached through any [`ScpiTransport`].
pub struct TektronixScope<T> {
    transport: T,
    channel: String,
    max_curve_bytes: usize,
}

impl<T> TektronixScope<T>
where
    T: ScpiTransport,
{
    /// Wrap a transport without touching the instrument.
    pub fn new(transport: T, channel: &str) -> Self {
        Self {
            transport,
            channel: channel.to_string(),
            max_curve_bytes: curve_byte_limit(ScopeSetup::default().record_length),
        }
    }

    /// Identify the instrument and apply `setup`.
    pub async fn connect(transport: T, setup: &ScopeSetup) -> Result<Self> {
        let mut scope = Self::new(transport, &setup.channel);
        scope.max_curve_bytes = curve_byte_limit(setup.record_length);
        let idn = scope.identify().await?;
        if let Some(expected) = &setup.identity {
            if !idn.contains(expected.as_str()) {
                bail!("Expected scope '{expected}', found '{idn}'");
            }
        }
        info!("Scope found: {}", idn);
        scope.configure(setup).await?;
        Ok(scope)
    }

    pub async fn identify(&mut self) -> Result<String> {
        self.transport
            .query("*IDN?")
            .await
            .context("Scope did not answer *IDN?")
    }

    /// Apply the one-time acquisition setup.
    pub async fn configure(&mut self, setup: &ScopeSetup) -> Result<()> {
        let ch = &setup.channel;
        let commands = [
            format!("HOR:RECO {}", setup.record_length),
            "TRIGGER:A:MODE NORM".to_string(),
            "TRIGGER:A:TYPE EDGE".to_string(),
            format!("TRIGGER:A:EDGE:SOURCE {ch}"),
            format!("TRIGGER:A:EDGE:SLOPE {}", setup.trigger_slope.as_scpi()),
            "TRIGGER:A:EDGE:COUPLING DC".to_string(),
            "HORIZONTAL:MODE MANUAL".to_string(),
            format!("HORIZONTAL:MODE:SAMPLERATE {:E}", setup.sample_rate),
            format!("HORIZONTAL:SCALE {:E}", setup.horizontal_scale),
            format!("HORIZONTAL:POS {}", setup.horizontal_position),
            "*WAI".to_string(),
            format!("{ch}:SCALE {}", setup.initial_scale),
            format!("{ch}:POS {}", setup.channel_position),
        ];
        for command in &commands {
            self.transport
                .write(command)
                .await
                .with_context(|| format!("Scope setup failed at '{command}'"))?;
        }
        debug!("Scope configured with {} commands", commands.len());
        Ok(())
    }

    async fn query_number(&mut self, query: &str) -> Result<f64> {
        let response = self.transport.query(query).await?;
        parse_number(&response)
    }

    /// Give back the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[async_trait]
impl<T> ScopeLink for TektronixScope<T>
where
    T: ScpiTransport,
{
    async fn arm(&mut self, sample_count: usize) -> Result<()> {
        let commands = [
            "ACQUIRE:STOPAFTER SEQUENCE".to_string(),
            "ACQUIRE:STATE 1".to_string(),
            "*WAI".to_string(),
            format!("DATA:SOU {}", self.channel),
            "DATA:START 0".to_string(),
            format!("DATA:STOP {sample_count}"),
            "DATA:WIDTH 2".to_string(),
            "DATA:ENC RIB".to_string(),
            "WFMOUTPRE:BYT_NR 2".to_string(),
        ];
        for command in &commands {
            self.transport.write(command).await?;
        }
        self.max_curve_bytes = curve_byte_limit(sample_count);
        Ok(())
    }

    async fn wait_operation_complete(&mut self) -> Result<()> {
        let response = self.transport.query("*OPC?").await?;
        if response.trim() != "1" {
            bail!("Unexpected *OPC? response '{response}'");
        }
        Ok(())
    }

    async fn read_scale_parameters(&mut self) -> Result<ScaleParameters> {
        Ok(ScaleParameters {
            ymult: self.query_number("WFMPRE:YMULT?").await?,
            yzero: self.query_number("WFMPRE:YZERO?").await?,
            yoff: self.query_number("WFMPRE:YOFF?").await?,
            xincr: self.query_number("WFMPRE:XINCR?").await?,
        })
    }

    async fn read_raw_block(&mut self) -> Result<RawCapture> {
        self.transport.write("CURVE?").await?;
        let block = self.transport.read_block(self.max_curve_bytes).await?;
        debug!("Curve block of {} bytes", block.len());
        Ok(block)
    }

    async fn configure_level(&mut self, setting: &ChannelSetting) -> Result<()> {
        let ch = &self.channel;
        let scale = format!("{ch}:SCALE {}", setting.volts_per_div);
        let trigger = format!("TRIGGER:A:LEVEL:{ch} {}", setting.trigger_level);
        self.transport.write(&scale).await?;
        self.transport.write(&trigger).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockTransport;
    use crate::waveform::encode_block;

    fn idn() -> MockTransport {
        MockTransport::new().respond("*IDN?", "TEKTRONIX,MSO64B,C013046,CF:91.1CT FV:1.44")
    }

    #[tokio::test]
    async fn test_connect_checks_identity() {
        let setup = ScopeSetup {
            identity: Some("MSO64B".into()),
            ..ScopeSetup::default()
        };
        let scope = TektronixScope::connect(idn(), &setup).await.unwrap();
        let sent = scope.into_inner().sent().to_vec();
        assert_eq!(sent[0], "*IDN?");
        assert!(sent.contains(&"HOR:RECO 2000".to_string()));
        assert!(sent.contains(&"TRIGGER:A:EDGE:SLOPE FALL".to_string()));
        assert!(sent.contains(&"HORIZONTAL:MODE:SAMPLERATE 3.125E9".to_string()));
        assert!(sent.contains(&"CH1:POS 4.5".to_string()));
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_instrument() {
        let setup = ScopeSetup {
            identity: Some("DPO7254".into()),
            ..ScopeSetup::default()
        };
        assert!(TektronixScope::connect(idn(), &setup).await.is_err());
    }

    #[tokio::test]
    async fn test_capture_sequence() {
        let block = encode_block(&[100, -100]);
        let transport = MockTransport::new()
            .respond("*OPC?", "1")
            .respond("WFMPRE:YMULT?", "2.0E-3")
            .respond("WFMPRE:YZERO?", "0.0E0")
            .respond("WFMPRE:YOFF?", "5.0")
            .respond("WFMPRE:XINCR?", "3.2E-10")
            .with_block(block.clone());
        let mut scope = TektronixScope::new(transport, "CH1");

        scope.arm(2000).await.unwrap();
        scope.wait_operation_complete().await.unwrap();
        let scale = scope.read_scale_parameters().await.unwrap();
        let raw = scope.read_raw_block().await.unwrap();

        assert_eq!(scale.ymult, 2.0e-3);
        assert_eq!(scale.yoff, 5.0);
        assert_eq!(scale.xincr, 3.2e-10);
        assert_eq!(raw, block);
        let sent = scope.into_inner().sent().to_vec();
        assert_eq!(sent[0], "ACQUIRE:STOPAFTER SEQUENCE");
        assert!(sent.contains(&"DATA:STOP 2000".to_string()));
        assert_eq!(sent.last().map(String::as_str), Some("CURVE?"));
    }

    #[test]
    fn test_curve_byte_limit_follows_request() {
        assert_eq!(curve_byte_limit(5000), 10_002);
        assert_eq!(curve_byte_limit(usize::MAX), usize::MAX);
    }

    #[tokio::test]
    async fn test_opc_must_report_complete() {
        let mut scope = TektronixScope::new(MockTransport::new().respond("*OPC?", "0"), "CH1");
        assert!(scope.wait_operation_complete().await.is_err());
    }

    #[tokio::test]
    async fn test_configure_level() {
        let mut scope = TektronixScope::new(MockTransport::new(), "CH1");
        scope
            .configure_level(&ChannelSetting {
                volts_per_div: 0.5,
                trigger_level: -0.5,
            })
            .await
            .unwrap();
        assert_eq!(
            scope.into_inner().sent(),
            &["CH1:SCALE 0.5".to_string(), "TRIGGER:A:LEVEL:CH1 -0.5".to_string()]
        );
    }
}
