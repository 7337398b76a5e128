//! Device-under-test register channels.
//!
//! Charge monitors expose each measurement as a pair of ADC registers; the usable
//! reading is their difference. When the primary ADC sits at its full-scale code the
//! difference is meaningless, so the reading falls back to the raw primary value and
//! the poll is flagged as saturated. The full-scale code is a configured
//! [`SaturationRule`] rather than a constant because monitor firmware differs.

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::aggregator::RunningMean;
use crate::calibration::CalibrationPolynomial;
use crate::error::{CalError, CalResult};
use crate::instrument::capabilities::RegisterLink;

/// Full-scale code of the 12-bit signed ADCs on the beam monitor.
pub const DEFAULT_SATURATION_CODE: f64 = 2047.0;

/// Saturation-detection predicate applied to the primary register.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SaturationRule {
    /// Never flag saturation.
    Disabled,
    /// Saturated when the primary register equals `code`.
    Sentinel { code: f64 },
    /// Saturated when the primary register is at or above `code`.
    AtOrAbove { code: f64 },
}

impl Default for SaturationRule {
    fn default() -> Self {
        SaturationRule::Sentinel {
            code: DEFAULT_SATURATION_CODE,
        }
    }
}

impl SaturationRule {
    pub fn is_saturated(&self, primary: f64) -> bool {
        match *self {
            SaturationRule::Disabled => false,
            SaturationRule::Sentinel { code } => primary == code,
            SaturationRule::AtOrAbove { code } => primary >= code,
        }
    }
}

/// A device reading built from a primary and optional secondary register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterChannel {
    /// Display name, e.g. `beam` or `self_test_ab`.
    pub name: String,
    pub primary: String,
    /// Subtracted from the primary when present.
    #[serde(default)]
    pub secondary: Option<String>,
    #[serde(default)]
    pub saturation: SaturationRule,
}

/// One poll of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelReading {
    pub primary: f64,
    pub secondary: Option<f64>,
    /// Differential value, or the raw primary when saturated.
    pub value: f64,
    pub saturated: bool,
}

impl RegisterChannel {
    /// Derive the reading from raw register values.
    pub fn reading(&self, primary: f64, secondary: Option<f64>) -> ChannelReading {
        let saturated = self.saturation.is_saturated(primary);
        let value = match secondary {
            Some(b) if !saturated => primary - b,
            _ => primary,
        };
        ChannelReading {
            primary,
            secondary,
            value,
            saturated,
        }
    }

    /// Read both registers and derive the reading.
    pub async fn poll<R>(&self, link: &mut R) -> CalResult<ChannelReading>
    where
        R: RegisterLink + ?Sized,
    {
        let primary = read(link, &self.primary).await?;
        let secondary = match &self.secondary {
            Some(tag) => Some(read(link, tag).await?),
            None => None,
        };
        Ok(self.reading(primary, secondary))
    }
}

async fn read<R>(link: &mut R, tag: &str) -> CalResult<f64>
where
    R: RegisterLink + ?Sized,
{
    link.read_register(tag)
        .await
        .with_context(|| format!("Failed to read register '{tag}'"))
        .map_err(CalError::instrument)
}

/// Per-level statistics for one register channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelAccumulator {
    mean: RunningMean,
    saturated: usize,
}

impl ChannelAccumulator {
    pub fn push(&mut self, reading: &ChannelReading) -> f64 {
        if reading.saturated {
            self.saturated += 1;
        }
        self.mean.push(reading.value)
    }

    pub fn mean(&self) -> Option<f64> {
        self.mean.mean()
    }

    pub fn saturated(&self) -> usize {
        self.saturated
    }

    pub fn count(&self) -> usize {
        self.mean.count()
    }
}

/// Register tags holding the calibration currently loaded in the device.
///
/// Firmware stores the quadratic and linear terms as integer ratios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingCalibrationTags {
    pub quadratic_numerator: String,
    pub quadratic_denominator: String,
    pub linear_numerator: String,
    pub linear_denominator: String,
    pub offset: String,
}

impl ExistingCalibrationTags {
    /// Read the loaded polynomial from the device.
    pub async fn read<R>(&self, link: &mut R) -> CalResult<CalibrationPolynomial>
    where
        R: RegisterLink + ?Sized,
    {
        let qn = read(link, &self.quadratic_numerator).await?;
        let qd = read(link, &self.quadratic_denominator).await?;
        let ln = read(link, &self.linear_numerator).await?;
        let ld = read(link, &self.linear_denominator).await?;
        let offset = read(link, &self.offset).await?;
        if qd == 0.0 || ld == 0.0 {
            return Err(CalError::Instrument(
                "existing calibration has a zero denominator".into(),
            ));
        }
        Ok(CalibrationPolynomial::quadratic(qn / qd, ln / ld, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::MockRegisters;

    fn beam() -> RegisterChannel {
        RegisterChannel {
            name: "beam".into(),
            primary: "Beam_ADCA".into(),
            secondary: Some("Beam_ADCB".into()),
            saturation: SaturationRule::default(),
        }
    }

    #[test]
    fn test_differential_reading() {
        let r = beam().reading(812.0, Some(12.0));
        assert_eq!(r.value, 800.0);
        assert!(!r.saturated);
    }

    #[test]
    fn test_sentinel_reports_raw_primary() {
        let r = beam().reading(2047.0, Some(30.0));
        assert_eq!(r.value, 2047.0);
        assert!(r.saturated);
    }

    #[test]
    fn test_rules() {
        assert!(!SaturationRule::Disabled.is_saturated(2047.0));
        assert!(!SaturationRule::default().is_saturated(2048.0));
        assert!(SaturationRule::AtOrAbove { code: 2000.0 }.is_saturated(2048.0));
    }

    #[test]
    fn test_single_register_channel() {
        let channel = RegisterChannel {
            name: "beam_q".into(),
            primary: "ACMI_BEAM_Q".into(),
            secondary: None,
            saturation: SaturationRule::Disabled,
        };
        assert_eq!(channel.reading(41.5, None).value, 41.5);
    }

    #[tokio::test]
    async fn test_poll_reads_both_registers() {
        let mut link = MockRegisters::new()
            .with("Beam_ADCA", 500.0)
            .with("Beam_ADCB", 20.0);
        let r = beam().poll(&mut link).await.unwrap();
        assert_eq!(r.value, 480.0);
        assert_eq!(r.secondary, Some(20.0));
    }

    #[tokio::test]
    async fn test_missing_register_is_instrument_error() {
        let mut link = MockRegisters::new().with("Beam_ADCA", 500.0);
        let err = beam().poll(&mut link).await.unwrap_err();
        assert!(err.to_string().contains("Beam_ADCB"));
    }

    #[tokio::test]
    async fn test_existing_calibration_ratio() {
        let tags = ExistingCalibrationTags {
            quadratic_numerator: "Quad1".into(),
            quadratic_denominator: "Quad2".into(),
            linear_numerator: "Lin1".into(),
            linear_denominator: "Lin2".into(),
            offset: "Off".into(),
        };
        let mut link = MockRegisters::new()
            .with("Quad1", 1.0)
            .with("Quad2", 4000.0)
            .with("Lin1", 7.0)
            .with("Lin2", 2.0)
            .with("Off", -12.0);
        let poly = tags.read(&mut link).await.unwrap();
        assert_eq!(poly.coefficients, vec![0.00025, 3.5, -12.0]);
    }

    #[test]
    fn test_accumulator_counts_saturation() {
        let channel = beam();
        let mut acc = ChannelAccumulator::default();
        acc.push(&channel.reading(100.0, Some(0.0)));
        acc.push(&channel.reading(2047.0, Some(0.0)));
        assert_eq!(acc.count(), 2);
        assert_eq!(acc.saturated(), 1);
        assert_eq!(acc.mean(), Some(1073.5));
    }
}
