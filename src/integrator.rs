//! Charge integration of a decoded pulse trace.
//!
//! The flat pre-trigger region provides the baseline: the mean of the first
//! [`BASELINE_WINDOW`] samples is subtracted from every sample. Samples of the
//! wrong sign for the pulse polarity are then zeroed so baseline noise does not
//! integrate into the result, and the remainder is summed and multiplied by the
//! sample interval.

use serde::{Deserialize, Serialize};

use crate::error::{CalError, CalResult};
use crate::waveform::Trace;

/// Leading samples averaged for the baseline.
pub const BASELINE_WINDOW: usize = 50;

/// Expected sign of the pulse. Samples of the opposite sign are clamped to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    /// Keep samples `<= 0` (negative-going pulse).
    Negative,
    /// Keep samples `>= 0` (positive-going pulse).
    Positive,
}

impl Polarity {
    fn clamp(self, v: f64) -> f64 {
        match self {
            Polarity::Negative => v.min(0.0),
            Polarity::Positive => v.max(0.0),
        }
    }

    /// `+1.0` or `-1.0`.
    pub fn sign(self) -> f64 {
        match self {
            Polarity::Negative => -1.0,
            Polarity::Positive => 1.0,
        }
    }
}

impl std::fmt::Display for Polarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarity::Negative => write!(f, "negative"),
            Polarity::Positive => write!(f, "positive"),
        }
    }
}

/// Integrated result of one trace. Both values are non-negative magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeSample {
    /// Charge in configured units (nC with the default constant).
    pub charge: f64,
    /// Time-integrated voltage in configured units (nV·s with the default scale).
    pub intensity: f64,
}

/// Reduces traces to [`ChargeSample`]s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeIntegrator {
    pub polarity: Polarity,
    /// Charge per volt-second of integrated signal (circuit transfer constant).
    pub charge_per_volt_second: f64,
    /// Display scale for the raw integral (1e9 reports nV·s).
    pub intensity_per_volt_second: f64,
}

impl ChargeIntegrator {
    /// Integrator with the bench defaults: 2e7 nC per V·s, intensity in nV·s.
    pub fn new(polarity: Polarity) -> Self {
        Self {
            polarity,
            charge_per_volt_second: 2e7,
            intensity_per_volt_second: 1e9,
        }
    }

    /// Mean of the first [`BASELINE_WINDOW`] samples.
    pub fn baseline(trace: &Trace) -> CalResult<f64> {
        let window = trace
            .volts()
            .get(..BASELINE_WINDOW)
            .ok_or(CalError::InsufficientSamples {
                found: trace.len(),
                required: BASELINE_WINDOW,
            })?;
        Ok(window.iter().sum::<f64>() / BASELINE_WINDOW as f64)
    }

    /// Baseline-corrected, polarity-clamped samples.
    pub fn corrected(&self, trace: &Trace) -> CalResult<Vec<f64>> {
        let baseline = Self::baseline(trace)?;
        Ok(trace
            .volts()
            .iter()
            .map(|v| self.polarity.clamp(v - baseline))
            .collect())
    }

    /// Integrate one trace.
    pub fn integrate(&self, trace: &Trace) -> CalResult<ChargeSample> {
        let area: f64 = self.corrected(trace)?.iter().sum::<f64>() * trace.sample_interval();
        let area = area.abs();
        Ok(ChargeSample {
            charge: area * self.charge_per_volt_second,
            intensity: area * self.intensity_per_volt_second,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat baseline at `offset` with a bipolar pulse after the baseline window.
    fn pulse_trace(offset: f64) -> Trace {
        let mut volts = vec![offset; 200];
        for v in &mut volts[100..110] {
            *v = offset - 0.5;
        }
        for v in &mut volts[110..114] {
            *v = offset + 0.25;
        }
        Trace::new(1e-9, volts)
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() <= 1e-9 * b.abs().max(1.0), "{a} != {b}");
    }

    #[test]
    fn test_negative_pulse_charge() {
        let sample = ChargeIntegrator::new(Polarity::Negative)
            .integrate(&pulse_trace(0.0))
            .unwrap();
        // 10 samples * 0.5 V * 1 ns = 5e-9 V·s
        assert_close(sample.intensity, 5.0);
        assert_close(sample.charge, 5e-9 * 2e7);
    }

    #[test]
    fn test_baseline_invariance() {
        let integrator = ChargeIntegrator::new(Polarity::Negative);
        let reference = integrator.integrate(&pulse_trace(0.0)).unwrap();
        for c in [-3.0, 0.125, 12.5] {
            let shifted = integrator.integrate(&pulse_trace(c)).unwrap();
            assert_close(shifted.charge, reference.charge);
            assert_close(shifted.intensity, reference.intensity);
        }
    }

    #[test]
    fn test_polarity_selects_lobe() {
        let trace = pulse_trace(1.0);
        let neg = ChargeIntegrator::new(Polarity::Negative)
            .integrate(&trace)
            .unwrap();
        let pos = ChargeIntegrator::new(Polarity::Positive)
            .integrate(&trace)
            .unwrap();
        assert!(neg.charge >= 0.0 && pos.charge >= 0.0);
        assert_close(pos.intensity, 1.0);
        assert!(neg.charge > pos.charge);
    }

    #[test]
    fn test_insufficient_samples() {
        let trace = Trace::new(1e-9, vec![0.0; BASELINE_WINDOW - 1]);
        let err = ChargeIntegrator::new(Polarity::Positive)
            .integrate(&trace)
            .unwrap_err();
        assert!(matches!(
            err,
            CalError::InsufficientSamples {
                found: 49,
                required: 50
            }
        ));
    }

    #[test]
    fn test_exact_window_is_enough() {
        let trace = Trace::new(1e-9, vec![0.25; BASELINE_WINDOW]);
        let sample = ChargeIntegrator::new(Polarity::Positive)
            .integrate(&trace)
            .unwrap();
        assert_eq!(sample.charge, 0.0);
    }

    #[test]
    fn test_polarity_serde_names() {
        let json = serde_json::to_string(&Polarity::Negative).unwrap();
        assert_eq!(json, "\"negative\"");
        assert_eq!(Polarity::Positive.to_string(), "positive");
    }
}
