//! Running per-level statistics.
//!
//! Repeats arrive one at a time and progress reporting needs the mean after every
//! repeat, so accumulation is streaming: push a sample, read the running mean.

use serde::{Deserialize, Serialize};

use crate::integrator::ChargeSample;

/// Streaming arithmetic mean of a scalar.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one value in and return the updated mean.
    pub fn push(&mut self, value: f64) -> f64 {
        self.sum += value;
        self.count += 1;
        self.sum / self.count as f64
    }

    /// Current mean, `None` before the first value.
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Running means after the latest repeat of a level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelProgress {
    pub samples: usize,
    pub mean_charge: f64,
    pub mean_intensity: f64,
    pub last: ChargeSample,
}

/// Durable result of one stimulus level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelResult {
    pub level_index: usize,
    pub stimulus: f64,
    pub mean_charge: f64,
    pub mean_intensity: f64,
    pub samples: usize,
}

/// Folds [`ChargeSample`]s for a single level into a [`LevelResult`].
#[derive(Debug, Clone)]
pub struct LevelAccumulator {
    level_index: usize,
    stimulus: f64,
    charge: RunningMean,
    intensity: RunningMean,
}

impl LevelAccumulator {
    pub fn new(level_index: usize, stimulus: f64) -> Self {
        Self {
            level_index,
            stimulus,
            charge: RunningMean::new(),
            intensity: RunningMean::new(),
        }
    }

    /// Add one repeat and return the running means.
    pub fn push(&mut self, sample: ChargeSample) -> LevelProgress {
        let mean_charge = self.charge.push(sample.charge);
        let mean_intensity = self.intensity.push(sample.intensity);
        LevelProgress {
            samples: self.charge.count(),
            mean_charge,
            mean_intensity,
            last: sample,
        }
    }

    pub fn samples(&self) -> usize {
        self.charge.count()
    }

    /// Close the level. `None` when no repeat was pushed.
    pub fn finish(self) -> Option<LevelResult> {
        Some(LevelResult {
            level_index: self.level_index,
            stimulus: self.stimulus,
            mean_charge: self.charge.mean()?,
            mean_intensity: self.intensity.mean()?,
            samples: self.charge.count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(charge: f64, intensity: f64) -> ChargeSample {
        ChargeSample { charge, intensity }
    }

    #[test]
    fn test_identical_samples_mean() {
        let mut acc = LevelAccumulator::new(2, 3.0);
        let s = sample(0.1234, 6.17);
        for _ in 0..25 {
            acc.push(s);
        }
        let result = acc.finish().unwrap();
        assert_eq!(result.samples, 25);
        assert_eq!(result.level_index, 2);
        assert_eq!(result.stimulus, 3.0);
        assert!((result.mean_charge - s.charge).abs() < 1e-15);
        assert!((result.mean_intensity - s.intensity).abs() < 1e-12);
    }

    #[test]
    fn test_order_invariance() {
        let values = [0.5, 1.25, 3.0, 0.125, 2.0];
        let mut forward = LevelAccumulator::new(0, 1.0);
        let mut backward = LevelAccumulator::new(0, 1.0);
        for v in values {
            forward.push(sample(v, 2.0 * v));
        }
        for v in values.iter().rev() {
            backward.push(sample(*v, 2.0 * v));
        }
        assert_eq!(forward.finish(), backward.finish());
    }

    #[test]
    fn test_progress_tracks_running_mean() {
        let mut acc = LevelAccumulator::new(0, 1.0);
        let first = acc.push(sample(1.0, 10.0));
        assert_eq!(first.samples, 1);
        assert_eq!(first.mean_charge, 1.0);
        let second = acc.push(sample(3.0, 30.0));
        assert_eq!(second.samples, 2);
        assert_eq!(second.mean_charge, 2.0);
        assert_eq!(second.mean_intensity, 20.0);
        assert_eq!(second.last.charge, 3.0);
    }

    #[test]
    fn test_empty_level_has_no_result() {
        assert!(LevelAccumulator::new(0, 1.0).finish().is_none());
        assert_eq!(RunningMean::new().mean(), None);
    }
}
