//! Progress reporting for live display.
//!
//! Observers see traces, running means and fits as the sweep produces them. They are
//! purely observational: nothing they do can influence the sweep.

use tracing::info;

use crate::aggregator::{LevelProgress, LevelResult};
use crate::calibration::CalibrationFit;
use crate::waveform::Trace;

/// Receives snapshots from a running sweep. All methods default to no-ops.
pub trait ProgressObserver: Send {
    fn on_trace(&mut self, _phase: &str, _level_index: usize, _trace: &Trace) {}

    fn on_repeat(&mut self, _phase: &str, _level_index: usize, _progress: &LevelProgress) {}

    fn on_level(&mut self, _phase: &str, _result: &LevelResult) {}

    fn on_device_level(&mut self, _channel: &str, _level_index: usize, _mean: f64) {}

    fn on_fit(&mut self, _channel: &str, _fit: &CalibrationFit) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProgressObserver for NullObserver {}

/// Observer that reports progress through `tracing`, matching the on-screen
/// annotations of the bench plots (N, Qavg, Qlast, Iavg, Ilast).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn on_repeat(&mut self, phase: &str, level_index: usize, progress: &LevelProgress) {
        info!(
            phase,
            level = level_index,
            n = progress.samples,
            q_avg = format_args!("{:.4}", progress.mean_charge),
            q_last = format_args!("{:.4}", progress.last.charge),
            i_avg = format_args!("{:.3}", progress.mean_intensity),
            i_last = format_args!("{:.3}", progress.last.intensity),
            "repeat"
        );
    }

    fn on_level(&mut self, phase: &str, result: &LevelResult) {
        info!(
            phase,
            level = result.level_index,
            stimulus = result.stimulus,
            mean_charge = result.mean_charge,
            mean_intensity = result.mean_intensity,
            samples = result.samples,
            "level complete"
        );
    }

    fn on_device_level(&mut self, channel: &str, level_index: usize, mean: f64) {
        info!(channel, level = level_index, mean, "device level complete");
    }

    fn on_fit(&mut self, channel: &str, fit: &CalibrationFit) {
        info!(
            channel,
            coefficients = ?fit.polynomial.coefficients,
            correlation = ?fit.correlation,
            rms = format_args!("{:.2}", fit.rms_residual),
            verdict = %fit.verdict,
            points = fit.points_used,
            "calibration fit"
        );
    }
}
