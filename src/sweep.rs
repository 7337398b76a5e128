//! Sweep orchestration.
//!
//! A sweep walks an ordered list of stimulus levels through
//! `Leveling(i) → Acquiring(i, n) → Aggregating(i) → Fitting(i)` and finishes in
//! `Done`. Single-phase sweeps only measure the reference charge. Two-phase sweeps
//! first run the reference phase, then a device phase whose per-level response is
//! fitted against the reference charge of the same level index.
//!
//! The controller borrows every instrument link exclusively for its lifetime and
//! calls them strictly in sequence. Transient capture failures are absorbed by the
//! [`AcquisitionDriver`]; anything else stops the sweep with
//! [`CalError::SweepAborted`], which names the phase and the last completed level.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::acquisition::AcquisitionDriver;
use crate::aggregator::{LevelAccumulator, LevelResult};
use crate::calibration::{
    CalibrationFit, CalibrationFitter, CalibrationPoint, CalibrationPolynomial, FitOutcome,
    Verdict,
};
use crate::error::{CalError, CalResult};
use crate::instrument::capabilities::{
    ChannelSetting, Operator, PhaseRole, RegisterLink, ScopeLink, StimulusSource,
};
use crate::integrator::ChargeIntegrator;
use crate::records::{Record, RecordSink};
use crate::registers::{ChannelAccumulator, ExistingCalibrationTags, RegisterChannel};
use crate::report::{NullObserver, ProgressObserver};

/// Where the controller is in the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Leveling(usize),
    Acquiring(usize, usize),
    Aggregating(usize),
    Fitting(usize),
    Done,
}

impl fmt::Display for SweepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepState::Idle => write!(f, "idle"),
            SweepState::Leveling(i) => write!(f, "leveling({i})"),
            SweepState::Acquiring(i, n) => write!(f, "acquiring({i}, {n})"),
            SweepState::Aggregating(i) => write!(f, "aggregating({i})"),
            SweepState::Fitting(i) => write!(f, "fitting({i})"),
            SweepState::Done => write!(f, "done"),
        }
    }
}

/// Stimulus value and optional scope channel setting of one level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelSetting {
    pub stimulus: f64,
    pub channel: Option<ChannelSetting>,
}

impl LevelSetting {
    pub fn new(stimulus: f64) -> Self {
        Self {
            stimulus,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: ChannelSetting) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// A phase measured by integrating scope traces.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopePhase {
    pub name: String,
    pub levels: Vec<LevelSetting>,
    /// Acquisitions averaged per level.
    pub repeats: usize,
    /// Wait after commanding a new level.
    pub settle: Duration,
    pub integrator: ChargeIntegrator,
    /// Operator prompts issued before the phase starts.
    pub prompts: Vec<String>,
}

/// A phase measured by polling device registers.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterPhase {
    pub name: String,
    pub levels: Vec<f64>,
    pub polls_per_level: usize,
    pub poll_interval: Duration,
    pub settle: Duration,
    /// The first channel's verdict is the sweep verdict.
    pub channels: Vec<RegisterChannel>,
    pub existing_calibration: Option<ExistingCalibrationTags>,
    /// Multiplier from reference charge units to the device's units (nC to pC).
    pub reference_scale: f64,
    pub prompts: Vec<String>,
}

/// Device side of a two-phase sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum DevicePhase {
    Scope(ScopePhase),
    Registers(RegisterPhase),
}

impl DevicePhase {
    pub fn name(&self) -> &str {
        match self {
            DevicePhase::Scope(p) => &p.name,
            DevicePhase::Registers(p) => &p.name,
        }
    }

    fn level_count(&self) -> usize {
        match self {
            DevicePhase::Scope(p) => p.levels.len(),
            DevicePhase::Registers(p) => p.levels.len(),
        }
    }
}

/// What a sweep measures.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepPlan {
    SinglePhase {
        reference: ScopePhase,
    },
    TwoPhase {
        reference: ScopePhase,
        device: DevicePhase,
    },
}

impl SweepPlan {
    pub fn reference(&self) -> &ScopePhase {
        match self {
            SweepPlan::SinglePhase { reference } | SweepPlan::TwoPhase { reference, .. } => {
                reference
            }
        }
    }

    pub fn device(&self) -> Option<&DevicePhase> {
        match self {
            SweepPlan::SinglePhase { .. } => None,
            SweepPlan::TwoPhase { device, .. } => Some(device),
        }
    }

    /// Structural checks that do not depend on any instrument.
    pub fn validate(&self) -> CalResult<()> {
        let reference = self.reference();
        check_scope_phase(reference)?;
        match self.device() {
            None => {}
            Some(device) => {
                if device.level_count() > reference.levels.len() {
                    return Err(CalError::Configuration(format!(
                        "device phase '{}' has {} levels but reference phase '{}' only {}",
                        device.name(),
                        device.level_count(),
                        reference.name,
                        reference.levels.len()
                    )));
                }
                match device {
                    DevicePhase::Scope(phase) => check_scope_phase(phase)?,
                    DevicePhase::Registers(phase) => {
                        if phase.levels.is_empty() {
                            return Err(CalError::Configuration(format!(
                                "phase '{}' has no levels",
                                phase.name
                            )));
                        }
                        check_ascending(&phase.name, phase.levels.iter().copied())?;
                        if phase.polls_per_level == 0 {
                            return Err(CalError::Configuration(format!(
                                "phase '{}' polls zero times per level",
                                phase.name
                            )));
                        }
                        if phase.channels.is_empty() {
                            return Err(CalError::Configuration(format!(
                                "phase '{}' has no register channels",
                                phase.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Level tables must rise strictly so the saturation cutoff keeps the low end.
pub(crate) fn check_ascending<I>(phase: &str, levels: I) -> CalResult<()>
where
    I: IntoIterator<Item = f64>,
{
    let mut previous: Option<f64> = None;
    for (index, level) in levels.into_iter().enumerate() {
        if let Some(prev) = previous {
            if level.partial_cmp(&prev) != Some(std::cmp::Ordering::Greater) {
                return Err(CalError::Configuration(format!(
                    "phase '{phase}' levels must be strictly ascending: level {index} ({level}) follows {prev}"
                )));
            }
        }
        previous = Some(level);
    }
    Ok(())
}

fn check_scope_phase(phase: &ScopePhase) -> CalResult<()> {
    if phase.levels.is_empty() {
        return Err(CalError::Configuration(format!(
            "phase '{}' has no levels",
            phase.name
        )));
    }
    check_ascending(&phase.name, phase.levels.iter().map(|l| l.stimulus))?;
    if phase.repeats == 0 {
        return Err(CalError::Configuration(format!(
            "phase '{}' has zero repeats",
            phase.name
        )));
    }
    Ok(())
}

/// Per-level means of one device response series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelSeries {
    pub name: String,
    pub means: Vec<f64>,
    /// Saturated polls per level; all zero for scope phases.
    pub saturated: Vec<usize>,
}

/// Final fit of one response series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelFit {
    pub channel: String,
    /// `None` when too few levels were usable or the system was singular.
    pub fit: Option<CalibrationFit>,
    /// RMS residual of the calibration already loaded in the device.
    pub existing_rms: Option<f64>,
}

/// Everything a finished sweep produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub reference: Vec<LevelResult>,
    /// Level results of a scope device phase.
    pub device_levels: Vec<LevelResult>,
    pub series: Vec<ChannelSeries>,
    pub fits: Vec<ChannelFit>,
    /// `reference / device` charge per paired level, scope device phases only.
    pub ratios: Vec<Option<f64>>,
    pub existing_calibration: Option<CalibrationPolynomial>,
    /// Verdict of the primary channel's final fit.
    pub verdict: Option<Verdict>,
    /// Total capture attempts, retries included.
    pub acquisition_attempts: u64,
}

/// Exclusive handles to the bench instruments.
pub struct BenchLinks<'a> {
    pub scope: &'a mut dyn ScopeLink,
    pub stimulus: &'a mut dyn StimulusSource,
    /// Required by register device phases only.
    pub registers: Option<&'a mut dyn RegisterLink>,
    pub operator: &'a mut dyn Operator,
}

/// Runs a [`SweepPlan`] against a bench.
pub struct SweepController<'a> {
    links: BenchLinks<'a>,
    sink: &'a mut dyn RecordSink,
    observer: Box<dyn ProgressObserver + 'a>,
    driver: AcquisitionDriver,
    fitter: CalibrationFitter,
    park_level: Option<f64>,
    state: SweepState,
    attempts: u64,
}

/// Where a failure happened, for wrapping into `SweepAborted`.
struct Progress<'p> {
    phase: &'p str,
    last_completed: Option<usize>,
}

impl Progress<'_> {
    fn abort(&self, err: CalError) -> CalError {
        match err {
            already @ CalError::SweepAborted { .. } => already,
            source => CalError::SweepAborted {
                phase: self.phase.to_string(),
                last_completed_level: self.last_completed,
                source: Box::new(source),
            },
        }
    }
}

impl<'a> SweepController<'a> {
    pub fn new(links: BenchLinks<'a>, sink: &'a mut dyn RecordSink, driver: AcquisitionDriver) -> Self {
        Self {
            links,
            sink,
            observer: Box::new(NullObserver),
            driver,
            fitter: CalibrationFitter::default(),
            park_level: None,
            state: SweepState::Idle,
            attempts: 0,
        }
    }

    pub fn with_fitter(mut self, fitter: CalibrationFitter) -> Self {
        self.fitter = fitter;
        self
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'a) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Level commanded once the reference phase is over.
    pub fn with_park_level(mut self, park_level: Option<f64>) -> Self {
        self.park_level = park_level;
        self
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    fn enter(&mut self, state: SweepState) {
        debug!(from = %self.state, to = %state, "sweep state");
        self.state = state;
    }

    /// Run `plan` to completion.
    pub async fn run(&mut self, plan: &SweepPlan) -> CalResult<SweepReport> {
        plan.validate()?;
        self.enter(SweepState::Idle);
        let mut report = SweepReport::default();

        let reference = plan.reference();
        report.reference = self.run_scope_phase(reference, PhaseRole::Reference, None).await?;

        if let Some(level) = self.park_level {
            let progress = Progress {
                phase: &reference.name,
                last_completed: reference.levels.len().checked_sub(1),
            };
            self.links
                .stimulus
                .set_level(level)
                .await
                .map_err(|e| progress.abort(CalError::instrument(e)))?;
            info!(level, "stimulus parked");
        }

        match plan.device() {
            None => {}
            Some(DevicePhase::Scope(device)) => {
                self.run_scope_device(device, &mut report).await?;
            }
            Some(DevicePhase::Registers(device)) => {
                self.run_register_device(device, &mut report).await?;
            }
        }

        self.write_summary(&report)
            .map_err(|e| Progress { phase: "summary", last_completed: None }.abort(e))?;
        self.sink.flush()?;
        report.acquisition_attempts = self.attempts;
        self.enter(SweepState::Done);
        info!(verdict = ?report.verdict, attempts = self.attempts, "sweep done");
        Ok(report)
    }

    async fn begin_phase(&mut self, name: &str, prompts: &[String], role: PhaseRole) -> CalResult<()> {
        let progress = Progress {
            phase: name,
            last_completed: None,
        };
        for prompt in prompts {
            self.links
                .operator
                .confirm(prompt)
                .await
                .map_err(|e| progress.abort(CalError::instrument(e)))?;
        }
        self.links
            .operator
            .wiring_ready(role)
            .await
            .map_err(|e| progress.abort(CalError::instrument(e)))?;
        self.sink
            .append(&Record::Section {
                title: format!("{name} phase"),
            })
            .map_err(|e| progress.abort(e))?;
        info!(phase = name, "phase started");
        Ok(())
    }

    async fn set_level(&mut self, index: usize, stimulus: f64, settle: Duration) -> CalResult<()> {
        self.enter(SweepState::Leveling(index));
        self.links
            .stimulus
            .set_level(stimulus)
            .await
            .map_err(CalError::instrument)?;
        if !settle.is_zero() {
            sleep(settle).await;
        }
        Ok(())
    }

    /// Measure every level of a scope phase. `on_level` runs after each level is
    /// aggregated and receives the results so far.
    async fn run_scope_phase(
        &mut self,
        phase: &ScopePhase,
        role: PhaseRole,
        mut on_level: Option<&mut (dyn FnMut(&mut Self, &[LevelResult]) -> CalResult<()> + Send)>,
    ) -> CalResult<Vec<LevelResult>> {
        self.begin_phase(&phase.name, &phase.prompts, role).await?;
        let mut results: Vec<LevelResult> = Vec::with_capacity(phase.levels.len());

        for (index, level) in phase.levels.iter().enumerate() {
            let progress = Progress {
                phase: &phase.name,
                last_completed: results.last().map(|r| r.level_index),
            };
            let result = self
                .measure_scope_level(phase, index, level)
                .await
                .map_err(|e| progress.abort(e))?;
            results.push(result);

            if let Some(callback) = on_level.as_deref_mut() {
                let progress = Progress {
                    phase: &phase.name,
                    last_completed: Some(index),
                };
                callback(self, &results).map_err(|e| progress.abort(e))?;
            }
        }
        Ok(results)
    }

    async fn measure_scope_level(
        &mut self,
        phase: &ScopePhase,
        index: usize,
        level: &LevelSetting,
    ) -> CalResult<LevelResult> {
        self.set_level(index, level.stimulus, phase.settle).await?;
        if let Some(setting) = &level.channel {
            self.links
                .scope
                .configure_level(setting)
                .await
                .map_err(CalError::instrument)?;
        }

        let mut accumulator = LevelAccumulator::new(index, level.stimulus);
        for repeat in 0..phase.repeats {
            self.enter(SweepState::Acquiring(index, repeat));
            let acquisition = self.driver.acquire_trace(&mut *self.links.scope).await?;
            self.attempts += u64::from(acquisition.attempts);
            let sample = phase.integrator.integrate(&acquisition.trace)?;
            self.observer.on_trace(&phase.name, index, &acquisition.trace);

            let progress = accumulator.push(sample);
            self.sink.append(&Record::Repeat {
                level_index: index,
                repeat_index: repeat,
                stimulus: level.stimulus,
                intensity: sample.intensity,
                charge: sample.charge,
            })?;
            self.observer.on_repeat(&phase.name, index, &progress);
        }

        self.enter(SweepState::Aggregating(index));
        let result = accumulator.finish().ok_or_else(|| {
            CalError::Configuration(format!("level {index} finished without repeats"))
        })?;
        self.sink.append(&Record::Level(result))?;
        self.observer.on_level(&phase.name, &result);
        Ok(result)
    }

    /// Fit one response series against the reference and report it to the observer.
    fn fit_series(
        &mut self,
        index: usize,
        channel: &str,
        points: &[CalibrationPoint],
    ) -> Option<CalibrationFit> {
        self.enter(SweepState::Fitting(index));
        match self.fitter.fit(points) {
            Ok(FitOutcome::Fitted(fit)) => {
                self.observer.on_fit(channel, &fit);
                Some(fit)
            }
            Ok(FitOutcome::InsufficientData { available, required }) => {
                debug!(channel, available, required, "not enough levels to fit yet");
                None
            }
            Err(err) => {
                warn!(channel, error = %err, "calibration fit failed");
                None
            }
        }
    }

    async fn run_scope_device(&mut self, device: &ScopePhase, report: &mut SweepReport) -> CalResult<()> {
        let reference = report.reference.clone();
        let name = device.name.clone();
        let mut latest: Option<CalibrationFit> = None;

        let mut on_level = |this: &mut Self, results: &[LevelResult]| -> CalResult<()> {
            let index = results.len() - 1;
            let points = paired_points(&reference, results.iter().map(|r| r.mean_charge), 1.0);
            latest = this.fit_series(index, &name, &points);
            Ok(())
        };
        let device_levels = self
            .run_scope_phase(device, PhaseRole::Device, Some(&mut on_level))
            .await?;

        let fit = latest;
        let points = paired_points(&reference, device_levels.iter().map(|r| r.mean_charge), 1.0);
        let record = ChannelFit {
            channel: device.name.clone(),
            fit: fit.clone(),
            existing_rms: None,
        };
        self.record_fit(&record)
            .map_err(|e| Progress { phase: &device.name, last_completed: device_levels.len().checked_sub(1) }.abort(e))?;

        report.ratios = reference
            .iter()
            .zip(&device_levels)
            .map(|(r, d)| (d.mean_charge != 0.0).then(|| r.mean_charge / d.mean_charge))
            .collect();
        report.series.push(ChannelSeries {
            name: device.name.clone(),
            means: points.iter().map(|p| p.reading).collect(),
            saturated: vec![0; device_levels.len()],
        });
        report.verdict = fit.as_ref().map(|f| f.verdict);
        report.fits.push(record);
        report.device_levels = device_levels;
        Ok(())
    }

    async fn run_register_device(
        &mut self,
        device: &RegisterPhase,
        report: &mut SweepReport,
    ) -> CalResult<()> {
        let Some(registers) = self.links.registers.as_deref_mut() else {
            return Err(Progress {
                phase: &device.name,
                last_completed: None,
            }
            .abort(CalError::Configuration(
                "register phase configured without a register link".into(),
            )));
        };

        let existing = match &device.existing_calibration {
            Some(tags) => match tags.read(registers).await {
                Ok(poly) => {
                    info!(coefficients = ?poly.coefficients, "existing calibration read");
                    Some(poly)
                }
                Err(err) => {
                    warn!(error = %err, "could not read existing calibration; comparison skipped");
                    None
                }
            },
            None => None,
        };

        self.begin_phase(&device.name, &device.prompts, PhaseRole::Device)
            .await?;

        let mut series: Vec<ChannelSeries> = device
            .channels
            .iter()
            .map(|c| ChannelSeries {
                name: c.name.clone(),
                ..ChannelSeries::default()
            })
            .collect();
        let mut fits: Vec<Option<CalibrationFit>> = vec![None; device.channels.len()];

        for (index, &stimulus) in device.levels.iter().enumerate() {
            let progress = Progress {
                phase: &device.name,
                last_completed: index.checked_sub(1),
            };
            let reference_charge = report
                .reference
                .get(index)
                .map(|r| r.mean_charge * device.reference_scale)
                .ok_or_else(|| {
                    progress.abort(CalError::Configuration(format!(
                        "no reference level paired with device level {index}"
                    )))
                })?;
            let accumulators = self
                .poll_register_level(device, index, stimulus, reference_charge)
                .await
                .map_err(|e| progress.abort(e))?;

            for ((channel, acc), s) in device.channels.iter().zip(&accumulators).zip(&mut series) {
                let mean = acc.mean().unwrap_or_default();
                s.means.push(mean);
                s.saturated.push(acc.saturated());
                if acc.saturated() > 0 {
                    warn!(channel = %channel.name, level = index, polls = acc.saturated(), "saturated polls");
                }
                self.sink
                    .append(&Record::ChannelLevel {
                        level_index: index,
                        stimulus,
                        channel: channel.name.clone(),
                        mean,
                        saturated: acc.saturated(),
                    })
                    .map_err(|e| progress.abort(e))?;
                self.observer.on_device_level(&channel.name, index, mean);
            }

            for (s, fit) in series.iter().zip(fits.iter_mut()) {
                let points = paired_points(
                    &report.reference,
                    s.means.iter().copied(),
                    device.reference_scale,
                );
                *fit = self.fit_series(index, &s.name, &points);
            }
        }

        let last = device.levels.len().checked_sub(1);
        for (s, fit) in series.iter().zip(fits) {
            let points = paired_points(&report.reference, s.means.iter().copied(), device.reference_scale);
            let record = ChannelFit {
                channel: s.name.clone(),
                existing_rms: existing
                    .as_ref()
                    .and_then(|poly| self.fitter.evaluate_existing(poly, &points)),
                fit,
            };
            self.record_fit(&record).map_err(|e| {
                Progress {
                    phase: &device.name,
                    last_completed: last,
                }
                .abort(e)
            })?;
            report.fits.push(record);
        }

        report.verdict = report
            .fits
            .first()
            .and_then(|f| f.fit.as_ref())
            .map(|f| f.verdict);
        report.series = series;
        report.existing_calibration = existing;
        Ok(())
    }

    async fn poll_register_level(
        &mut self,
        device: &RegisterPhase,
        index: usize,
        stimulus: f64,
        reference_charge: f64,
    ) -> CalResult<Vec<ChannelAccumulator>> {
        self.set_level(index, stimulus, device.settle).await?;
        let mut accumulators = vec![ChannelAccumulator::default(); device.channels.len()];

        for poll in 0..device.polls_per_level {
            self.enter(SweepState::Acquiring(index, poll));
            if poll > 0 && !device.poll_interval.is_zero() {
                sleep(device.poll_interval).await;
            }
            let registers = self.links.registers.as_deref_mut().ok_or_else(|| {
                CalError::Configuration("register link disappeared mid-sweep".into())
            })?;
            let mut readings = Vec::with_capacity(device.channels.len());
            for (channel, acc) in device.channels.iter().zip(accumulators.iter_mut()) {
                let reading = channel.poll(registers).await?;
                acc.push(&reading);
                readings.push(reading);
            }
            self.sink.append(&Record::RegisterPoll {
                level_index: index,
                poll_index: poll,
                reference_charge,
                readings,
            })?;
        }

        self.enter(SweepState::Aggregating(index));
        Ok(accumulators)
    }

    fn record_fit(&mut self, record: &ChannelFit) -> CalResult<()> {
        match &record.fit {
            Some(fit) => {
                info!(
                    channel = %record.channel,
                    verdict = %fit.verdict,
                    rms = fit.rms_residual,
                    existing_rms = ?record.existing_rms,
                    "final calibration fit"
                );
                self.sink.append(&Record::Fit {
                    channel: record.channel.clone(),
                    fit: fit.clone(),
                    existing_rms: record.existing_rms,
                })
            }
            None => {
                warn!(channel = %record.channel, "no calibration fit for channel");
                Ok(())
            }
        }
    }

    fn write_summary(&mut self, report: &SweepReport) -> CalResult<()> {
        let Some(primary) = report.series.first() else {
            return Ok(());
        };
        for (index, (reference, &device_response)) in
            report.reference.iter().zip(&primary.means).enumerate()
        {
            self.sink.append(&Record::Summary {
                level_index: index,
                stimulus: reference.stimulus,
                reference_intensity: reference.mean_intensity,
                reference_charge: reference.mean_charge,
                device_response,
                ratio: report.ratios.get(index).copied().flatten(),
            })?;
        }
        Ok(())
    }
}

/// Pair device readings with the reference charge of the same level index.
fn paired_points(
    reference: &[LevelResult],
    readings: impl Iterator<Item = f64>,
    reference_scale: f64,
) -> Vec<CalibrationPoint> {
    reference
        .iter()
        .zip(readings)
        .map(|(r, reading)| CalibrationPoint {
            reading,
            reference: r.mean_charge * reference_scale,
        })
        .collect()
}
