//! In-process instruments for tests and simulated runs.
//!
//! The scripted doubles replay fixed data and injected faults so the acquisition
//! and sweep logic can be exercised deterministically. [`SimulatedBench`] instead
//! models a whole bench: a pulser, a scope that sees a pulse whose area follows the
//! pulser amplitude, and a charge monitor whose ADC registers respond to the same
//! pulses and saturate at full scale.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::instrument::capabilities::{
    ChannelSetting, Operator, PhaseRole, RegisterLink, ScopeLink, StimulusSource,
};
use crate::instrument::scpi::ScpiTransport;
use crate::integrator::Polarity;
use crate::registers::{RegisterChannel, DEFAULT_SATURATION_CODE};
use crate::waveform::{encode_block, RawCapture, ScaleParameters};

/// Failure injected into one capture attempt of a [`ScriptedScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeFault {
    /// `*OPC?` never answers.
    Timeout,
    /// The curve transfer fails.
    Transport,
    /// The curve transfer returns a truncated block.
    Malformed,
}

/// Scope double that returns the same block for every capture, after consuming
/// one queued fault per attempt.
#[derive(Debug, Clone)]
pub struct ScriptedScope {
    block: RawCapture,
    scale: ScaleParameters,
    faults: VecDeque<ScopeFault>,
    current: Option<ScopeFault>,
    arm_count: u32,
    settings: Vec<ChannelSetting>,
}

impl ScriptedScope {
    pub fn new(block: RawCapture, scale: ScaleParameters) -> Self {
        Self {
            block,
            scale,
            faults: VecDeque::new(),
            current: None,
            arm_count: 0,
            settings: Vec::new(),
        }
    }

    /// Queue faults for the next attempts, in order.
    pub fn with_faults(mut self, faults: impl IntoIterator<Item = ScopeFault>) -> Self {
        self.faults.extend(faults);
        self
    }

    /// Number of times the scope was armed.
    pub fn arm_count(&self) -> u32 {
        self.arm_count
    }

    /// Channel settings applied so far, one per level.
    pub fn settings(&self) -> &[ChannelSetting] {
        &self.settings
    }
}

#[async_trait]
impl ScopeLink for ScriptedScope {
    async fn arm(&mut self, _sample_count: usize) -> Result<()> {
        self.arm_count += 1;
        self.current = self.faults.pop_front();
        Ok(())
    }

    async fn wait_operation_complete(&mut self) -> Result<()> {
        match self.current {
            Some(ScopeFault::Timeout) => bail!("Timed out waiting for *OPC?"),
            _ => Ok(()),
        }
    }

    async fn read_scale_parameters(&mut self) -> Result<ScaleParameters> {
        Ok(self.scale)
    }

    async fn read_raw_block(&mut self) -> Result<RawCapture> {
        match self.current {
            Some(ScopeFault::Transport) => bail!("Connection reset during CURVE? transfer"),
            Some(ScopeFault::Malformed) => {
                let bytes = self.block.as_bytes();
                let cut = bytes.len().saturating_sub(2).max(1).min(bytes.len());
                Ok(RawCapture::new(bytes[..cut].to_vec()))
            }
            _ => Ok(self.block.clone()),
        }
    }

    async fn configure_level(&mut self, setting: &ChannelSetting) -> Result<()> {
        self.settings.push(*setting);
        Ok(())
    }
}

/// Register double backed by a tag table.
///
/// A tag may hold a sequence of values; each read consumes one and the last value
/// repeats once the sequence is exhausted.
#[derive(Debug, Clone, Default)]
pub struct MockRegisters {
    values: HashMap<String, VecDeque<f64>>,
    reads: usize,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, tag: &str, value: f64) -> Self {
        self.with_sequence(tag, [value])
    }

    pub fn with_sequence(mut self, tag: &str, values: impl IntoIterator<Item = f64>) -> Self {
        self.values
            .insert(tag.to_string(), values.into_iter().collect());
        self
    }

    /// Total register reads served.
    pub fn reads(&self) -> usize {
        self.reads
    }
}

#[async_trait]
impl RegisterLink for MockRegisters {
    async fn read_register(&mut self, name: &str) -> Result<f64> {
        let queue = self
            .values
            .get_mut(name)
            .ok_or_else(|| anyhow!("Unknown register '{name}'"))?;
        let value = match queue.len() {
            0 => bail!("Register '{name}' has no value"),
            1 => queue[0],
            _ => queue.pop_front().unwrap_or_default(),
        };
        self.reads += 1;
        Ok(value)
    }
}

/// Pulser double that records every commanded level.
#[derive(Debug, Clone, Default)]
pub struct RecordingPulser {
    levels: Vec<f64>,
    fail_on_call: Option<usize>,
}

impl RecordingPulser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `call`-th `set_level` (zero based) with a transport error.
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }
}

#[async_trait]
impl StimulusSource for RecordingPulser {
    async fn set_level(&mut self, value: f64) -> Result<()> {
        if self.fail_on_call == Some(self.levels.len()) {
            bail!("GPIB write failed while setting level {value}");
        }
        self.levels.push(value);
        Ok(())
    }
}

/// SCPI transport double: records traffic and answers queries from a table.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    sent: Vec<String>,
    responses: HashMap<String, String>,
    blocks: VecDeque<RawCapture>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, query: &str, response: &str) -> Self {
        self.responses
            .insert(query.to_string(), response.to_string());
        self
    }

    pub fn with_block(mut self, block: RawCapture) -> Self {
        self.blocks.push_back(block);
        self
    }

    /// Every command and query sent, in order.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

#[async_trait]
impl ScpiTransport for MockTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.sent.push(command.to_string());
        Ok(())
    }

    async fn query(&mut self, query: &str) -> Result<String> {
        self.sent.push(query.to_string());
        self.responses
            .get(query)
            .cloned()
            .ok_or_else(|| anyhow!("No response to '{query}'"))
    }

    async fn read_block(&mut self, _max_payload: usize) -> Result<RawCapture> {
        self.blocks
            .pop_front()
            .ok_or_else(|| anyhow!("No block pending"))
    }
}

/// Shared physical state of a simulated bench.
#[derive(Debug)]
struct BenchState {
    level: f64,
    role: PhaseRole,
}

fn lock(state: &Mutex<BenchState>) -> Result<std::sync::MutexGuard<'_, BenchState>> {
    state
        .lock()
        .map_err(|_| anyhow!("Simulated bench state poisoned"))
}

/// Tunables of the simulated bench.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchModel {
    /// Polarity of the pulse seen by the scope.
    pub polarity: Polarity,
    /// Pulse width in seconds.
    pub pulse_width: f64,
    /// Scope sample interval in seconds.
    pub sample_interval: f64,
    /// Scope-side gain of the device path relative to the reference path.
    pub device_gain: f64,
    /// Baseline noise in volts (uniform, peak).
    pub noise: f64,
    /// Probability of an injected scope timeout per capture.
    pub fault_rate: f64,
    /// Monitor ADC counts per picocoulomb.
    pub counts_per_pc: f64,
    /// Quadratic non-linearity of the monitor in counts per pC squared.
    pub curvature: f64,
    /// Monitor pedestal in counts.
    pub pedestal: f64,
}

impl Default for BenchModel {
    fn default() -> Self {
        Self {
            polarity: Polarity::Negative,
            pulse_width: 50e-9,
            sample_interval: 3.2e-10,
            device_gain: 0.01,
            noise: 2e-3,
            fault_rate: 0.02,
            counts_per_pc: 0.5,
            curvature: 5e-5,
            pedestal: 12.0,
        }
    }
}

/// A pulser, scope, charge monitor and operator sharing one physical state.
///
/// A pulse of amplitude `V` lasting 50 ns into 50 ohm carries `V` nanocoulombs,
/// which is what the scope integrator reports on the reference path.
#[derive(Debug, Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
    model: BenchModel,
    seed: u64,
}

impl SimulatedBench {
    pub fn new(model: BenchModel, seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BenchState {
                level: 0.0,
                role: PhaseRole::Reference,
            })),
            model,
            seed,
        }
    }

    pub fn pulser(&self) -> SimulatedPulser {
        SimulatedPulser {
            state: Arc::clone(&self.state),
        }
    }

    pub fn scope(&self) -> SimulatedScope {
        SimulatedScope {
            state: Arc::clone(&self.state),
            model: self.model.clone(),
            rng: StdRng::seed_from_u64(self.seed),
            setting: ChannelSetting {
                volts_per_div: 2.0,
                trigger_level: -2.0,
            },
            pending: None,
            timed_out: false,
        }
    }

    /// Charge monitor exposing the given channels plus fixed extra tags.
    pub fn registers(
        &self,
        channels: &[RegisterChannel],
        fixed: impl IntoIterator<Item = (String, f64)>,
    ) -> SimulatedRegisters {
        SimulatedRegisters {
            state: Arc::clone(&self.state),
            model: self.model.clone(),
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(1)),
            primaries: channels.iter().map(|c| c.primary.clone()).collect(),
            secondaries: channels.iter().filter_map(|c| c.secondary.clone()).collect(),
            fixed: fixed.into_iter().collect(),
        }
    }

    pub fn operator(&self) -> SimulatedOperator {
        SimulatedOperator {
            state: Arc::clone(&self.state),
        }
    }
}

/// Pulser side of a [`SimulatedBench`].
#[derive(Debug, Clone)]
pub struct SimulatedPulser {
    state: Arc<Mutex<BenchState>>,
}

#[async_trait]
impl StimulusSource for SimulatedPulser {
    async fn set_level(&mut self, value: f64) -> Result<()> {
        lock(&self.state)?.level = value;
        Ok(())
    }
}

/// Scope side of a [`SimulatedBench`].
#[derive(Debug)]
pub struct SimulatedScope {
    state: Arc<Mutex<BenchState>>,
    model: BenchModel,
    rng: StdRng,
    setting: ChannelSetting,
    pending: Option<(Vec<i16>, ScaleParameters)>,
    timed_out: bool,
}

impl SimulatedScope {
    fn synthesize(&mut self, sample_count: usize) -> Result<(Vec<i16>, ScaleParameters)> {
        let (level, role) = {
            let state = lock(&self.state)?;
            (state.level, state.role)
        };
        let gain = match role {
            PhaseRole::Reference => 1.0,
            PhaseRole::Device => self.model.device_gain,
        };
        let amplitude = self.model.polarity.sign() * level.abs() * gain;

        let scale = ScaleParameters {
            // The channel offset leaves about ten divisions for the pulse.
            ymult: self.setting.volts_per_div * 20.0 / 65536.0,
            yoff: 0.0,
            yzero: 0.0,
            xincr: self.model.sample_interval,
        };
        let start = sample_count / 4;
        let width = (self.model.pulse_width / self.model.sample_interval).round() as usize;
        let noise = self.model.noise.abs();
        let codes = (0..sample_count)
            .map(|i| {
                let mut v = if noise > 0.0 {
                    self.rng.gen_range(-noise..=noise)
                } else {
                    0.0
                };
                if i >= start && i < start + width {
                    v += amplitude;
                }
                (v / scale.ymult)
                    .round()
                    .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect();
        Ok((codes, scale))
    }
}

#[async_trait]
impl ScopeLink for SimulatedScope {
    async fn arm(&mut self, sample_count: usize) -> Result<()> {
        self.timed_out = self.rng.gen_bool(self.model.fault_rate.clamp(0.0, 1.0));
        self.pending = Some(self.synthesize(sample_count)?);
        Ok(())
    }

    async fn wait_operation_complete(&mut self) -> Result<()> {
        if self.timed_out {
            bail!("Simulated scope did not trigger");
        }
        Ok(())
    }

    async fn read_scale_parameters(&mut self) -> Result<ScaleParameters> {
        self.pending
            .as_ref()
            .map(|(_, scale)| *scale)
            .ok_or_else(|| anyhow!("No capture armed"))
    }

    async fn read_raw_block(&mut self) -> Result<RawCapture> {
        let (codes, _) = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("No capture armed"))?;
        Ok(encode_block(&codes))
    }

    async fn configure_level(&mut self, setting: &ChannelSetting) -> Result<()> {
        self.setting = *setting;
        Ok(())
    }
}

/// Charge-monitor side of a [`SimulatedBench`].
#[derive(Debug)]
pub struct SimulatedRegisters {
    state: Arc<Mutex<BenchState>>,
    model: BenchModel,
    rng: StdRng,
    primaries: Vec<String>,
    secondaries: Vec<String>,
    fixed: HashMap<String, f64>,
}

#[async_trait]
impl RegisterLink for SimulatedRegisters {
    async fn read_register(&mut self, name: &str) -> Result<f64> {
        if let Some(value) = self.fixed.get(name) {
            return Ok(*value);
        }
        let jitter = f64::from(self.rng.gen_range(-1i8..=1));
        if self.secondaries.iter().any(|t| t == name) {
            return Ok(self.model.pedestal + jitter);
        }
        if self.primaries.iter().any(|t| t == name) {
            let pc = lock(&self.state)?.level.abs() * 1000.0;
            let counts = self.model.pedestal
                + self.model.counts_per_pc * pc
                + self.model.curvature * pc * pc
                + jitter;
            return Ok(counts.round().min(DEFAULT_SATURATION_CODE));
        }
        bail!("Unknown register '{name}'")
    }
}

/// Operator of a [`SimulatedBench`]; rewires the signal path when a phase is ready.
#[derive(Debug, Clone)]
pub struct SimulatedOperator {
    state: Arc<Mutex<BenchState>>,
}

#[async_trait]
impl Operator for SimulatedOperator {
    async fn confirm(&mut self, message: &str) -> Result<()> {
        info!(prompt = message, "simulated operator confirms");
        Ok(())
    }

    async fn wiring_ready(&mut self, role: PhaseRole) -> Result<()> {
        lock(&self.state)?.role = role;
        Ok(())
    }
}
