//! Configuration system using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. built-in defaults (an ICT-ratio bench: 19 levels, 25 repeats, negative pulses)
//! 2. an optional TOML file
//! 3. environment variables prefixed with `CHARGE_CAL_`, nested keys split on `__`
//!
//! ```text
//! CHARGE_CAL_APPLICATION__LOG_LEVEL=debug
//! CHARGE_CAL_FIT__DEGREE=1
//! CHARGE_CAL_ACQUISITION__MAX_ATTEMPTS=50
//! ```
//!
//! After loading, settings are validated and turned into a [`SweepPlan`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionDriver, RetryPolicy};
use crate::calibration::CalibrationFitter;
use crate::error::{CalError, CalResult};
use crate::instrument::capabilities::ChannelSetting;
use crate::instrument::hp8114::PulserSetup;
use crate::instrument::scpi::Endpoint;
use crate::instrument::tektronix::ScopeSetup;
use crate::integrator::{ChargeIntegrator, Polarity};
use crate::registers::{ExistingCalibrationTags, RegisterChannel};
use crate::sweep::{check_ascending, DevicePhase, LevelSetting, RegisterPhase, ScopePhase, SweepPlan};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CHARGE_CAL_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub output: OutputSettings,
    pub scope: ScopeSettings,
    pub pulser: PulserSettings,
    pub acquisition: RetryPolicy,
    pub integration: IntegrationSettings,
    pub sweep: SweepSettings,
    pub fit: FitSettings,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub name: String,
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence when set.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "charge_cal".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub directory: PathBuf,
    /// Base name of the record files (`<stem>.raw.csv`, `<stem>_summary.csv`).
    pub file_stem: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            file_stem: "calibration".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    pub endpoint: Endpoint,
    pub timeout_ms: u64,
    /// Samples requested per capture (`DATA:STOP`).
    pub sample_count: usize,
    #[serde(flatten)]
    pub setup: ScopeSetup,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Tcp {
                address: "10.0.128.110:4000".to_string(),
            },
            timeout_ms: 5000,
            sample_count: 5000,
            setup: ScopeSetup::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulserSettings {
    pub endpoint: Endpoint,
    pub timeout_ms: u64,
    #[serde(flatten)]
    pub setup: PulserSetup,
}

impl Default for PulserSettings {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 115_200,
            },
            timeout_ms: 1000,
            setup: PulserSetup::default(),
        }
    }
}

/// Conversion constants of the charge integrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationSettings {
    pub charge_per_volt_second: f64,
    pub intensity_per_volt_second: f64,
}

impl Default for IntegrationSettings {
    fn default() -> Self {
        let defaults = ChargeIntegrator::new(Polarity::Negative);
        Self {
            charge_per_volt_second: defaults.charge_per_volt_second,
            intensity_per_volt_second: defaults.intensity_per_volt_second,
        }
    }
}

impl IntegrationSettings {
    pub fn integrator(&self, polarity: Polarity) -> ChargeIntegrator {
        ChargeIntegrator {
            polarity,
            charge_per_volt_second: self.charge_per_volt_second,
            intensity_per_volt_second: self.intensity_per_volt_second,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    SinglePhase,
    #[default]
    TwoPhase,
}

/// One scope-measured phase as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopePhaseSettings {
    pub name: String,
    /// Stimulus amplitudes in volts, ascending.
    pub levels: Vec<f64>,
    /// Channel V/div per level. Empty leaves the scope scale untouched.
    pub channel_scales: Vec<f64>,
    /// Trigger level as a multiple of the level's channel scale.
    pub trigger_factor: f64,
    pub repeats: usize,
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    pub polarity: Polarity,
    pub prompts: Vec<String>,
}

impl Default for ScopePhaseSettings {
    fn default() -> Self {
        Self {
            name: "reference".to_string(),
            levels: (1..=19).map(f64::from).collect(),
            channel_scales: vec![
                0.2, 0.5, 0.5, 0.5, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0,
                2.0, 2.0, 5.0,
            ],
            trigger_factor: -1.0,
            repeats: 25,
            settle: Duration::from_secs(1),
            polarity: Polarity::Negative,
            prompts: vec!["Connect cable from the pulser to oscilloscope channel 1.".to_string()],
        }
    }
}

impl ScopePhaseSettings {
    fn ict() -> Self {
        Self {
            name: "ict".to_string(),
            channel_scales: vec![
                0.005, 0.01, 0.01, 0.02, 0.02, 0.02, 0.02, 0.02, 0.05, 0.05, 0.05, 0.05, 0.05,
                0.05, 0.05, 0.05, 0.05, 0.05, 0.05,
            ],
            prompts: vec![
                "Remove cable from the oscilloscope and add a 6 dB attenuator to its end."
                    .to_string(),
                "Connect the attenuator to the ICT test input.".to_string(),
                "Connect the ICT charge output to oscilloscope channel 1.".to_string(),
            ],
            ..Self::default()
        }
    }

    fn validate(&self) -> CalResult<()> {
        if self.levels.is_empty() {
            return Err(invalid(format!("phase '{}': level table is empty", self.name)));
        }
        if self.repeats == 0 {
            return Err(invalid(format!("phase '{}': repeats must be > 0", self.name)));
        }
        check_ascending(&self.name, self.levels.iter().copied())?;
        if !self.channel_scales.is_empty() && self.channel_scales.len() != self.levels.len() {
            return Err(invalid(format!(
                "phase '{}': {} channel scales for {} levels",
                self.name,
                self.channel_scales.len(),
                self.levels.len()
            )));
        }
        Ok(())
    }

    fn to_phase(&self, integration: &IntegrationSettings) -> ScopePhase {
        let levels = self
            .levels
            .iter()
            .enumerate()
            .map(|(i, &stimulus)| {
                let level = LevelSetting::new(stimulus);
                match self.channel_scales.get(i) {
                    Some(&volts_per_div) => level.with_channel(ChannelSetting {
                        volts_per_div,
                        trigger_level: volts_per_div * self.trigger_factor,
                    }),
                    None => level,
                }
            })
            .collect();
        ScopePhase {
            name: self.name.clone(),
            levels,
            repeats: self.repeats,
            settle: self.settle,
            integrator: integration.integrator(self.polarity),
            prompts: self.prompts.clone(),
        }
    }
}

/// A register-polled device phase as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterPhaseSettings {
    pub name: String,
    /// Defaults to the reference levels when empty.
    pub levels: Vec<f64>,
    pub polls_per_level: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub settle: Duration,
    pub channels: Vec<RegisterChannel>,
    pub existing_calibration: Option<ExistingCalibrationTags>,
    pub prompts: Vec<String>,
}

impl Default for RegisterPhaseSettings {
    fn default() -> Self {
        Self {
            name: "monitor".to_string(),
            levels: Vec::new(),
            polls_per_level: 16,
            poll_interval: Duration::from_millis(2200),
            settle: Duration::from_secs(3),
            channels: Vec::new(),
            existing_calibration: None,
            prompts: Vec::new(),
        }
    }
}

/// Device side of a two-phase sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSettings {
    Scope(ScopePhaseSettings),
    Registers(RegisterPhaseSettings),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    pub mode: SweepMode,
    pub reference: ScopePhaseSettings,
    pub device: Option<DeviceSettings>,
    /// Stimulus level commanded after the reference phase.
    pub park_level: Option<f64>,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            mode: SweepMode::TwoPhase,
            reference: ScopePhaseSettings::default(),
            device: Some(DeviceSettings::Scope(ScopePhaseSettings::ict())),
            park_level: Some(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitSettings {
    #[serde(flatten)]
    pub fitter: CalibrationFitter,
    /// Multiplier from reference charge (nC) to the device's units (pC).
    pub reference_scale: f64,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            fitter: CalibrationFitter::default(),
            reference_scale: 1000.0,
        }
    }
}

fn invalid(message: String) -> CalError {
    CalError::Configuration(message)
}

impl Settings {
    /// Load defaults, `config/charge_cal.toml` if present, then the environment.
    pub fn load() -> CalResult<Self> {
        Self::extract(Self::figment(Some(Path::new("config/charge_cal.toml"))))
    }

    /// Load from an explicit file, which must exist.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(invalid(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        Self::extract(Self::figment(Some(path)))
    }

    /// The layered provider stack.
    ///
    /// The default device phase is left out of the base layer so a configured
    /// device of another kind does not inherit its keys.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut defaults = Settings::default();
        defaults.sweep.device = None;
        let mut figment = Figment::from(Serialized::defaults(defaults));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    fn extract(figment: Figment) -> CalResult<Self> {
        let mut settings: Self = figment.extract()?;
        if settings.sweep.mode == SweepMode::TwoPhase && settings.sweep.device.is_none() {
            settings.sweep.device = SweepSettings::default().device;
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> CalResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        if self.output.file_stem.trim().is_empty() {
            return Err(invalid("output.file_stem cannot be empty".to_string()));
        }
        if self.scope.sample_count == 0 {
            return Err(invalid("scope.sample_count must be > 0".to_string()));
        }
        if self.acquisition.max_attempts == Some(0) {
            return Err(invalid(
                "acquisition.max_attempts must be > 0 (omit it to retry forever)".to_string(),
            ));
        }

        let fit = &self.fit.fitter;
        if !(1..=2).contains(&fit.degree) {
            return Err(invalid(format!("fit.degree must be 1 or 2, got {}", fit.degree)));
        }
        if fit.min_points < fit.degree + 1 {
            return Err(invalid(format!(
                "fit.min_points ({}) must be at least degree + 1 ({})",
                fit.min_points,
                fit.degree + 1
            )));
        }
        if fit.max_levels < fit.min_points {
            return Err(invalid(format!(
                "fit.max_levels ({}) is below fit.min_points ({})",
                fit.max_levels, fit.min_points
            )));
        }

        self.sweep.reference.validate()?;
        match (&self.sweep.mode, &self.sweep.device) {
            (SweepMode::SinglePhase, _) => {}
            (SweepMode::TwoPhase, None) => {
                return Err(invalid(
                    "sweep.mode is two_phase but no sweep.device is configured".to_string(),
                ))
            }
            (SweepMode::TwoPhase, Some(DeviceSettings::Scope(phase))) => phase.validate()?,
            (SweepMode::TwoPhase, Some(DeviceSettings::Registers(phase))) => {
                if phase.channels.is_empty() {
                    return Err(invalid(format!(
                        "phase '{}': at least one register channel is required",
                        phase.name
                    )));
                }
                if phase.polls_per_level == 0 {
                    return Err(invalid(format!(
                        "phase '{}': polls_per_level must be > 0",
                        phase.name
                    )));
                }
                check_ascending(&phase.name, phase.levels.iter().copied())?;
            }
        }
        Ok(())
    }

    /// Build the sweep plan described by these settings.
    pub fn sweep_plan(&self) -> CalResult<SweepPlan> {
        let reference = self.sweep.reference.to_phase(&self.integration);
        let plan = match (&self.sweep.mode, &self.sweep.device) {
            (SweepMode::SinglePhase, _) => SweepPlan::SinglePhase { reference },
            (SweepMode::TwoPhase, None) => {
                return Err(invalid("two_phase sweep without a device phase".to_string()))
            }
            (SweepMode::TwoPhase, Some(device)) => {
                let device = match device {
                    DeviceSettings::Scope(phase) => {
                        DevicePhase::Scope(phase.to_phase(&self.integration))
                    }
                    DeviceSettings::Registers(phase) => DevicePhase::Registers(RegisterPhase {
                        name: phase.name.clone(),
                        levels: if phase.levels.is_empty() {
                            self.sweep.reference.levels.clone()
                        } else {
                            phase.levels.clone()
                        },
                        polls_per_level: phase.polls_per_level,
                        poll_interval: phase.poll_interval,
                        settle: phase.settle,
                        channels: phase.channels.clone(),
                        existing_calibration: phase.existing_calibration.clone(),
                        reference_scale: self.fit.reference_scale,
                        prompts: phase.prompts.clone(),
                    }),
                };
                SweepPlan::TwoPhase { reference, device }
            }
        };
        plan.validate()?;
        Ok(plan)
    }

    pub fn acquisition_driver(&self) -> AcquisitionDriver {
        AcquisitionDriver::new(self.acquisition.clone(), self.scope.sample_count)
    }

    pub fn fitter(&self) -> CalibrationFitter {
        self.fit.fitter.clone()
    }

    pub fn scope_timeout(&self) -> Duration {
        Duration::from_millis(self.scope.timeout_ms)
    }

    pub fn pulser_timeout(&self) -> Duration {
        Duration::from_millis(self.pulser.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        let plan = settings.sweep_plan().unwrap();
        assert_eq!(plan.reference().levels.len(), 19);
        assert_eq!(plan.reference().repeats, 25);
        let first = plan.reference().levels[0].channel.unwrap();
        assert_eq!(first.volts_per_div, 0.2);
        assert_eq!(first.trigger_level, -0.2);
        assert!(matches!(plan.device(), Some(DevicePhase::Scope(p)) if p.name == "ict"));
    }

    #[test]
    fn test_load_register_phase_from_toml() {
        let file = write_toml(
            r#"
[application]
log_level = "debug"

[acquisition]
max_attempts = 40
settle_delay = "50ms"

[fit]
degree = 2
max_levels = 15

[sweep.reference]
levels = [1.0, 2.0, 3.0, 4.0, 5.0]
channel_scales = []
trigger_factor = 1.0
polarity = "positive"

[sweep.device]
kind = "registers"
name = "acmi"
poll_interval = "0s"

[[sweep.device.channels]]
name = "beam"
primary = "Program:Main_Loop.Beam_ADCA"
secondary = "Program:Main_Loop.Beam_ADCB"

[[sweep.device.channels]]
name = "self_test_ba"
primary = "Program:Main_Loop.ST1BA_ADCB"
saturation = { kind = "disabled" }
"#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.acquisition.max_attempts, Some(40));
        assert_eq!(settings.acquisition.settle_delay, Duration::from_millis(50));
        assert_eq!(settings.fit.fitter.max_levels, 15);
        assert_eq!(settings.fit.fitter.min_points, 4);
        assert_eq!(settings.fit.reference_scale, 1000.0);

        let plan = settings.sweep_plan().unwrap();
        assert_eq!(
            plan.reference().integrator.polarity,
            Polarity::Positive
        );
        match plan.device() {
            Some(DevicePhase::Registers(phase)) => {
                assert_eq!(phase.levels, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
                assert_eq!(phase.polls_per_level, 16);
                assert_eq!(phase.channels.len(), 2);
                assert_eq!(phase.channels[1].secondary, None);
            }
            other => panic!("unexpected device phase: {other:?}"),
        }
    }

    #[test]
    fn test_file_without_device_gets_default_device() {
        let file = write_toml("[fit]\ndegree = 1\nmin_points = 3\n");
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.sweep.device, SweepSettings::default().device);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(matches!(
            Settings::load_from("/nonexistent/charge_cal.toml"),
            Err(CalError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let mut s = Settings::default();
        s.application.log_level = "verbose".into();
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.fit.fitter.degree = 3;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.fit.fitter.min_points = 2;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.acquisition.max_attempts = Some(0);
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sweep.reference.channel_scales.pop();
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sweep.reference.repeats = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sweep.device = None;
        assert!(s.validate().is_err());
        s.sweep.mode = SweepMode::SinglePhase;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_unsorted_levels_are_rejected() {
        let mut s = Settings::default();
        s.sweep.reference.levels.reverse();
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("strictly ascending"));
        assert!(s.sweep_plan().is_err());

        let mut s = Settings::default();
        s.sweep.device = Some(DeviceSettings::Registers(RegisterPhaseSettings {
            levels: vec![1.0, 2.0, 2.0],
            channels: vec![RegisterChannel {
                name: "beam".into(),
                primary: "A".into(),
                secondary: None,
                saturation: crate::registers::SaturationRule::default(),
            }],
            ..RegisterPhaseSettings::default()
        }));
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CHARGE_CAL_FIT__DEGREE", "1");
            jail.set_env("CHARGE_CAL_OUTPUT__FILE_STEM", "bench7");
            let settings: Settings = Settings::figment(None).extract()?;
            assert_eq!(settings.fit.fitter.degree, 1);
            assert_eq!(settings.output.file_stem, "bench7");
            Ok(())
        });
    }
}
