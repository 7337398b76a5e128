//! The shipped configuration files load, validate and build sweep plans.

use std::path::PathBuf;

use charge_cal::config::{DeviceSettings, Settings};
use charge_cal::integrator::Polarity;
use charge_cal::sweep::DevicePhase;

fn config_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join(name)
}

#[test]
fn test_ict_ratio_config_builds_scope_pair() {
    let settings = Settings::load_from(config_path("charge_cal.toml")).unwrap();
    let plan = settings.sweep_plan().unwrap();

    let reference = plan.reference();
    assert_eq!(reference.levels.len(), 19);
    assert_eq!(reference.repeats, 25);
    let last = reference.levels[18].channel.unwrap();
    assert_eq!(last.volts_per_div, 5.0);
    assert_eq!(last.trigger_level, -5.0);

    match plan.device() {
        Some(DevicePhase::Scope(ict)) => {
            assert_eq!(ict.name, "ict");
            assert_eq!(ict.prompts.len(), 3);
            assert_eq!(ict.levels[0].channel.unwrap().volts_per_div, 0.005);
        }
        other => panic!("unexpected device phase: {other:?}"),
    }
    assert_eq!(settings.sweep.park_level, Some(1.0));
    assert_eq!(settings.pulser.setup.gpib_address, 14);
}

#[test]
fn test_register_config_builds_monitor_phase() {
    let settings = Settings::load_from(config_path("acmi_registers.toml")).unwrap();
    assert_eq!(settings.pulser.setup.output_polarity, Polarity::Positive);
    assert!(matches!(
        settings.sweep.device,
        Some(DeviceSettings::Registers(_))
    ));

    let plan = settings.sweep_plan().unwrap();
    assert_eq!(plan.reference().levels.len(), 23);
    assert_eq!(plan.reference().integrator.polarity, Polarity::Positive);
    assert_eq!(
        plan.reference().levels[0].channel.unwrap().trigger_level,
        0.2
    );

    match plan.device() {
        Some(DevicePhase::Registers(monitor)) => {
            assert_eq!(monitor.levels.len(), 23);
            assert_eq!(monitor.channels.len(), 3);
            assert_eq!(monitor.polls_per_level, 16);
            assert_eq!(monitor.poll_interval.as_millis(), 2200);
            assert_eq!(monitor.reference_scale, 1000.0);
            let tags = monitor.existing_calibration.as_ref().unwrap();
            assert_eq!(tags.offset, "Program:Main_Loop.Fit_Off");

            let ba = &monitor.channels[2];
            assert_eq!(ba.name, "self_test_ba");
            assert_eq!(ba.primary, "Program:Main_Loop.ST1BA_ADCB");
            let reading = ba.reading(812.0, Some(12.0));
            assert_eq!(reading.value, 800.0);
            assert!(!reading.saturated);
            let clipped = ba.reading(2047.0, Some(12.0));
            assert!(clipped.saturated);
            assert_eq!(clipped.value, 2047.0);
        }
        other => panic!("unexpected device phase: {other:?}"),
    }
}
