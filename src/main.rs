//! `charge_cal` command-line entry point.
//!
//! ```text
//! charge_cal run [--config FILE] [--output DIR] [--stem NAME] [--simulate] [--yes]
//! charge_cal decode CAPTURE --ymult 7.8e-5 --xincr 3.2e-10 [--polarity positive]
//! charge_cal show-config
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use charge_cal::config::Settings;
use charge_cal::instrument::capabilities::{AutoConfirm, Operator, RegisterLink, StdinOperator};
use charge_cal::instrument::hp8114::Hp8114;
use charge_cal::instrument::mock::{BenchModel, SimulatedBench};
use charge_cal::instrument::scpi;
use charge_cal::instrument::tektronix::TektronixScope;
use charge_cal::integrator::{ChargeIntegrator, Polarity};
use charge_cal::records::{CsvRecordSink, RecordSink};
use charge_cal::report::TracingObserver;
use charge_cal::sweep::{BenchLinks, DevicePhase, SweepController, SweepPlan, SweepReport};
use charge_cal::waveform::{decode_block, RawCapture, ScaleParameters};

#[derive(Parser)]
#[command(name = "charge_cal", version, about = "Charge monitor calibration sweeps")]
struct Cli {
    /// Configuration file (defaults to config/charge_cal.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured calibration sweep
    Run {
        /// Directory for the record files
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Base name of the record files
        #[arg(long)]
        stem: Option<String>,

        /// Use the simulated bench instead of real instruments
        #[arg(long)]
        simulate: bool,

        /// Seed of the simulated bench
        #[arg(long, default_value_t = 1)]
        seed: u64,

        /// Confirm operator prompts automatically
        #[arg(short, long)]
        yes: bool,
    },
    /// Decode a saved curve block and print its integrated charge
    Decode {
        /// File holding the raw `#<n><len><payload>` block
        file: PathBuf,
        #[arg(long)]
        ymult: f64,
        #[arg(long, default_value_t = 0.0)]
        yzero: f64,
        #[arg(long, default_value_t = 0.0)]
        yoff: f64,
        #[arg(long)]
        xincr: f64,
        #[arg(long, default_value = "negative", value_parser = parse_polarity)]
        polarity: Polarity,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

fn parse_polarity(value: &str) -> Result<Polarity, String> {
    match value.to_ascii_lowercase().as_str() {
        "negative" | "neg" => Ok(Polarity::Negative),
        "positive" | "pos" => Ok(Polarity::Positive),
        other => Err(format!("unknown polarity '{other}' (expected negative or positive)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;

    charge_cal::logging::init(&settings.application)?;

    match cli.command {
        Command::Run {
            output,
            stem,
            simulate,
            seed,
            yes,
        } => {
            if let Some(directory) = output {
                settings.output.directory = directory;
            }
            if let Some(stem) = stem {
                settings.output.file_stem = stem;
            }
            let report = run(&settings, simulate, seed, yes).await?;
            print_report(&report);
        }
        Command::Decode {
            file,
            ymult,
            yzero,
            yoff,
            xincr,
            polarity,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let scale = ScaleParameters {
                ymult,
                yzero,
                yoff,
                xincr,
            };
            let trace = decode_block(&RawCapture::new(bytes), &scale)?;
            let integrator = settings.integration.integrator(polarity);
            let sample = integrator.integrate(&trace)?;
            println!("samples:   {}", trace.len());
            println!("baseline:  {:.6} V", ChargeIntegrator::baseline(&trace)?);
            println!("charge:    {:.4} nC", sample.charge);
            println!("intensity: {:.3}", sample.intensity);
        }
        Command::ShowConfig => {
            println!("{}", toml::to_string_pretty(&settings)?);
        }
    }
    Ok(())
}

async fn run(settings: &Settings, simulate: bool, seed: u64, auto_confirm: bool) -> Result<SweepReport> {
    let plan = settings.sweep_plan()?;
    let mut sink = CsvRecordSink::create(&settings.output.directory, &settings.output.file_stem)?;
    info!(
        raw = %sink.raw_path().display(),
        summary = %sink.summary_path().display(),
        "recording sweep"
    );

    if simulate {
        let model = BenchModel {
            polarity: settings.sweep.reference.polarity,
            ..BenchModel::default()
        };
        let bench = SimulatedBench::new(model, seed);
        let mut scope = bench.scope();
        let mut pulser = bench.pulser();
        let mut operator = bench.operator();
        let mut registers = match plan.device() {
            Some(DevicePhase::Registers(phase)) => {
                let fixed = phase
                    .existing_calibration
                    .iter()
                    .flat_map(|tags| {
                        [
                            (tags.quadratic_numerator.clone(), 0.0),
                            (tags.quadratic_denominator.clone(), 1.0),
                            (tags.linear_numerator.clone(), 2.0),
                            (tags.linear_denominator.clone(), 1.0),
                            (tags.offset.clone(), -24.0),
                        ]
                    })
                    .collect::<Vec<_>>();
                Some(bench.registers(&phase.channels, fixed))
            }
            _ => None,
        };
        let links = BenchLinks {
            scope: &mut scope,
            stimulus: &mut pulser,
            registers: registers.as_mut().map(|r| r as &mut dyn RegisterLink),
            operator: &mut operator,
        };
        return execute(settings, &plan, links, &mut sink).await;
    }

    if let Some(DevicePhase::Registers(phase)) = plan.device() {
        bail!(
            "Phase '{}' reads device registers, which needs a register link; use --simulate",
            phase.name
        );
    }

    let transport = scpi::connect(&settings.scope.endpoint, settings.scope_timeout())
        .with_context(|| format!("Failed to open scope at {}", settings.scope.endpoint))?;
    let mut scope = TektronixScope::connect(transport, &settings.scope.setup).await?;
    let transport = scpi::connect(&settings.pulser.endpoint, settings.pulser_timeout())
        .with_context(|| format!("Failed to open pulser at {}", settings.pulser.endpoint))?;
    let mut pulser = Hp8114::connect(transport, &settings.pulser.setup).await?;
    let mut operator: Box<dyn Operator> = if auto_confirm {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinOperator)
    };
    let links = BenchLinks {
        scope: &mut scope,
        stimulus: &mut pulser,
        registers: None,
        operator: operator.as_mut(),
    };
    execute(settings, &plan, links, &mut sink).await
}

async fn execute<'a>(
    settings: &Settings,
    plan: &SweepPlan,
    links: BenchLinks<'a>,
    sink: &'a mut dyn RecordSink,
) -> Result<SweepReport> {
    let mut controller = SweepController::new(links, sink, settings.acquisition_driver())
        .with_fitter(settings.fitter())
        .with_observer(TracingObserver)
        .with_park_level(settings.sweep.park_level);
    match controller.run(plan).await {
        Ok(report) => Ok(report),
        Err(err) => {
            if let Some(level) = err.resume_level() {
                eprintln!("Sweep stopped after level {level}; records up to that level are saved.");
            }
            Err(err.into())
        }
    }
}

fn print_report(report: &SweepReport) {
    println!("levels: {}", report.reference.len());
    for (index, level) in report.reference.iter().enumerate() {
        let device = report
            .series
            .first()
            .and_then(|s| s.means.get(index))
            .map_or_else(String::new, |m| format!("{m:>12.4}"));
        let ratio = report
            .ratios
            .get(index)
            .copied()
            .flatten()
            .map_or_else(String::new, |r| format!("{r:>10.2}"));
        println!(
            "{:>3} {:>8.2} V {:>10.4} nC {device}{ratio}",
            level.level_index, level.stimulus, level.mean_charge
        );
    }
    for fit in &report.fits {
        match &fit.fit {
            Some(f) => println!(
                "{}: coefficients {:?}, rms {:.2}, {} ({} points)",
                fit.channel, f.polynomial.coefficients, f.rms_residual, f.verdict, f.points_used
            ),
            None => println!("{}: no fit", fit.channel),
        }
        if let Some(rms) = fit.existing_rms {
            println!("{}: loaded calibration rms {rms:.2}", fit.channel);
        }
    }
    println!("capture attempts: {}", report.acquisition_attempts);
}
