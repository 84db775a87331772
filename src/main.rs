//! CLI Entry Point for stepper-tunnel
//!
//! Runs test scenarios against the focus actuator and appends each result to
//! the session summary CSV.
//!
//! No camera SDK binding ships with this crate, so the CLI drives the
//! simulated camera.
//!
//! # Usage
//!
//! ```bash
//! stepper-tunnel --calibrate full
//! stepper-tunnel --config config/stepper_tunnel.toml --debug stall-return jog-in
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use stepper_tunnel::config::{StepperConfig, DEFAULT_CONFIG_PATH};
use stepper_tunnel::hardware::mock::SimulatedCamera;
use stepper_tunnel::hardware::FocusController;
use stepper_tunnel::session::{Scenario, SessionRunner, SummaryLog};
use stepper_tunnel::tracing_setup::{self, TracingConfig};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "stepper-tunnel")]
#[command(about = "Stepper focus actuator tests over a camera serial tunnel", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log every tunnel frame
    #[arg(long)]
    debug: bool,

    /// Run limit calibration before the scenarios
    #[arg(long)]
    calibrate: bool,

    /// Calibration speed override
    #[arg(long, value_name = "SPEED")]
    slow: Option<i32>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Notes recorded with every scenario
    #[arg(long, default_value = "")]
    notes: String,

    /// Scenarios to run, in order
    #[arg(value_name = "SCENARIO", default_values_t = [Scenario::Full])]
    scenarios: Vec<Scenario>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = StepperConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut tracing_config = TracingConfig::from_config(&config)?;
    if cli.debug {
        tracing_config = tracing_config.with_level(Level::DEBUG);
    }
    tracing_setup::init(tracing_config)?;

    let camera = Arc::new(SimulatedCamera::new().with_sensor("Line0", false));
    let controller = Arc::new(FocusController::connect(camera, &config).await?);
    info!(camera = %controller.describe(), sensor = ?controller.sensor_name(), "Camera connected");

    controller.enable_hub().await?;

    if cli.calibrate {
        match controller.calibrate(cli.slow).await {
            Ok(envelope) => info!(min = envelope.min, max = envelope.max, "Calibrated"),
            Err(e) => warn!(error = %e, "Calibration failed; continuing uncalibrated"),
        }
    }

    let runner = SessionRunner::new(controller.clone(), &config)?
        .with_calibration_speed(cli.slow)
        .with_summary(SummaryLog::new(&config.session.summary_csv));

    let mut failures = 0;
    for scenario in cli.scenarios {
        let outcome = runner.run(scenario, &cli.notes).await?;
        println!(
            "{:<13} {:<4} {:>7.2}s  {}",
            outcome.scenario.name(),
            if outcome.success { "PASS" } else { "FAIL" },
            outcome.duration.as_secs_f64(),
            outcome.detail.as_deref().unwrap_or("")
        );
        if !outcome.success {
            failures += 1;
        }
    }

    controller.stop().await?;
    info!(summary = %config.session.summary_csv.display(), "Session archived");

    if failures > 0 {
        anyhow::bail!("{} scenario(s) failed", failures);
    }
    Ok(())
}
