//! Session scenarios end to end on the simulated camera.

mod common;

use std::sync::Arc;

use stepper_tunnel::config::StepperConfig;
use stepper_tunnel::hardware::mock::SimulatedCamera;
use stepper_tunnel::hardware::{TravelEnvelope, ZeroReference};
use stepper_tunnel::protocol::registers;
use stepper_tunnel::session::{JogDirection, Scenario, SessionRunner, SummaryLog};

async fn runner(
    camera: Arc<SimulatedCamera>,
    config: &StepperConfig,
    dir: &tempfile::TempDir,
) -> SessionRunner {
    let controller = common::controller(camera, config).await;
    SessionRunner::new(controller, config)
        .unwrap()
        .with_summary(SummaryLog::new(dir.path().join("session_summary.csv")))
}

#[tokio::test(start_paused = true)]
async fn full_scenario_runs_both_directions_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new());
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;

    let outcome = runner.run(Scenario::Full, "bench run").await.unwrap();

    assert!(outcome.success);
    assert_eq!(common::moves(&camera), vec![100_000, -100_000]);
    assert_eq!(camera.register_writes(registers::POSITION_WRITE).len(), 2);
    assert_eq!(camera.register_writes(registers::RAMP_MODE), vec![0]);

    let rows = SummaryLog::new(dir.path().join("session_summary.csv"))
        .read_all()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].test, "full");
    assert!(rows[0].success);
    assert_eq!(rows[0].notes, "bench run");
    assert!(rows[0].duration_s >= 2.0);
}

#[tokio::test(start_paused = true)]
async fn blocked_sensor_fails_forward_but_still_resets() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new().with_sensor("DigitalIO", true));
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;

    let outcome = runner.run(Scenario::Forward, "").await.unwrap();

    assert!(!outcome.success);
    assert!(common::moves(&camera).is_empty());
    assert_eq!(camera.register_writes(registers::POSITION_WRITE).len(), 1);

    let rows = runner_rows(&dir);
    assert_eq!(rows[0].notes, "(none)");
    assert!(!rows[0].success);
}

#[tokio::test(start_paused = true)]
async fn calibrated_full_scenario_refuses_long_travel() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new());
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;

    let calibrate = runner.run(Scenario::Calibrate, "").await.unwrap();
    assert!(calibrate.success);
    assert_eq!(calibrate.detail.as_deref(), Some("envelope [0, 10000]"));

    camera.clear_log();
    let full = runner.run(Scenario::Full, "").await.unwrap();
    assert!(!full.success);
    assert!(common::moves(&camera).is_empty());

    let rows = runner_rows(&dir);
    let tests: Vec<&str> = rows.iter().map(|r| r.test.as_str()).collect();
    assert_eq!(tests, vec!["calibrate", "full"]);
}

#[tokio::test(start_paused = true)]
async fn jog_then_reset_keeps_envelope_physical() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new());
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;
    runner.run(Scenario::Calibrate, "").await.unwrap();

    let jog = runner.run(Scenario::Jog(JogDirection::In), "").await.unwrap();
    assert!(jog.success);
    assert_eq!(camera.position(), 200);

    runner.run(Scenario::Reset, "").await.unwrap();
    assert_eq!(camera.position(), 0);
    assert_eq!(
        runner.controller().envelope(),
        Some(TravelEnvelope { min: -200, max: 9800 })
    );

    let out = runner.run(Scenario::Jog(JogDirection::Out), "").await.unwrap();
    assert!(out.success);
    assert_eq!(camera.position(), -200);
}

#[tokio::test(start_paused = true)]
async fn stall_return_comes_back_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new().with_position(-1000));
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;

    let outcome = runner.run(Scenario::StallReturn, "").await.unwrap();

    assert!(outcome.success, "{:?}", outcome.detail);
    assert_eq!(
        outcome.detail.as_deref(),
        Some("moved 6000 out and back, error 0 steps")
    );
    assert_eq!(camera.position(), -1000);
    assert_eq!(camera.stall_threshold(), 150);
    assert_eq!(camera.register_writes(registers::SPEED), vec![50, 1000]);
    assert_eq!(camera.speed_registers(), (1000, 50_000));
}

#[tokio::test(start_paused = true)]
async fn stall_return_without_movement_fails() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new().with_position(5000));
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;

    let outcome = runner.run(Scenario::StallReturn, "").await.unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.detail.as_deref(), Some("no movement"));
    assert_eq!(camera.register_writes(registers::SPEED).last(), Some(&1000));
}

#[tokio::test(start_paused = true)]
async fn device_errors_fail_the_scenario_and_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let camera = Arc::new(SimulatedCamera::new());
    let config = common::config(ZeroReference::Min);
    let runner = runner(camera.clone(), &config, &dir).await;
    camera.fail_writes(true);

    let outcome = runner.run(Scenario::Reset, "cable pulled").await.unwrap();

    assert!(!outcome.success);
    assert!(outcome.detail.unwrap().contains("Serial tunnel unavailable"));
    assert_eq!(runner_rows(&dir).len(), 1);
}

fn runner_rows(dir: &tempfile::TempDir) -> Vec<stepper_tunnel::session::SummaryRecord> {
    SummaryLog::new(dir.path().join("session_summary.csv"))
        .read_all()
        .unwrap()
}
