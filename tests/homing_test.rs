//! Homing state machine against the simulated actuator.

mod common;

use std::sync::Arc;

use stepper_tunnel::error::CalibrationError;
use stepper_tunnel::hardware::mock::SimulatedCamera;
use stepper_tunnel::hardware::{HomingState, TravelEnvelope, ZeroReference};
use stepper_tunnel::protocol::registers;

#[tokio::test(start_paused = true)]
async fn raw_zero_reference_reports_encoder_envelope() {
    let camera = Arc::new(SimulatedCamera::new().with_limits(-5000, 5000));
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Raw)).await;

    let envelope = controller.calibrate(None).await.unwrap();

    assert_eq!(envelope, TravelEnvelope { min: -5000, max: 5000 });
    assert_eq!(controller.envelope(), Some(envelope));
    assert_eq!(camera.register_writes(registers::SPEED), vec![200, 1000]);
    assert_eq!(camera.register_writes(registers::ACCELERATION), vec![100, 50_000]);
    assert!(camera.register_writes(registers::POSITION_WRITE).is_empty());
}

#[tokio::test(start_paused = true)]
async fn min_zero_reference_zeroes_at_negative_limit() {
    let camera = Arc::new(SimulatedCamera::new().with_limits(-5000, 5000).with_position(1200));
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Min)).await;

    let envelope = controller.calibrate(None).await.unwrap();

    assert_eq!(envelope, TravelEnvelope { min: 0, max: 10_000 });
    assert_eq!(camera.mechanical_position(), -5000);
    assert_eq!(camera.position(), 0);
    assert_eq!(controller.state().last_known_position, Some(0));
}

#[tokio::test(start_paused = true)]
async fn max_zero_reference_zeroes_at_positive_limit() {
    let camera = Arc::new(SimulatedCamera::new().with_limits(-3000, 7000));
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Max)).await;

    let envelope = controller.calibrate(None).await.unwrap();

    assert_eq!(envelope, TravelEnvelope { min: -10_000, max: 0 });
    assert_eq!(camera.position(), 0);
}

#[tokio::test(start_paused = true)]
async fn stall_guard_configured_in_order() {
    let camera = Arc::new(SimulatedCamera::new());
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Raw)).await;

    controller.calibrate(None).await.unwrap();

    let opcodes: Vec<u8> = camera.sent_frames().iter().map(|f| f.opcode()).collect();
    let position = |op: u8| opcodes.iter().position(|o| *o == op).unwrap();
    assert!(position(registers::STALL_ENABLE) < position(registers::STALL_THRESHOLD));
    assert!(position(registers::STALL_THRESHOLD) < position(registers::STALL_COMMIT));
    assert!(position(registers::STALL_COMMIT) < position(registers::MOVE));
    assert_eq!(camera.stall_threshold(), 50);
}

#[tokio::test(start_paused = true)]
async fn speed_override_is_used_for_seeking() {
    let camera = Arc::new(SimulatedCamera::new());
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Raw)).await;

    controller.calibrate(Some(80)).await.unwrap();

    assert_eq!(camera.register_writes(registers::SPEED), vec![80, 1000]);
}

#[tokio::test(start_paused = true)]
async fn missing_max_stall_times_out_and_restores_speed_once() {
    let camera = Arc::new(SimulatedCamera::new());
    camera.suppress_stall_after(1);
    let mut config = common::config(ZeroReference::Raw);
    config.calibration.max_polls = 20;
    let controller = common::controller(camera.clone(), &config).await;

    let err = controller.calibrate(None).await.unwrap_err();

    assert_eq!(
        err,
        CalibrationError::Timeout {
            phase: HomingState::SeekingMax,
            polls: 20
        }
    );
    assert_eq!(controller.envelope(), None);
    assert_eq!(camera.register_writes(registers::SPEED), vec![200, 1000]);
    assert_eq!(camera.register_writes(registers::ACCELERATION), vec![100, 50_000]);
}

#[tokio::test(start_paused = true)]
async fn unreadable_limit_position_aborts() {
    let camera = Arc::new(SimulatedCamera::new());
    camera.drop_replies_for(registers::POSITION_READ, u32::MAX);
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Raw)).await;

    let err = controller.calibrate(None).await.unwrap_err();

    assert_eq!(
        err,
        CalibrationError::PositionUnavailable {
            phase: HomingState::SeekingMin,
            attempts: 3
        }
    );
    let reads = camera
        .sent_frames()
        .iter()
        .filter(|f| f.opcode() == registers::POSITION_READ)
        .count();
    assert_eq!(reads, 3);
    assert_eq!(camera.register_writes(registers::SPEED), vec![200, 1000]);
}

#[tokio::test(start_paused = true)]
async fn blocked_sensor_aborts_before_any_move() {
    let camera = Arc::new(SimulatedCamera::new().with_sensor("DigitalIOInput", true));
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Min)).await;

    let err = controller.calibrate(None).await.unwrap_err();

    assert_eq!(
        err,
        CalibrationError::MotionBlocked {
            phase: HomingState::SeekingMin
        }
    );
    assert!(common::moves(&camera).is_empty());
    assert_eq!(camera.register_writes(registers::SPEED), vec![200, 1000]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_and_leaves_uncalibrated() {
    let camera = Arc::new(SimulatedCamera::new().with_limits(-1_000_000, 1_000_000));
    let controller = common::controller(camera.clone(), &common::config(ZeroReference::Min)).await;

    let handle = controller.spawn_calibration(None);
    let mut states = handle.subscribe();
    states
        .wait_for(|s| *s == HomingState::SeekingMin)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    let stops_before_cancel = common::stops(&camera);

    handle.cancel();
    let err = handle.wait().await.unwrap_err();

    assert_eq!(
        err,
        CalibrationError::Cancelled {
            phase: HomingState::SeekingMin
        }
    );
    assert!(common::stops(&camera) > stops_before_cancel);
    assert_eq!(controller.envelope(), None);
    assert_eq!(*states.borrow(), HomingState::Idle);
    assert_eq!(camera.register_writes(registers::SPEED), vec![200, 1000]);
}

#[tokio::test(start_paused = true)]
async fn failed_recalibration_clears_previous_envelope() {
    let camera = Arc::new(SimulatedCamera::new().with_limits(-2000, 2000));
    let mut config = common::config(ZeroReference::Raw);
    config.calibration.max_polls = 5;
    let controller = common::controller(camera.clone(), &config).await;

    controller.calibrate(None).await.unwrap();
    assert_eq!(controller.envelope(), Some(TravelEnvelope { min: -2000, max: 2000 }));

    camera.suppress_stall_after(0);
    assert!(controller.calibrate(None).await.is_err());
    assert_eq!(controller.envelope(), None);
}

#[tokio::test(start_paused = true)]
async fn calibration_requires_enabled_hub() {
    let camera = Arc::new(SimulatedCamera::new());
    let config = common::config(ZeroReference::Min);
    let controller = stepper_tunnel::hardware::FocusController::connect(camera.clone(), &config)
        .await
        .unwrap();

    let err = controller.calibrate(None).await.unwrap_err();
    assert!(matches!(err, CalibrationError::TransportUnavailable(_)));
    assert!(camera.sent_frames().is_empty());
}
