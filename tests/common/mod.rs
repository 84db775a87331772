//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use stepper_tunnel::config::StepperConfig;
use stepper_tunnel::hardware::mock::SimulatedCamera;
use stepper_tunnel::hardware::{FocusController, ZeroReference};
use stepper_tunnel::protocol::{registers, Frame};

/// Default configuration with the given zero reference.
pub fn config(zero: ZeroReference) -> StepperConfig {
    let mut config = StepperConfig::default();
    config.calibration.zero_reference = zero;
    config
}

/// Controller over `camera` with the hub enabled.
pub async fn controller(camera: Arc<SimulatedCamera>, config: &StepperConfig) -> Arc<FocusController> {
    let controller = FocusController::connect(camera, config)
        .await
        .expect("controller builds");
    controller.enable_hub().await.expect("hub enables");
    Arc::new(controller)
}

/// Nonzero move commands sent, stop frames excluded.
pub fn moves(camera: &SimulatedCamera) -> Vec<i32> {
    camera
        .register_writes(registers::MOVE)
        .into_iter()
        .filter(|v| *v != 0)
        .collect()
}

/// How many times the hand-authored stop frame went out.
pub fn stops(camera: &SimulatedCamera) -> usize {
    let stop = Frame::from_hex(registers::STOP_FRAME).expect("stop frame parses");
    camera.sent_frames().iter().filter(|f| **f == stop).count()
}
