//! Simulated Hardware
//!
//! `SimulatedCamera` stands in for a real camera with a stepper controller
//! behind its serial hub. It is used by the test suite and by the CLI when no
//! camera binding is available.
//!
//! # Model
//!
//! - Motor travels at a fixed rate (default 20 000 steps/s) measured on the
//!   tokio clock, so tests can run with paused time
//! - Mechanical limits clamp travel; hitting one with stall detection armed
//!   (enable + commit seen) latches the stall flag until the next move
//! - Replies echo the opcode with a running-sum checksum; position reads and
//!   driver status carry the position or stall flag in bytes 3..7
//! - Optional optical sensor exposed as a named digital input
//!
//! # Fault Injection
//!
//! Dropped or truncated replies, suppressed stall reports, rejected hub
//! enable, failing writes and unreadable sensors.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::hardware::capabilities::CameraFeatures;
use crate::protocol::{registers, ChecksumMode, Frame, FRAME_LEN};

const DEFAULT_STEPS_PER_SECOND: i64 = 20_000;

/// An in-flight relative move.
#[derive(Debug, Clone, Copy)]
struct Travel {
    origin: i64,
    target: i64,
    started: Instant,
}

#[derive(Debug)]
struct MotorModel {
    /// Mechanical position in steps
    mech: i64,
    /// Reported position is `mech - offset`
    offset: i64,
    min: i64,
    max: i64,
    steps_per_second: i64,
    travel: Option<Travel>,
    stall_enabled: bool,
    stall_committed: bool,
    stall_threshold: u8,
    stalled: bool,
    speed: i32,
    acceleration: i32,
}

impl MotorModel {
    fn new() -> Self {
        Self {
            mech: 0,
            offset: 0,
            min: -5000,
            max: 5000,
            steps_per_second: DEFAULT_STEPS_PER_SECOND,
            travel: None,
            stall_enabled: false,
            stall_committed: false,
            stall_threshold: 0,
            stalled: false,
            speed: 0,
            acceleration: 0,
        }
    }

    fn stall_armed(&self) -> bool {
        self.stall_enabled && self.stall_committed
    }

    fn advance(&mut self, now: Instant) {
        let Some(travel) = self.travel else {
            return;
        };
        let reachable = travel.target.clamp(self.min, self.max);
        let distance = reachable - travel.origin;
        let elapsed_us = i64::try_from(now.duration_since(travel.started).as_micros()).unwrap_or(i64::MAX);
        let covered = elapsed_us.saturating_mul(self.steps_per_second) / 1_000_000;

        if covered >= distance.abs() {
            self.mech = reachable;
            self.travel = None;
            if reachable != travel.target && self.stall_armed() {
                trace!(position = self.mech, "Simulated stall at limit");
                self.stalled = true;
            }
        } else {
            self.mech = travel.origin + distance.signum() * covered;
        }
    }

    fn reported(&self) -> i64 {
        self.mech - self.offset
    }

    fn start_move(&mut self, steps: i32, now: Instant) {
        self.stalled = false;
        self.travel = Some(Travel {
            origin: self.mech,
            target: self.mech + i64::from(steps),
            started: now,
        });
    }

    fn halt(&mut self) {
        self.travel = None;
    }
}

#[derive(Debug, Default)]
struct TunnelState {
    hub_enabled: bool,
    frame_size: Option<u32>,
    pending: Option<Bytes>,
    log: Vec<Frame>,
    awaiting_read: bool,
    overlaps: usize,
}

#[derive(Debug, Default)]
struct FaultPlan {
    hub_enable_fails: bool,
    write_fails: bool,
    sensor_read_fails: bool,
    drop_replies: u32,
    short_replies: u32,
    /// Swallow replies to one opcode only
    opcode_drops: Option<(u8, u32)>,
    /// Remaining stall reports before the flag is suppressed
    stall_reports_left: Option<u32>,
}

/// Simulated camera with a stepper controller behind its serial hub.
pub struct SimulatedCamera {
    model: String,
    motor: Mutex<MotorModel>,
    tunnel: Mutex<TunnelState>,
    faults: Mutex<FaultPlan>,
    sensor: Option<String>,
    sensor_blocked: AtomicBool,
}

impl SimulatedCamera {
    /// Camera with limits at ±5000 steps, motor at 0, no sensor.
    pub fn new() -> Self {
        Self {
            model: "Simulated camera (stepper tunnel)".to_string(),
            motor: Mutex::new(MotorModel::new()),
            tunnel: Mutex::new(TunnelState::default()),
            faults: Mutex::new(FaultPlan::default()),
            sensor: None,
            sensor_blocked: AtomicBool::new(false),
        }
    }

    /// Set the mechanical limits.
    pub fn with_limits(mut self, min: i64, max: i64) -> Self {
        let motor = self.motor.get_mut();
        motor.min = min.min(max);
        motor.max = min.max(max);
        motor.mech = motor.mech.clamp(motor.min, motor.max);
        self
    }

    /// Set the starting position.
    pub fn with_position(mut self, position: i64) -> Self {
        let motor = self.motor.get_mut();
        motor.mech = position.clamp(motor.min, motor.max);
        self
    }

    /// Set the travel rate.
    pub fn with_steps_per_second(mut self, rate: i64) -> Self {
        self.motor.get_mut().steps_per_second = rate.max(1);
        self
    }

    /// Expose an optical sensor under `name`.
    pub fn with_sensor(mut self, name: &str, blocked: bool) -> Self {
        self.sensor = Some(name.to_string());
        self.sensor_blocked = AtomicBool::new(blocked);
        self
    }

    /// Set the model string returned by `describe`.
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    // --- inspection -------------------------------------------------------

    /// Every frame written to the tunnel, in order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.tunnel.lock().log.clone()
    }

    /// Forget logged frames.
    pub fn clear_log(&self) {
        self.tunnel.lock().log.clear();
    }

    /// Values written with `opcode`, in order.
    pub fn register_writes(&self, opcode: u8) -> Vec<i32> {
        self.tunnel
            .lock()
            .log
            .iter()
            .filter(|f| f.opcode() == opcode)
            .map(|f| f.value())
            .collect()
    }

    /// Frame size requested through the tunnel, if any.
    pub fn tunnel_frame_size(&self) -> Option<u32> {
        self.tunnel.lock().frame_size
    }

    /// Writes that arrived while a previous reply was still unread.
    pub fn overlapping_exchanges(&self) -> usize {
        self.tunnel.lock().overlaps
    }

    /// Mechanical position right now.
    pub fn mechanical_position(&self) -> i64 {
        let mut motor = self.motor.lock();
        motor.advance(Instant::now());
        motor.mech
    }

    /// Position as the controller would report it right now.
    pub fn position(&self) -> i64 {
        let mut motor = self.motor.lock();
        motor.advance(Instant::now());
        motor.reported()
    }

    /// Whether stall detection has been enabled and committed.
    pub fn stall_guard_armed(&self) -> bool {
        self.motor.lock().stall_armed()
    }

    /// Last threshold written to the stall register.
    pub fn stall_threshold(&self) -> u8 {
        self.motor.lock().stall_threshold
    }

    /// Current speed and acceleration registers.
    pub fn speed_registers(&self) -> (i32, i32) {
        let motor = self.motor.lock();
        (motor.speed, motor.acceleration)
    }

    // --- control ----------------------------------------------------------

    /// Teleport the motor so it reports `position`. Any move is cancelled.
    pub fn set_position(&self, position: i64) {
        let mut motor = self.motor.lock();
        motor.halt();
        motor.mech = (position + motor.offset).clamp(motor.min, motor.max);
    }

    /// Change the optical sensor state.
    pub fn set_sensor_blocked(&self, blocked: bool) {
        self.sensor_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Make `enable_serial_tunnel` fail.
    pub fn fail_hub_enable(&self, fail: bool) {
        self.faults.lock().hub_enable_fails = fail;
    }

    /// Make tunnel writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.faults.lock().write_fails = fail;
    }

    /// Make sensor reads fail.
    pub fn fail_sensor_reads(&self, fail: bool) {
        self.faults.lock().sensor_read_fails = fail;
    }

    /// Swallow the next `count` replies.
    pub fn drop_replies(&self, count: u32) {
        self.faults.lock().drop_replies = count;
    }

    /// Swallow the next `count` replies to `opcode`; other replies pass.
    pub fn drop_replies_for(&self, opcode: u8, count: u32) {
        self.faults.lock().opcode_drops = Some((opcode, count));
    }

    /// Truncate the next `count` replies to three bytes.
    pub fn short_replies(&self, count: u32) {
        self.faults.lock().short_replies = count;
    }

    /// Report at most `count` more stalls; later stalls read as clear.
    pub fn suppress_stall_after(&self, count: u32) {
        self.faults.lock().stall_reports_left = Some(count);
    }

    fn handle(&self, frame: &Frame) -> Bytes {
        let now = Instant::now();
        let mut motor = self.motor.lock();
        motor.advance(now);

        let opcode = frame.opcode();
        let value = frame.value();
        let value_bytes = match opcode {
            registers::MOVE => {
                if value == 0 {
                    motor.halt();
                } else {
                    motor.start_move(value, now);
                }
                frame.value().to_be_bytes()
            }
            registers::POSITION_WRITE => {
                motor.halt();
                motor.offset = motor.mech - i64::from(value);
                value.to_be_bytes()
            }
            registers::POSITION_READ => {
                let reported = i32::try_from(motor.reported()).unwrap_or(i32::MAX);
                reported.to_be_bytes()
            }
            registers::DRIVER_STATUS => {
                let flag = motor.stalled && self.consume_stall_report();
                [u8::from(flag), 0, 0, 0]
            }
            registers::STALL_ENABLE => {
                motor.stall_enabled = true;
                motor.stall_committed = false;
                value.to_be_bytes()
            }
            registers::STALL_THRESHOLD => {
                motor.stall_threshold = frame.as_bytes()[4];
                value.to_be_bytes()
            }
            registers::STALL_COMMIT => {
                motor.stall_committed = true;
                value.to_be_bytes()
            }
            registers::SPEED => {
                motor.speed = value;
                value.to_be_bytes()
            }
            registers::ACCELERATION => {
                motor.acceleration = value;
                value.to_be_bytes()
            }
            _ => value.to_be_bytes(),
        };

        let reply = Frame::with_value_bytes(opcode, value_bytes, ChecksumMode::RunningSum);
        Bytes::copy_from_slice(reply.as_bytes())
    }

    fn consume_stall_report(&self) -> bool {
        let mut faults = self.faults.lock();
        match faults.stall_reports_left.as_mut() {
            None => true,
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CameraFeatures for SimulatedCamera {
    async fn enable_serial_tunnel(&self) -> bool {
        if self.faults.lock().hub_enable_fails {
            return false;
        }
        self.tunnel.lock().hub_enabled = true;
        true
    }

    async fn set_tunnel_frame_size(&self, size: u32) -> bool {
        self.tunnel.lock().frame_size = Some(size);
        true
    }

    async fn write_tunnel_bytes(&self, bytes: &[u8]) -> Result<()> {
        if self.faults.lock().write_fails {
            return Err(anyhow!("SerialTxData write rejected"));
        }
        if !self.tunnel.lock().hub_enabled {
            return Err(anyhow!("SerialHubEnable is off"));
        }
        let raw: [u8; FRAME_LEN] = bytes
            .try_into()
            .map_err(|_| anyhow!("expected {} bytes, got {}", FRAME_LEN, bytes.len()))?;
        let frame = Frame::from_bytes(raw);

        let reply = self.handle(&frame);

        let mut tunnel = self.tunnel.lock();
        if tunnel.awaiting_read {
            tunnel.overlaps += 1;
        }
        tunnel.awaiting_read = true;
        tunnel.log.push(frame);
        tunnel.pending = Some(reply);
        Ok(())
    }

    async fn read_tunnel_bytes(&self) -> Option<Bytes> {
        let pending = {
            let mut tunnel = self.tunnel.lock();
            tunnel.awaiting_read = false;
            tunnel.pending.take()
        }?;

        let mut faults = self.faults.lock();
        if let Some((opcode, left)) = faults.opcode_drops.as_mut() {
            if *left > 0 && pending.get(2).copied() == Some(*opcode) {
                *left -= 1;
                return None;
            }
        }
        if faults.drop_replies > 0 {
            faults.drop_replies -= 1;
            return None;
        }
        if faults.short_replies > 0 {
            faults.short_replies -= 1;
            return Some(pending.slice(..3));
        }
        Some(pending)
    }

    async fn read_digital_input(&self, name: &str) -> Option<bool> {
        if self.sensor.as_deref() != Some(name) || self.faults.lock().sensor_read_fails {
            return None;
        }
        Some(self.sensor_blocked.load(Ordering::SeqCst))
    }

    fn describe(&self) -> String {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn exchange(camera: &SimulatedCamera, frame: Frame) -> Option<Bytes> {
        camera.write_tunnel_bytes(frame.as_bytes()).await.unwrap();
        camera.read_tunnel_bytes().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_reaches_target_over_time() {
        let camera = SimulatedCamera::new();
        camera.enable_serial_tunnel().await;
        exchange(&camera, Frame::new(registers::MOVE, 2000, ChecksumMode::ValueSum)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(camera.position(), 1000);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(camera.position(), 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_latches_only_when_armed() {
        let camera = SimulatedCamera::new().with_limits(-100, 100);
        camera.enable_serial_tunnel().await;
        let status = Frame::new(registers::DRIVER_STATUS, 0, ChecksumMode::ValueSum);

        exchange(&camera, Frame::new(registers::MOVE, 500, ChecksumMode::ValueSum)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let reply = exchange(&camera, status).await.unwrap();
        assert_eq!(reply[3], 0);
        assert_eq!(camera.position(), 100);

        exchange(&camera, Frame::new(registers::STALL_ENABLE, 0, ChecksumMode::ValueSum)).await;
        exchange(&camera, Frame::new(registers::STALL_COMMIT, 0, ChecksumMode::ValueSum)).await;
        exchange(&camera, Frame::new(registers::MOVE, 500, ChecksumMode::ValueSum)).await;
        let reply = exchange(&camera, status).await.unwrap();
        assert_eq!(reply[3], 1);
    }

    #[tokio::test]
    async fn test_write_requires_hub() {
        let camera = SimulatedCamera::new();
        let frame = Frame::new(registers::POSITION_READ, 0, ChecksumMode::ValueSum);
        assert!(camera.write_tunnel_bytes(frame.as_bytes()).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_write_rebases_position() {
        let camera = SimulatedCamera::new().with_position(-4000);
        camera.enable_serial_tunnel().await;
        exchange(&camera, Frame::new(registers::POSITION_WRITE, 0, ChecksumMode::ValueSum)).await;
        assert_eq!(camera.position(), 0);
        assert_eq!(camera.mechanical_position(), -4000);
    }

    #[tokio::test]
    async fn test_reply_uses_running_sum() {
        let camera = SimulatedCamera::new();
        camera.enable_serial_tunnel().await;
        let reply = exchange(&camera, Frame::new(registers::SPEED, 1000, ChecksumMode::ValueSum))
            .await
            .unwrap();
        let parsed = crate::protocol::Reply::new(reply).parse().unwrap();
        assert!(parsed.checksum_matches(ChecksumMode::RunningSum));
        assert_eq!(camera.speed_registers().0, 1000);
    }
}
