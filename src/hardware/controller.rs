//! Focus actuator controller.
//!
//! `FocusController` is the surface callers use: it owns the tunnel, the
//! register layer, the motion primitives and the interlock, and keeps the
//! process-local actuator state (last position, envelope, hub status).
//!
//! # Example
//!
//! ```rust,ignore
//! let controller = FocusController::connect(camera, &config).await?;
//! controller.enable_hub().await?;
//! let envelope = controller.calibrate(None).await?;
//! controller.move_relative(500).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::{CalibrationConfig, MotionConfig, StepperConfig};
use crate::error::{AppResult, CalibrationError, TunnelError};
use crate::hardware::capabilities::CameraFeatures;
use crate::hardware::homing::{Homing, HomingState};
use crate::hardware::motion::MotionPrimitives;
use crate::hardware::registers::RegisterAccess;
use crate::hardware::safety::SafetyInterlock;
use crate::hardware::transport::TunnelTransport;
use crate::protocol::{registers, Frame};

pub use crate::hardware::safety::TravelEnvelope;

/// Process-local knowledge about the actuator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorState {
    /// Last position read back with no motion since; `None` once the
    /// actuator may have moved
    pub last_known_position: Option<i32>,
    /// Envelope from the last successful calibration
    pub envelope: Option<TravelEnvelope>,
    /// Whether the serial hub is enabled
    pub hub_enabled: bool,
}

/// What a relative move did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveReport {
    /// Steps requested
    pub steps: i32,
    /// Signed travel the sent frame commands
    pub travel: i64,
    /// Absolute target, known only when the envelope was checked
    pub expected_target: Option<i64>,
    /// Whether a calibrated envelope was enforced
    pub calibrated: bool,
}

/// Result of [`FocusController::drive_to_stall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallSeek {
    /// Stall polls performed
    pub polls: u32,
    /// Whether the driver reported a stall
    pub stalled: bool,
}

/// Control surface for one actuator behind one tunnel.
pub struct FocusController {
    camera: Arc<dyn CameraFeatures>,
    transport: Arc<TunnelTransport>,
    registers: Arc<RegisterAccess>,
    motion: Arc<MotionPrimitives>,
    interlock: Arc<SafetyInterlock>,
    state: Arc<RwLock<ActuatorState>>,
    /// Held for the duration of a calibration run
    calibration_lock: Arc<Mutex<()>>,
    calibration: CalibrationConfig,
    normal: MotionConfig,
}

impl FocusController {
    /// Build a controller over `camera` and discover the optical sensor.
    ///
    /// The hub is not enabled; call [`enable_hub`](Self::enable_hub).
    pub async fn connect(camera: Arc<dyn CameraFeatures>, config: &StepperConfig) -> AppResult<Self> {
        let transport = Arc::new(TunnelTransport::new(camera.clone(), &config.tunnel));
        let registers = Arc::new(RegisterAccess::new(transport.clone(), &config.protocol));
        let motion = Arc::new(MotionPrimitives::new(registers.clone(), &config.protocol)?);
        let interlock = Arc::new(
            SafetyInterlock::discover(camera.clone(), &config.safety.sensor_candidates).await,
        );

        info!(camera = %camera.describe(), sensor = ?interlock.sensor_name(), "Controller ready");

        Ok(Self {
            camera,
            transport,
            registers,
            motion,
            interlock,
            state: Arc::new(RwLock::new(ActuatorState::default())),
            calibration_lock: Arc::new(Mutex::new(())),
            calibration: config.calibration.clone(),
            normal: config.motion.clone(),
        })
    }

    /// Camera description.
    pub fn describe(&self) -> String {
        self.camera.describe()
    }

    /// Register access, for sequences the controller does not model.
    pub fn registers(&self) -> &Arc<RegisterAccess> {
        &self.registers
    }

    /// Normal operating motion settings.
    pub fn motion_config(&self) -> &MotionConfig {
        &self.normal
    }

    /// Name of the bound optical sensor, if any.
    pub fn sensor_name(&self) -> Option<&str> {
        self.interlock.sensor_name()
    }

    /// Snapshot of the actuator state.
    pub fn state(&self) -> ActuatorState {
        *self.state.read()
    }

    /// Current travel envelope.
    pub fn envelope(&self) -> Option<TravelEnvelope> {
        self.state.read().envelope
    }

    /// Enable the serial hub.
    pub async fn enable_hub(&self) -> AppResult<()> {
        let enabled = self.transport.enable().await;
        self.state.write().hub_enabled = enabled;
        if enabled {
            Ok(())
        } else {
            Err(TunnelError::TransportUnavailable(
                "camera rejected serial hub enable".to_string(),
            ))
        }
    }

    /// Read the position and remember it.
    pub async fn read_position(&self) -> Option<i32> {
        let position = self.registers.read_position().await;
        if let Some(p) = position {
            self.state.write().last_known_position = Some(p);
        }
        position
    }

    /// Move by `steps` after passing the safety interlock.
    ///
    /// A zero delta sends nothing. Without an envelope the move is allowed
    /// with a warning. The envelope is checked against the travel the encoded
    /// frame commands, which under a fixed-value encoding is not `steps`.
    #[instrument(skip(self))]
    pub async fn move_relative(&self, steps: i32) -> AppResult<MoveReport> {
        let travel = self.motion.effective_delta(steps);
        let mut report = MoveReport {
            steps,
            travel,
            expected_target: None,
            calibrated: false,
        };
        if steps == 0 {
            return Ok(report);
        }

        self.interlock
            .check_sensor()
            .await
            .map_err(TunnelError::MotionBlocked)?;

        let envelope = self.envelope();
        let current = match envelope {
            Some(_) => match self.read_position().await {
                Some(p) => Some(p),
                None => {
                    let fallback = self.state.read().last_known_position;
                    warn!(?fallback, "Position read failed; using last known position");
                    fallback
                }
            },
            None => {
                warn!("Actuator not calibrated; moving without envelope check");
                None
            }
        };

        let target = SafetyInterlock::check_envelope(envelope, current, travel).map_err(|reason| {
            warn!(%reason, travel, "Move refused");
            TunnelError::MotionBlocked(reason)
        })?;

        self.forget_position();
        self.motion.move_steps(steps).await?;

        report.expected_target = target;
        report.calibrated = envelope.is_some();
        Ok(report)
    }

    /// Halt motion. Safe to call repeatedly and while calibrating.
    ///
    /// A stop may land short of the last target, so the remembered position
    /// is dropped.
    pub async fn stop(&self) -> AppResult<()> {
        self.forget_position();
        self.motion.stop().await
    }

    /// The actuator may be moving; only a fresh read is trustworthy.
    fn forget_position(&self) {
        self.state.write().last_known_position = None;
    }

    /// Make the current position zero.
    ///
    /// Any envelope is shifted so it keeps describing the same physical travel.
    pub async fn set_zero(&self) -> AppResult<Option<i32>> {
        let before = self.read_position().await;
        let after = self.motion.set_zero().await?;
        self.rebase(before, after);
        Ok(after)
    }

    /// Send a list of prebuilt frames in order.
    ///
    /// A sequence that rewrites the position register rebases the envelope
    /// the same way [`set_zero`](Self::set_zero) does. Returns how many
    /// frames got a reply.
    pub async fn run_sequence(&self, frames: &[Frame]) -> AppResult<usize> {
        let rewrites_position = frames
            .iter()
            .any(|f| f.opcode() == registers::POSITION_WRITE);
        let before = if rewrites_position {
            self.read_position().await
        } else {
            None
        };

        self.forget_position();
        let mut answered = 0;
        for frame in frames {
            if self.registers.send_raw(frame).await?.is_some() {
                answered += 1;
            }
        }

        if rewrites_position {
            let after = self.registers.read_position().await;
            self.rebase(before, after);
        }
        info!(sent = frames.len(), answered, "Command sequence complete");
        Ok(answered)
    }

    /// Shift the envelope after the reported position jumped from `before`
    /// to `after` without physical motion.
    fn rebase(&self, before: Option<i32>, after: Option<i32>) {
        let mut state = self.state.write();
        if let Some(envelope) = state.envelope {
            match (before, after) {
                (Some(before), Some(after)) => {
                    let shift = i64::from(after) - i64::from(before);
                    let moved = |bound: i32| {
                        i32::try_from(i64::from(bound) + shift).unwrap_or(if shift > 0 {
                            i32::MAX
                        } else {
                            i32::MIN
                        })
                    };
                    state.envelope = Some(TravelEnvelope::spanning(
                        moved(envelope.min),
                        moved(envelope.max),
                    ));
                }
                _ => {
                    warn!("Position register rewritten without readback; envelope cleared");
                    state.envelope = None;
                }
            }
        }
        state.last_known_position = after;
    }

    /// Drive by `steps` with stall detection armed until the driver reports a
    /// stall or `max_polls` polls pass, then stop.
    ///
    /// Only the optical sensor is checked: the move is meant to reach a
    /// mechanical limit, so the envelope does not apply.
    pub async fn drive_to_stall(
        &self,
        steps: i32,
        max_polls: u32,
        poll_interval: Duration,
    ) -> AppResult<StallSeek> {
        self.interlock
            .check_sensor()
            .await
            .map_err(TunnelError::MotionBlocked)?;

        self.forget_position();
        self.motion.stop().await?;
        self.motion.move_steps(steps).await?;

        let mut seek = StallSeek {
            polls: 0,
            stalled: false,
        };
        while seek.polls < max_polls {
            tokio::time::sleep(poll_interval).await;
            seek.polls += 1;
            if self.registers.read_stall_flag().await {
                seek.stalled = true;
                break;
            }
        }
        self.motion.stop().await?;
        info!(polls = seek.polls, stalled = seek.stalled, "Stall seek finished");
        Ok(seek)
    }

    /// Calibrate in the current task.
    pub async fn calibrate(&self, speed: Option<i32>) -> Result<TravelEnvelope, CalibrationError> {
        let (state_tx, _) = watch::channel(HomingState::Idle);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.run_homing(speed, state_tx, cancel_rx).await
    }

    /// Calibrate on a background task.
    pub fn spawn_calibration(&self, speed: Option<i32>) -> CalibrationHandle {
        let (state_tx, state_rx) = watch::channel(HomingState::Idle);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let job = self.calibration_job();
        let task = tokio::spawn(async move { job.run(speed, state_tx, cancel_rx).await });
        CalibrationHandle {
            cancel_tx,
            state_rx,
            task,
        }
    }

    async fn run_homing(
        &self,
        speed: Option<i32>,
        state_tx: watch::Sender<HomingState>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TravelEnvelope, CalibrationError> {
        self.calibration_job().run(speed, state_tx, cancel_rx).await
    }

    fn calibration_job(&self) -> CalibrationJob {
        CalibrationJob {
            transport: self.transport.clone(),
            motion: self.motion.clone(),
            interlock: self.interlock.clone(),
            state: self.state.clone(),
            lock: self.calibration_lock.clone(),
            calibration: self.calibration.clone(),
            normal: self.normal.clone(),
        }
    }
}

/// Everything a calibration run needs, detached from the controller borrow.
struct CalibrationJob {
    transport: Arc<TunnelTransport>,
    motion: Arc<MotionPrimitives>,
    interlock: Arc<SafetyInterlock>,
    state: Arc<RwLock<ActuatorState>>,
    lock: Arc<Mutex<()>>,
    calibration: CalibrationConfig,
    normal: MotionConfig,
}

impl CalibrationJob {
    async fn run(
        self,
        speed: Option<i32>,
        state_tx: watch::Sender<HomingState>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<TravelEnvelope, CalibrationError> {
        let _running = self.lock.lock().await;

        if !self.transport.is_enabled() {
            return Err(CalibrationError::TransportUnavailable(
                "serial hub not enabled".to_string(),
            ));
        }

        {
            let mut state = self.state.write();
            state.envelope = None;
            state.last_known_position = None;
        }

        let homing = Homing::new(
            self.motion,
            self.interlock,
            self.calibration,
            self.normal,
            speed,
            state_tx,
            cancel_rx,
        );
        let outcome = homing.run().await?;

        let mut state = self.state.write();
        state.envelope = Some(outcome.envelope);
        state.last_known_position = outcome.final_position;
        Ok(outcome.envelope)
    }
}

/// Handle to a background calibration run.
pub struct CalibrationHandle {
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<HomingState>,
    task: JoinHandle<Result<TravelEnvelope, CalibrationError>>,
}

impl CalibrationHandle {
    /// Request cancellation. Takes effect at the next poll tick.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Current phase.
    pub fn state(&self) -> HomingState {
        *self.state_rx.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe(&self) -> watch::Receiver<HomingState> {
        self.state_rx.clone()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<TravelEnvelope, CalibrationError> {
        self.task
            .await
            .map_err(|e| CalibrationError::TaskFailed(e.to_string()))?
    }
}
