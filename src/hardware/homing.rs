//! Homing / calibration state machine.
//!
//! Finds both mechanical limits by driving into them with stall detection
//! armed, establishes a zero reference and derives the travel envelope.
//!
//! ```text
//! Idle → ConfiguringStallGuard → SeekingMin → AtMin → SeekingMax → AtMax
//!      → SettingZero → RestoringSpeed → Calibrated
//! ```
//!
//! Any abort passes through `RestoringSpeed` and ends in `Idle`. The normal
//! speed and acceleration are written back exactly once per run, whatever
//! the outcome.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CalibrationConfig, MotionConfig};
use crate::error::{CalibrationError, TunnelError};
use crate::hardware::motion::MotionPrimitives;
use crate::hardware::safety::{SafetyInterlock, TravelEnvelope};

/// Phase of a calibration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HomingState {
    /// Not calibrating; also the state after an abort
    Idle,
    /// Enabling stall detection and writing the threshold
    ConfiguringStallGuard,
    /// Driving toward the negative limit
    SeekingMin,
    /// Negative limit captured
    AtMin,
    /// Driving toward the positive limit
    SeekingMax,
    /// Positive limit captured
    AtMax,
    /// Establishing the zero reference
    SettingZero,
    /// Writing back normal speed and acceleration
    RestoringSpeed,
    /// Envelope established
    Calibrated,
}

/// Which position becomes zero after both limits are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroReference {
    /// Drive back to the negative limit and zero there
    #[default]
    Min,
    /// Zero at the positive limit, where the actuator stands after seeking
    Max,
    /// Leave the zero register alone; envelope stays in raw coordinates
    Raw,
}

/// Result of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomingOutcome {
    /// Envelope in zero-referenced coordinates
    pub envelope: TravelEnvelope,
    /// Raw position at the negative limit
    pub min_raw: i32,
    /// Raw position at the positive limit
    pub max_raw: i32,
    /// Position read back after the zero step
    pub final_position: Option<i32>,
}

/// One calibration run.
pub struct Homing {
    motion: Arc<MotionPrimitives>,
    interlock: Arc<SafetyInterlock>,
    calibration: CalibrationConfig,
    normal: MotionConfig,
    speed: i32,
    state_tx: watch::Sender<HomingState>,
    cancel_rx: watch::Receiver<bool>,
}

impl Homing {
    /// Prepare a run. `speed` overrides the configured calibration speed.
    pub fn new(
        motion: Arc<MotionPrimitives>,
        interlock: Arc<SafetyInterlock>,
        calibration: CalibrationConfig,
        normal: MotionConfig,
        speed: Option<i32>,
        state_tx: watch::Sender<HomingState>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let speed = speed.unwrap_or(calibration.speed);
        Self {
            motion,
            interlock,
            calibration,
            normal,
            speed,
            state_tx,
            cancel_rx,
        }
    }

    /// Current phase.
    pub fn state(&self) -> HomingState {
        *self.state_tx.borrow()
    }

    /// Execute the full sequence.
    pub async fn run(&self) -> Result<HomingOutcome, CalibrationError> {
        info!(
            speed = self.speed,
            acceleration = self.calibration.acceleration,
            threshold = self.calibration.stall_threshold,
            "Calibration started"
        );

        let result = self.run_phases().await;

        self.set_state(HomingState::RestoringSpeed);
        self.restore_speed().await;

        match result {
            Ok(outcome) => {
                self.set_state(HomingState::Calibrated);
                info!(
                    min = outcome.envelope.min,
                    max = outcome.envelope.max,
                    "Calibration complete"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.set_state(HomingState::Idle);
                warn!(error = %e, "Calibration aborted");
                Err(e)
            }
        }
    }

    async fn run_phases(&self) -> Result<HomingOutcome, CalibrationError> {
        let registers = self.motion.registers();

        self.set_state(HomingState::ConfiguringStallGuard);
        self.ensure_not_cancelled()?;
        registers.enable_stall_guard().await.map_err(unavailable)?;
        registers
            .write_stall_threshold(self.calibration.stall_threshold)
            .await
            .map_err(unavailable)?;
        registers.commit_stall_guard().await.map_err(unavailable)?;

        registers.write_speed(self.speed).await.map_err(unavailable)?;
        registers
            .write_acceleration(self.calibration.acceleration)
            .await
            .map_err(unavailable)?;

        let seek = self.calibration.seek_steps;
        let min_raw = self.seek(HomingState::SeekingMin, -seek).await?;
        self.set_state(HomingState::AtMin);
        info!(position = min_raw, "MIN limit found");

        let max_raw = self.seek(HomingState::SeekingMax, seek).await?;
        self.set_state(HomingState::AtMax);
        info!(position = max_raw, "MAX limit found");

        self.set_state(HomingState::SettingZero);
        let (zero, final_position) = match self.calibration.zero_reference {
            ZeroReference::Raw => (0, Some(max_raw)),
            ZeroReference::Max => {
                let readback = self.motion.set_zero().await.map_err(unavailable)?;
                (max_raw, readback)
            }
            ZeroReference::Min => {
                let back_at_min = self.seek(HomingState::SettingZero, -seek).await?;
                let readback = self.motion.set_zero().await.map_err(unavailable)?;
                (back_at_min, readback)
            }
        };

        let envelope = TravelEnvelope::spanning(
            min_raw.saturating_sub(zero),
            max_raw.saturating_sub(zero),
        );
        Ok(HomingOutcome {
            envelope,
            min_raw,
            max_raw,
            final_position,
        })
    }

    /// Drive toward a limit until stalled and return the raw position there.
    async fn seek(&self, phase: HomingState, steps: i32) -> Result<i32, CalibrationError> {
        self.set_state(phase);
        self.ensure_not_cancelled()?;

        if self.interlock.check_sensor().await.is_err() {
            return Err(CalibrationError::MotionBlocked { phase });
        }

        self.motion.stop().await.map_err(unavailable)?;
        self.motion.move_steps(steps).await.map_err(unavailable)?;

        let registers = self.motion.registers();
        let interval = self.calibration.poll_interval();
        let mut polls = 0u32;
        loop {
            if self.is_cancelled() {
                self.halt().await;
                return Err(CalibrationError::Cancelled { phase });
            }
            if polls >= self.calibration.max_polls {
                self.halt().await;
                return Err(CalibrationError::Timeout { phase, polls });
            }
            tokio::time::sleep(interval).await;
            polls += 1;
            if registers.read_stall_flag().await {
                debug!(?phase, polls, "Stall detected");
                break;
            }
        }

        self.motion.stop().await.map_err(unavailable)?;
        self.read_limit_position(phase).await
    }

    async fn read_limit_position(&self, phase: HomingState) -> Result<i32, CalibrationError> {
        let attempts = self.calibration.position_read_attempts;
        for attempt in 1..=attempts {
            if let Some(position) = self.motion.registers().read_position().await {
                return Ok(position);
            }
            debug!(?phase, attempt, "Position read failed at limit");
            if attempt < attempts {
                tokio::time::sleep(self.calibration.poll_interval()).await;
            }
        }
        Err(CalibrationError::PositionUnavailable { phase, attempts })
    }

    async fn restore_speed(&self) {
        let registers = self.motion.registers();
        if let Err(e) = registers.write_speed(self.normal.normal_speed).await {
            warn!(error = %e, "Failed to restore normal speed");
        }
        if let Err(e) = registers
            .write_acceleration(self.normal.normal_acceleration)
            .await
        {
            warn!(error = %e, "Failed to restore normal acceleration");
        }
    }

    async fn halt(&self) {
        if let Err(e) = self.motion.stop().await {
            warn!(error = %e, "Stop failed during calibration abort");
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn ensure_not_cancelled(&self) -> Result<(), CalibrationError> {
        if self.is_cancelled() {
            return Err(CalibrationError::Cancelled {
                phase: self.state(),
            });
        }
        Ok(())
    }

    fn set_state(&self, state: HomingState) {
        debug!(?state, "Homing state");
        self.state_tx.send_replace(state);
    }
}

fn unavailable(e: TunnelError) -> CalibrationError {
    CalibrationError::TransportUnavailable(e.to_string())
}
