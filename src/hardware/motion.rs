//! Motion primitives: relative moves, stop, zero reference.
//!
//! Positive steps move "focus in", negative steps "focus out". None of these
//! consult the safety interlock; `FocusController::move_relative` does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::error::AppResult;
use crate::hardware::registers::RegisterAccess;
use crate::protocol::{registers, Frame};

/// Command used for one direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionCommand {
    /// Opcode carrying the move
    pub opcode: u8,
    /// Fixed value sent regardless of the requested magnitude
    #[serde(default)]
    pub fixed_value: Option<i32>,
}

/// How a signed step delta turns into a move frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DirectionEncoding {
    /// One opcode; the value field carries the signed delta.
    Signed {
        /// Move opcode
        opcode: u8,
    },
    /// Separate commands per direction; the value field carries the magnitude
    /// unless the command has a fixed value.
    PerDirection {
        /// Command for positive deltas
        positive: DirectionCommand,
        /// Command for negative deltas
        negative: DirectionCommand,
    },
}

impl Default for DirectionEncoding {
    fn default() -> Self {
        DirectionEncoding::Signed {
            opcode: registers::MOVE,
        }
    }
}

impl DirectionEncoding {
    /// Fixed-length jog preset: `+100000` in, `-100001` out.
    pub fn legacy_jog() -> Self {
        DirectionEncoding::PerDirection {
            positive: DirectionCommand {
                opcode: registers::MOVE,
                fixed_value: Some(100_000),
            },
            negative: DirectionCommand {
                opcode: registers::MOVE,
                fixed_value: Some(-100_001),
            },
        }
    }

    /// Signed travel the encoded frame drives for a request of `steps`.
    ///
    /// A command with a fixed value travels that magnitude in the requested
    /// direction, whatever was asked for.
    pub fn travel(&self, steps: i32) -> i64 {
        if steps == 0 {
            return 0;
        }
        match *self {
            DirectionEncoding::Signed { .. } => i64::from(steps),
            DirectionEncoding::PerDirection { positive, negative } => {
                let cmd = if steps > 0 { positive } else { negative };
                match cmd.fixed_value {
                    Some(fixed) => i64::from(fixed).abs() * i64::from(steps.signum()),
                    None => i64::from(steps),
                }
            }
        }
    }

    /// Opcode and value for a nonzero delta.
    fn encode(&self, steps: i32) -> (u8, i32) {
        match *self {
            DirectionEncoding::Signed { opcode } => (opcode, steps),
            DirectionEncoding::PerDirection { positive, negative } => {
                let cmd = if steps > 0 { positive } else { negative };
                let magnitude = steps.checked_abs().unwrap_or(i32::MAX);
                (cmd.opcode, cmd.fixed_value.unwrap_or(magnitude))
            }
        }
    }
}

/// Low-level motion commands.
pub struct MotionPrimitives {
    registers: Arc<RegisterAccess>,
    direction: DirectionEncoding,
    stop_frame: Frame,
    zero_frame: Frame,
}

impl MotionPrimitives {
    /// Build primitives from protocol settings.
    pub fn new(registers: Arc<RegisterAccess>, protocol: &ProtocolConfig) -> AppResult<Self> {
        Ok(Self {
            direction: protocol.direction,
            stop_frame: protocol.stop_frame()?,
            zero_frame: protocol.zero_frame()?,
            registers,
        })
    }

    /// Register access shared with the rest of the controller.
    pub fn registers(&self) -> &Arc<RegisterAccess> {
        &self.registers
    }

    /// Frame for a relative move, or `None` for a zero delta.
    pub fn command_for(&self, steps: i32) -> Option<Frame> {
        if steps == 0 {
            return None;
        }
        let (opcode, value) = self.direction.encode(steps);
        Some(self.registers.frame(opcode, value))
    }

    /// Signed travel [`move_steps`](Self::move_steps) actually commands for
    /// `steps`. Differs from `steps` only under fixed-value encodings.
    pub fn effective_delta(&self, steps: i32) -> i64 {
        self.direction.travel(steps)
    }

    /// Issue a relative move without any safety checks.
    ///
    /// Returns the frame sent, or `None` when `steps` is zero and nothing went
    /// out on the wire.
    pub async fn move_steps(&self, steps: i32) -> AppResult<Option<Frame>> {
        let Some(frame) = self.command_for(steps) else {
            debug!("Zero-step move ignored");
            return Ok(None);
        };
        debug!(steps, frame = %frame, "Move command");
        self.registers.send_raw(&frame).await?;
        Ok(Some(frame))
    }

    /// Halt motion. Safe to repeat.
    pub async fn stop(&self) -> AppResult<()> {
        debug!(frame = %self.stop_frame, "Stop");
        self.registers.send_raw(&self.stop_frame).await.map(|_| ())
    }

    /// Make the current position the zero reference.
    ///
    /// Returns the position read back afterwards, if the controller answered.
    pub async fn set_zero(&self) -> AppResult<Option<i32>> {
        self.registers.send_raw(&self.zero_frame).await?;
        let position = self.registers.read_position().await;
        match position {
            Some(p) => info!(position = p, "Zero reference set"),
            None => warn!("Zero reference set; position readback unavailable"),
        }
        Ok(position)
    }
}
