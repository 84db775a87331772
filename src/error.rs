//! Custom error types for the actuator control layer.
//!
//! This module defines the primary error type, `TunnelError`, together with the
//! narrower `FrameEncodeError` and `CalibrationError`. Using the `thiserror`
//! crate, it provides a consistent way to surface the conditions that can occur
//! between the host, the camera's serial tunnel and the motor controller.
//!
//! ## Error Hierarchy
//!
//! - **`FrameEncode`**: a command frame could not be built (opcode or value out of
//!   range, malformed hand-authored hex).
//! - **`TransportUnavailable`**: the serial hub is not enabled or the camera does
//!   not expose the tunnel accessors. Non-fatal; the operation is aborted.
//! - **`NoReply`** / **`MalformedReply`**: the exchange completed but produced no
//!   usable data. Callers treat these as "unknown", never as failure of a
//!   polling loop.
//! - **`MotionBlocked`**: the safety interlock refused a move. Always surfaced.
//! - **`Calibration`**: the homing state machine aborted.
//!
//! No error raised here is ever escalated to a process crash; the binary decides
//! what to do with them.

use thiserror::Error;

use crate::hardware::homing::HomingState;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TunnelError>;

/// Failure to build a command frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameEncodeError {
    /// Opcode does not fit in a single byte.
    #[error("Opcode {0:#x} does not fit in one byte")]
    OpcodeOutOfRange(u32),

    /// Value does not fit in the signed 32-bit value field.
    #[error("Value {0} does not fit in a signed 32-bit field")]
    ValueOutOfRange(i64),

    /// Hand-authored frame is not valid hexadecimal.
    #[error("Invalid hex frame '{0}'")]
    InvalidHex(String),

    /// Hand-authored frame has the wrong number of bytes.
    #[error("Frame must be exactly 8 bytes, got {0}")]
    InvalidLength(usize),
}

/// Why the safety interlock refused a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The optical break-beam reports an obstruction.
    OpticalSensor,
    /// The target lies outside the calibrated travel envelope.
    OutsideEnvelope {
        /// Requested absolute target
        target: i64,
        /// Envelope lower bound
        min: i32,
        /// Envelope upper bound
        max: i32,
    },
    /// An envelope exists but the current position could not be determined.
    PositionUnknown,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::OpticalSensor => write!(f, "optical sensor blocked"),
            BlockReason::OutsideEnvelope { target, min, max } => {
                write!(f, "target {} outside safe range [{}, {}]", target, min, max)
            }
            BlockReason::PositionUnknown => write!(f, "current position unknown"),
        }
    }
}

/// Reasons the homing/calibration run aborted.
///
/// Whatever the variant, the normal speed and acceleration registers have been
/// written back before this error is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    /// Stall was never reported within the polling bound.
    #[error("Calibration timed out in {phase:?} after {polls} polls without a stall")]
    Timeout {
        /// Phase that was polling
        phase: HomingState,
        /// Number of polls performed
        polls: u32,
    },

    /// Caller requested cancellation.
    #[error("Calibration cancelled during {phase:?}")]
    Cancelled {
        /// Phase at cancellation
        phase: HomingState,
    },

    /// Position could not be read at a limit after the bounded attempts.
    #[error("No usable position reply in {phase:?} after {attempts} attempts")]
    PositionUnavailable {
        /// Phase that needed the position
        phase: HomingState,
        /// Attempts made
        attempts: u32,
    },

    /// Optical sensor blocked the seek.
    #[error("Optical sensor blocked motion during {phase:?}")]
    MotionBlocked {
        /// Phase that was about to move
        phase: HomingState,
    },

    /// The tunnel is not usable.
    #[error("Serial tunnel unavailable: {0}")]
    TransportUnavailable(String),

    /// The background calibration task ended without a result.
    #[error("Calibration task failed: {0}")]
    TaskFailed(String),
}

/// Primary error type for the actuator control layer.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Frame construction failed.
    #[error("Frame encode error: {0}")]
    FrameEncode(#[from] FrameEncodeError),

    /// Serial hub disabled or tunnel accessors missing.
    ///
    /// **Recovery Strategy**: call `enable_hub()` or check the camera connection.
    #[error("Serial tunnel unavailable: {0}")]
    TransportUnavailable(String),

    /// Write succeeded but the read register was empty.
    #[error("No reply from motor controller")]
    NoReply,

    /// Reply too short to decode the requested field.
    #[error("Malformed reply ({len} bytes)")]
    MalformedReply {
        /// Reply length in bytes
        len: usize,
    },

    /// Safety interlock refused the move; no frame was sent.
    #[error("Motion blocked: {0}")]
    MotionBlocked(BlockReason),

    /// Homing aborted.
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Configuration values failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session summary could not be written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl TunnelError {
    /// True for the "unknown" outcomes that polling loops tolerate.
    pub fn is_transient(&self) -> bool {
        matches!(self, TunnelError::NoReply | TunnelError::MalformedReply { .. })
    }
}

impl From<figment::Error> for TunnelError {
    fn from(value: figment::Error) -> Self {
        TunnelError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::TransportUnavailable("SerialTxData missing".to_string());
        assert_eq!(
            err.to_string(),
            "Serial tunnel unavailable: SerialTxData missing"
        );
    }

    #[test]
    fn test_motion_blocked_display() {
        let err = TunnelError::MotionBlocked(BlockReason::OutsideEnvelope {
            target: 1100,
            min: -1000,
            max: 1000,
        });
        assert!(err
            .to_string()
            .contains("target 1100 outside safe range [-1000, 1000]"));
    }

    #[test]
    fn test_calibration_error_converts() {
        let err: TunnelError = CalibrationError::Timeout {
            phase: HomingState::SeekingMax,
            polls: 10,
        }
        .into();
        assert!(matches!(err, TunnelError::Calibration(_)));
        assert!(err.to_string().contains("SeekingMax"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(TunnelError::NoReply.is_transient());
        assert!(TunnelError::MalformedReply { len: 3 }.is_transient());
        assert!(!TunnelError::MotionBlocked(BlockReason::OpticalSensor).is_transient());
    }
}
