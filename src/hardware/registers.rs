//! Typed register access over the tunnel.
//!
//! Each operation is one request/response round trip. Reads decode the
//! reply; writes drain it. A missing or short reply is "unknown", never an
//! error, so polling loops keep running through a flaky tunnel.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::ProtocolConfig;
use crate::error::{AppResult, TunnelError};
use crate::hardware::transport::TunnelTransport;
use crate::protocol::{registers, ChecksumMode, Frame, Reply};

/// Register-level view of the motor controller.
pub struct RegisterAccess {
    transport: Arc<TunnelTransport>,
    checksum: ChecksumMode,
    position_opcode: u8,
    status_opcode: u8,
}

impl RegisterAccess {
    /// Build register access from protocol settings.
    pub fn new(transport: Arc<TunnelTransport>, protocol: &ProtocolConfig) -> Self {
        Self {
            transport,
            checksum: protocol.checksum,
            position_opcode: protocol.position_read_opcode,
            status_opcode: protocol.stall_status_opcode,
        }
    }

    /// Shared transport.
    pub fn transport(&self) -> &Arc<TunnelTransport> {
        &self.transport
    }

    /// Checksum formula used for computed frames.
    pub fn checksum_mode(&self) -> ChecksumMode {
        self.checksum
    }

    /// Frame for `opcode` carrying `value`, using the configured checksum.
    pub fn frame(&self, opcode: u8, value: i32) -> Frame {
        Frame::new(opcode, value, self.checksum)
    }

    /// Current position.
    ///
    /// Fails with `NoReply` when nothing came back and `MalformedReply` when
    /// the reply is too short to carry a value.
    pub async fn try_read_position(&self) -> AppResult<i32> {
        let reply = self
            .transport
            .try_send(&self.frame(self.position_opcode, 0))
            .await?;
        reply.position().ok_or_else(|| {
            debug!(len = reply.len(), reply = %reply.to_hex(), "Position reply too short");
            TunnelError::MalformedReply { len: reply.len() }
        })
    }

    /// Current position, or `None` when it could not be read.
    pub async fn read_position(&self) -> Option<i32> {
        match self.try_read_position().await {
            Ok(position) => Some(position),
            Err(e) if e.is_transient() => {
                debug!(error = %e, "Position unknown");
                None
            }
            Err(e) => {
                warn!(error = %e, "Position read failed");
                None
            }
        }
    }

    /// Whether the driver reports a stall. Unknown reads as `false`.
    pub async fn read_stall_flag(&self) -> bool {
        let frame = self.frame(self.status_opcode, 0);
        let stalled = self
            .transport
            .send(&frame)
            .await
            .and_then(|reply| reply.stall_flag())
            .unwrap_or(false);
        trace!(stalled, "Stall flag polled");
        stalled
    }

    /// Write the speed register.
    pub async fn write_speed(&self, speed: i32) -> AppResult<()> {
        self.write_register(registers::SPEED, speed).await
    }

    /// Write the acceleration register.
    pub async fn write_acceleration(&self, acceleration: i32) -> AppResult<()> {
        self.write_register(registers::ACCELERATION, acceleration).await
    }

    /// Write the stall threshold pair `[0, t, 0, t]`.
    pub async fn write_stall_threshold(&self, threshold: u8) -> AppResult<()> {
        let frame = Frame::with_value_bytes(
            registers::STALL_THRESHOLD,
            [0, threshold, 0, threshold],
            self.checksum,
        );
        self.send_raw(&frame).await.map(|_| ())
    }

    /// Enable stall detection.
    pub async fn enable_stall_guard(&self) -> AppResult<()> {
        self.write_register(registers::STALL_ENABLE, 0).await
    }

    /// Commit the stall detection settings.
    pub async fn commit_stall_guard(&self) -> AppResult<()> {
        self.write_register(registers::STALL_COMMIT, 0).await
    }

    /// Write an arbitrary register.
    pub async fn write_register(&self, opcode: u8, value: i32) -> AppResult<()> {
        debug!(register = registers::name(opcode), value, "Register write");
        self.send_raw(&self.frame(opcode, value)).await.map(|_| ())
    }

    /// Send a prebuilt frame and return whatever came back.
    ///
    /// Only an unavailable transport is an error; an empty or short reply is
    /// `Ok(None)`.
    pub async fn send_raw(&self, frame: &Frame) -> AppResult<Option<Reply>> {
        match self.transport.try_send(frame).await {
            Ok(reply) => Ok(Some(reply)),
            Err(e) if e.is_transient() => {
                debug!(frame = %frame, "Write drained without reply");
                Ok(None)
            }
            Err(e @ TunnelError::TransportUnavailable(_)) => Err(e),
            Err(e) => {
                debug!(frame = %frame, error = %e, "Write reply ignored");
                Ok(None)
            }
        }
    }
}
