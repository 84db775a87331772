//! Serial tunnel transport
//!
//! Moves one command frame into the camera's transmit register, waits for the
//! motor controller to answer, and reads the receive register once.
//!
//! Protocol timing:
//! - Half-duplex request/response, no framing or flow control on the wire
//! - The controller needs a settling delay (default 200 ms) before its reply
//!   appears in the receive register
//! - An exchange is write + settle + read, held under one exclusive gate so a
//!   concurrent caller can never read another caller's reply

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{AppResult, TunnelError};
use crate::hardware::capabilities::CameraFeatures;
use crate::protocol::{Frame, Reply};

/// Exchange frames with the motor controller through the camera tunnel.
pub struct TunnelTransport {
    camera: Arc<dyn CameraFeatures>,
    /// Held for the whole write/settle/read transaction
    gate: Mutex<()>,
    enabled: AtomicBool,
    frame_size: u32,
    settle_delay: Duration,
}

impl TunnelTransport {
    /// Create a transport over `camera`. The hub starts disabled.
    pub fn new(camera: Arc<dyn CameraFeatures>, config: &TunnelConfig) -> Self {
        Self {
            camera,
            gate: Mutex::new(()),
            enabled: AtomicBool::new(false),
            frame_size: config.frame_size,
            settle_delay: config.settle_delay(),
        }
    }

    /// Underlying camera, for feature access outside the tunnel.
    pub fn camera(&self) -> &Arc<dyn CameraFeatures> {
        &self.camera
    }

    /// Whether the serial hub has been enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Settling delay applied between write and read.
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Enable the serial hub and size the transmit buffer.
    ///
    /// Returns `false` when the camera rejects the hub. A rejected buffer size
    /// is logged and ignored.
    pub async fn enable(&self) -> bool {
        let _guard = self.gate.lock().await;

        if !self.camera.enable_serial_tunnel().await {
            warn!(camera = %self.camera.describe(), "Serial hub could not be enabled");
            self.enabled.store(false, Ordering::Release);
            return false;
        }

        if !self.camera.set_tunnel_frame_size(self.frame_size).await {
            warn!(size = self.frame_size, "Camera rejected tunnel frame size");
        }

        self.enabled.store(true, Ordering::Release);
        info!(camera = %self.camera.describe(), "Serial hub enabled");
        true
    }

    /// Send one frame and return the reply.
    ///
    /// # Errors
    /// - `TransportUnavailable` if the hub is off or the write accessor fails
    /// - `NoReply` if the receive register is empty after the settle delay
    pub async fn try_send(&self, frame: &Frame) -> AppResult<Reply> {
        if !self.is_enabled() {
            return Err(TunnelError::TransportUnavailable(
                "serial hub not enabled".to_string(),
            ));
        }

        let _guard = self.gate.lock().await;

        debug!(frame = %frame, "Tunnel TX");
        self.camera
            .write_tunnel_bytes(frame.as_bytes())
            .await
            .map_err(|e| TunnelError::TransportUnavailable(e.to_string()))?;

        tokio::time::sleep(self.settle_delay).await;

        match self.camera.read_tunnel_bytes().await {
            Some(bytes) if !bytes.is_empty() => {
                let reply = Reply::new(bytes);
                debug!(reply = %reply.to_hex(), len = reply.len(), "Tunnel RX");
                Ok(reply)
            }
            _ => {
                debug!(frame = %frame, "Tunnel RX empty");
                Err(TunnelError::NoReply)
            }
        }
    }

    /// Send one frame, treating any failure as "no reply".
    pub async fn send(&self, frame: &Frame) -> Option<Reply> {
        match self.try_send(frame).await {
            Ok(reply) => Some(reply),
            Err(TunnelError::NoReply) => None,
            Err(e) => {
                warn!(frame = %frame, error = %e, "Tunnel exchange failed");
                None
            }
        }
    }
}
