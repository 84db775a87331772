//! Camera Capabilities
//!
//! The actuator is not wired to the host directly. Its motor controller sits
//! behind a camera's serial-hub feature, so everything the controller needs
//! from the camera is expressed as one small capability trait, `CameraFeatures`.
//! The camera binding (discovery, connection lifecycle, image acquisition)
//! lives outside this crate and only has to implement this trait.
//!
//! # Design
//!
//! - Async (uses `#[async_trait]`)
//! - Thread-safe (requires `Send + Sync`)
//! - Accessors that the SDK may not expose return `bool`/`Option` instead of
//!   failing, so the controller can degrade rather than abort
//!
//! # Example
//!
//! ```rust,ignore
//! struct VendorCamera { handle: sdk::Camera }
//!
//! #[async_trait]
//! impl CameraFeatures for VendorCamera {
//!     async fn enable_serial_tunnel(&self) -> bool {
//!         self.handle.set_bool("SerialHubEnable", true).is_ok()
//!     }
//!     // ...
//! }
//! ```

use async_trait::async_trait;
use bytes::Bytes;

/// Capability: Serial tunnel and digital inputs of a connected camera
///
/// # Contract
/// - `write_tunnel_bytes` pushes one frame into the transmit register
/// - `read_tunnel_bytes` returns whatever the receive register currently holds;
///   `None` or an empty buffer means nothing arrived
/// - `read_digital_input` returns `None` when the named feature does not exist
///   or cannot be read
///
/// # Thread Safety
/// All methods take `&self`. Implementations use interior mutability. Callers
/// never issue two tunnel exchanges concurrently; the transport serializes them.
#[async_trait]
pub trait CameraFeatures: Send + Sync {
    /// Turn on the serial hub. Returns `false` if the feature is missing or
    /// the write was rejected.
    async fn enable_serial_tunnel(&self) -> bool;

    /// Set the transmit buffer size. Returns `false` if unsupported.
    async fn set_tunnel_frame_size(&self, size: u32) -> bool;

    /// Write raw bytes into the transmit register.
    async fn write_tunnel_bytes(&self, bytes: &[u8]) -> anyhow::Result<()>;

    /// Read the receive register once.
    async fn read_tunnel_bytes(&self) -> Option<Bytes>;

    /// Read a named boolean digital input.
    async fn read_digital_input(&self, name: &str) -> Option<bool>;

    /// Model and identifier for banners and logs.
    fn describe(&self) -> String {
        "camera".to_string()
    }
}
