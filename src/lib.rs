//! # Stepper Tunnel
//!
//! Control of a stepper-motor focus actuator whose motion controller is
//! reachable only through a camera's serial-hub feature: command frames are
//! written into one camera register and replies read back from another.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: the fixed 8-byte command frame, reply decoding and the
//!   register map.
//! - **`hardware`**: tunnel transport, register access, motion primitives,
//!   safety interlock, homing state machine, the `FocusController` facade and
//!   a simulated camera.
//! - **`session`**: named test scenarios and the summary CSV.
//! - **`config`**: figment-backed configuration (TOML + environment).
//! - **`tracing_setup`**: structured logging initialization.
//! - **`error`**: `TunnelError` and the narrower error enums.

pub mod config;
pub mod error;
pub mod hardware;
pub mod protocol;
pub mod session;
pub mod tracing_setup;

pub use error::{AppResult, TunnelError};
