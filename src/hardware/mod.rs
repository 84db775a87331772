//! Actuator Hardware Layer
//!
//! Everything between the camera's serial hub and the focus motor, bottom-up:
//! tunnel transport, typed register access, motion primitives, the safety
//! interlock, the homing state machine and the controller facade.

pub mod capabilities;
pub mod controller;
pub mod homing;
pub mod mock;
pub mod motion;
pub mod registers;
pub mod safety;
pub mod transport;

pub use capabilities::CameraFeatures;
pub use controller::{ActuatorState, CalibrationHandle, FocusController, MoveReport, StallSeek};
pub use homing::{HomingState, ZeroReference};
pub use motion::{DirectionCommand, DirectionEncoding, MotionPrimitives};
pub use safety::{SafetyInterlock, TravelEnvelope};
pub use transport::TunnelTransport;
