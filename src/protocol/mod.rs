//! Binary command protocol spoken to the motor controller.

pub mod frame;
pub mod registers;

pub use frame::{ChecksumMode, Frame, FrameSpec, ParsedReply, Reply, FRAME_LEN};
