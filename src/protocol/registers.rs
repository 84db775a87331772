//! Register map of the motor controller as seen through the tunnel.
//!
//! Opcodes with bit 7 set are writes. The constant frames below were authored by
//! hand against the reference hardware and are sent verbatim; their checksum
//! bytes do not follow either computed formula.

/// Ramp mode select.
pub const RAMP_MODE: u8 = 0xA0;
/// Write the actual position register (used to set the zero reference).
pub const POSITION_WRITE: u8 = 0xA1;
/// Read the actual position register.
pub const POSITION_READ: u8 = 0x21;
/// Ramp speed.
pub const SPEED: u8 = 0xA4;
/// Ramp acceleration.
pub const ACCELERATION: u8 = 0xA5;
/// Move command.
pub const MOVE: u8 = 0xAD;
/// Stall detection enable.
pub const STALL_ENABLE: u8 = 0xB0;
/// Stall detection threshold pair.
pub const STALL_THRESHOLD: u8 = 0xB1;
/// Stall detection commit.
pub const STALL_COMMIT: u8 = 0xB2;
/// Driver status, carries the stall flag in byte 3.
pub const DRIVER_STATUS: u8 = 0x6B;

/// Halt motion.
pub const STOP_FRAME: &str = "0500AD0000000007";
/// Write zero into the actual position register.
pub const ZERO_FRAME: &str = "0500A10000000051";
/// Fixed jog forward ("focus in").
pub const JOG_FORWARD_FRAME: &str = "0500AD000186A0F7";
/// Fixed jog backward ("focus out").
pub const JOG_BACKWARD_FRAME: &str = "0500ADFFFE795F29";

/// Driver and ramp setup sent before a test session.
pub const INIT_SEQUENCE: &[&str] = &[
    "050080000000066E",
    "0500EC000100C318",
    "05009000061405FA",
    "0500910000000A70",
    "050093000003E887",
    "0500F0000401C897",
    "0500A4000003E82A",
    "0500A50000C350D1",
    "0500A60000C3508E",
    "0500A70000C35019",
    "0500A80000C35010",
    "0500AA0000C350D8",
    "0500AB0000000AE6",
    "0500B40000000F65",
    "0500A000000000C6",
];

/// Stop, then zero the position register.
pub const RESET_SEQUENCE: &[&str] = &[STOP_FRAME, ZERO_FRAME];

/// Human-readable register name for logs.
pub fn name(opcode: u8) -> &'static str {
    match opcode {
        RAMP_MODE => "RAMP_MODE",
        POSITION_WRITE => "POSITION_WRITE",
        POSITION_READ => "POSITION_READ",
        SPEED => "SPEED",
        ACCELERATION => "ACCELERATION",
        MOVE => "MOVE",
        STALL_ENABLE => "STALL_ENABLE",
        STALL_THRESHOLD => "STALL_THRESHOLD",
        STALL_COMMIT => "STALL_COMMIT",
        DRIVER_STATUS => "DRIVER_STATUS",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;

    #[test]
    fn test_constant_frames_parse() {
        for hex in INIT_SEQUENCE.iter().chain(RESET_SEQUENCE) {
            assert!(Frame::from_hex(hex).is_ok(), "bad constant {}", hex);
        }
        assert_eq!(Frame::from_hex(JOG_FORWARD_FRAME).unwrap().value(), 100_000);
        assert_eq!(Frame::from_hex(JOG_BACKWARD_FRAME).unwrap().value(), -100_001);
    }

    #[test]
    fn test_constant_opcodes_match_register_map() {
        assert_eq!(Frame::from_hex(STOP_FRAME).unwrap().opcode(), MOVE);
        assert_eq!(Frame::from_hex(ZERO_FRAME).unwrap().opcode(), POSITION_WRITE);
        assert_eq!(name(SPEED), "SPEED");
        assert_eq!(name(0x01), "UNKNOWN");
    }
}
