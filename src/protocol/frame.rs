//! Binary command frames and controller replies.
//!
//! Every command travelling through the tunnel is a fixed 8-byte frame:
//!
//! ```text
//! ┌─────────┬──────────┬────────┬──────────────────────┬──────────┐
//! │ address │ reserved │ opcode │ value (i32, BE)      │ checksum │
//! │  0x05   │   0x00   │   u8   │ 4 bytes              │    u8    │
//! └─────────┴──────────┴────────┴──────────────────────┴──────────┘
//! ```
//!
//! Two checksum formulas are in use by the device tooling and they disagree;
//! hand-authored constant frames match neither. Checksums are therefore computed
//! when a frame is built from a value, but never used to reject a reply.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FrameEncodeError;

/// Length of every command and full reply frame.
pub const FRAME_LEN: usize = 8;
/// Fixed controller address byte.
pub const FRAME_ADDRESS: u8 = 0x05;
/// Fixed reserved byte.
pub const FRAME_RESERVED: u8 = 0x00;
/// Seed added to the value bytes by [`ChecksumMode::ValueSum`].
pub const VALUE_SUM_SEED: u8 = 0x05;
/// Offset of the first value byte.
pub const VALUE_OFFSET: usize = 3;
/// Offset of the stall flag in a status reply.
pub const FLAG_OFFSET: usize = 3;

/// Checksum formula applied when building a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumMode {
    /// Sum of the seven preceding bytes, modulo 256.
    RunningSum,
    /// 0x05 plus the four value bytes, modulo 256.
    #[default]
    ValueSum,
}

impl ChecksumMode {
    /// Compute the checksum over the first seven bytes of a frame.
    pub fn compute(self, head: &[u8; FRAME_LEN - 1]) -> u8 {
        match self {
            ChecksumMode::RunningSum => head.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)),
            ChecksumMode::ValueSum => head[VALUE_OFFSET..]
                .iter()
                .fold(VALUE_SUM_SEED, |acc, &b| acc.wrapping_add(b)),
        }
    }
}

/// An immutable 8-byte command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    bytes: [u8; FRAME_LEN],
}

impl Frame {
    /// Build a frame from an opcode and signed value.
    pub fn new(opcode: u8, value: i32, mode: ChecksumMode) -> Self {
        let v = value.to_be_bytes();
        let head = [FRAME_ADDRESS, FRAME_RESERVED, opcode, v[0], v[1], v[2], v[3]];
        let checksum = mode.compute(&head);
        Self {
            bytes: [head[0], head[1], head[2], head[3], head[4], head[5], head[6], checksum],
        }
    }

    /// Build a frame from unchecked caller input.
    ///
    /// Fails when the opcode does not fit in a byte or the value does not fit
    /// in a signed 32-bit field.
    pub fn build(opcode: u32, value: i64, mode: ChecksumMode) -> Result<Self, FrameEncodeError> {
        let opcode = u8::try_from(opcode).map_err(|_| FrameEncodeError::OpcodeOutOfRange(opcode))?;
        let value = i32::try_from(value).map_err(|_| FrameEncodeError::ValueOutOfRange(value))?;
        Ok(Self::new(opcode, value, mode))
    }

    /// Build a frame carrying four raw value bytes.
    pub fn with_value_bytes(opcode: u8, value: [u8; 4], mode: ChecksumMode) -> Self {
        Self::new(opcode, i32::from_be_bytes(value), mode)
    }

    /// Wrap eight raw bytes as received, checksum included.
    pub fn from_bytes(bytes: [u8; FRAME_LEN]) -> Self {
        Self { bytes }
    }

    /// Accept a hand-authored frame verbatim, including its checksum byte.
    ///
    /// Whitespace is ignored, so `"0500 AD00 0000 0007"` is accepted.
    pub fn from_hex(hex: &str) -> Result<Self, FrameEncodeError> {
        let digits: String = hex.chars().filter(|c| !c.is_whitespace()).collect();
        if digits.len() % 2 != 0 || !digits.is_ascii() {
            return Err(FrameEncodeError::InvalidHex(hex.to_string()));
        }

        let mut decoded = Vec::with_capacity(digits.len() / 2);
        for pair in digits.as_bytes().chunks(2) {
            let text = std::str::from_utf8(pair)
                .map_err(|_| FrameEncodeError::InvalidHex(hex.to_string()))?;
            let byte = u8::from_str_radix(text, 16)
                .map_err(|_| FrameEncodeError::InvalidHex(hex.to_string()))?;
            decoded.push(byte);
        }

        let bytes: [u8; FRAME_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| FrameEncodeError::InvalidLength(decoded.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Wire representation.
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.bytes
    }

    /// Opcode byte.
    pub fn opcode(&self) -> u8 {
        self.bytes[2]
    }

    /// Signed value field.
    pub fn value(&self) -> i32 {
        i32::from_be_bytes([self.bytes[3], self.bytes[4], self.bytes[5], self.bytes[6]])
    }

    /// Checksum byte as carried by the frame.
    pub fn checksum(&self) -> u8 {
        self.bytes[7]
    }

    /// Whether the carried checksum agrees with `mode`. Informational only.
    pub fn checksum_matches(&self, mode: ChecksumMode) -> bool {
        mode.compute(&head_of(&self.bytes)) == self.checksum()
    }

    /// Uppercase hex rendering for logs.
    pub fn to_hex(&self) -> String {
        to_hex(&self.bytes)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A configured command: either verbatim hex or a register write whose
/// checksum is computed.
///
/// In TOML: `"0500AD0000000007"` or `{ opcode = 0xA5, value = 1000 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameSpec {
    /// Hand-authored frame, sent as written
    Hex(String),
    /// Register write built from an opcode and value
    Register {
        /// Opcode, must fit in one byte
        opcode: u32,
        /// Value, must fit in a signed 32-bit field
        value: i64,
    },
}

impl FrameSpec {
    /// Encode into a wire frame, computing the checksum with `mode` for
    /// register writes.
    pub fn to_frame(&self, mode: ChecksumMode) -> Result<Frame, FrameEncodeError> {
        match self {
            FrameSpec::Hex(hex) => Frame::from_hex(hex),
            FrameSpec::Register { opcode, value } => Frame::build(*opcode, *value, mode),
        }
    }
}

impl From<&str> for FrameSpec {
    fn from(hex: &str) -> Self {
        FrameSpec::Hex(hex.to_string())
    }
}

/// Raw bytes read back from the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    bytes: Bytes,
}

/// Decoded fields of a full-length reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply {
    /// Echoed address byte
    pub address: u8,
    /// Echoed reserved byte
    pub reserved: u8,
    /// Echoed opcode
    pub opcode: u8,
    /// Big-endian value bytes
    pub value_bytes: [u8; 4],
    /// Status flag byte
    pub flag_byte: u8,
    /// Checksum byte as received
    pub checksum: u8,
}

impl ParsedReply {
    /// Signed value decoded from the value bytes.
    pub fn value(&self) -> i32 {
        i32::from_be_bytes(self.value_bytes)
    }

    /// Whether the received checksum agrees with `mode`. Informational only.
    pub fn checksum_matches(&self, mode: ChecksumMode) -> bool {
        let v = self.value_bytes;
        let head = [self.address, self.reserved, self.opcode, v[0], v[1], v[2], v[3]];
        mode.compute(&head) == self.checksum
    }
}

impl Reply {
    /// Wrap raw reply bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes received.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the read register returned zero bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the echoed fields. Replies shorter than a full frame yield `None`.
    pub fn parse(&self) -> Option<ParsedReply> {
        let b = self.bytes.get(..FRAME_LEN)?;
        let parsed = ParsedReply {
            address: b[0],
            reserved: b[1],
            opcode: b[2],
            value_bytes: [b[3], b[4], b[5], b[6]],
            flag_byte: b[FLAG_OFFSET],
            checksum: b[7],
        };
        if !parsed.checksum_matches(ChecksumMode::RunningSum)
            && !parsed.checksum_matches(ChecksumMode::ValueSum)
        {
            debug!(reply = %self.to_hex(), "Reply checksum matches neither formula; decoding anyway");
        }
        Some(parsed)
    }

    /// Signed position from bytes 3..7, or `None` for a short reply.
    pub fn position(&self) -> Option<i32> {
        self.parse().map(|p| p.value())
    }

    /// Stall flag from byte 3, or `None` for a short reply.
    pub fn stall_flag(&self) -> Option<bool> {
        self.parse().map(|p| p.flag_byte != 0)
    }

    /// Uppercase hex rendering for logs.
    pub fn to_hex(&self) -> String {
        to_hex(&self.bytes)
    }
}

fn head_of(bytes: &[u8; FRAME_LEN]) -> [u8; FRAME_LEN - 1] {
    [bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6]]
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_spec_computes_checksum() {
        let spec = FrameSpec::Register {
            opcode: 0xA5,
            value: 1000,
        };
        let frame = spec.to_frame(ChecksumMode::ValueSum).unwrap();
        assert_eq!(frame, Frame::new(0xA5, 1000, ChecksumMode::ValueSum));
        assert!(frame.checksum_matches(ChecksumMode::ValueSum));
    }

    #[test]
    fn test_register_spec_out_of_range() {
        let wide_opcode = FrameSpec::Register {
            opcode: 0x1A5,
            value: 0,
        };
        assert_eq!(
            wide_opcode.to_frame(ChecksumMode::ValueSum),
            Err(FrameEncodeError::OpcodeOutOfRange(0x1A5))
        );

        let wide_value = FrameSpec::Register {
            opcode: 0xAD,
            value: i64::from(i32::MAX) + 1,
        };
        assert_eq!(
            wide_value.to_frame(ChecksumMode::ValueSum),
            Err(FrameEncodeError::ValueOutOfRange(i64::from(i32::MAX) + 1))
        );
    }

    #[test]
    fn test_hex_spec_is_verbatim() {
        let spec = FrameSpec::from("0500AD0000000007");
        let frame = spec.to_frame(ChecksumMode::RunningSum).unwrap();
        assert_eq!(frame.to_hex(), "0500AD0000000007");
    }

    #[test]
    fn test_value_field_round_trip() {
        for value in [0, 1, -1, 200, -100_000, 100_000, i32::MAX, i32::MIN] {
            for opcode in [0x00, 0x21, 0xAD, 0xFF] {
                let frame = Frame::new(opcode, value, ChecksumMode::ValueSum);
                let reply = Reply::new(frame.as_bytes().to_vec());
                assert_eq!(reply.position(), Some(value));
                assert_eq!(frame.value(), value);
                assert_eq!(frame.opcode(), opcode);
            }
        }
    }

    #[test]
    fn test_layout_is_big_endian() {
        let frame = Frame::new(0xAD, 100_000, ChecksumMode::ValueSum);
        assert_eq!(
            frame.as_bytes(),
            &[0x05, 0x00, 0xAD, 0x00, 0x01, 0x86, 0xA0, 0x2C]
        );
    }

    #[test]
    fn test_value_sum_checksum() {
        // 0x05 + 0x00 + 0x00 + 0x00 + 0xC8
        let frame = Frame::new(0xA4, 200, ChecksumMode::ValueSum);
        assert_eq!(frame.checksum(), 0xCD);

        // Negative values wrap byte-wise
        let frame = Frame::new(0xAD, -100_000, ChecksumMode::ValueSum);
        let expected = [0xFFu8, 0xFE, 0x79, 0x60]
            .iter()
            .fold(0x05u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(frame.checksum(), expected);
    }

    #[test]
    fn test_running_sum_checksum() {
        let frame = Frame::new(0x6B, 0, ChecksumMode::RunningSum);
        assert_eq!(frame.checksum(), 0x70);
        assert!(frame.checksum_matches(ChecksumMode::RunningSum));
        assert!(!frame.checksum_matches(ChecksumMode::ValueSum));
    }

    #[test]
    fn test_hand_authored_frames_keep_their_checksum() {
        let stop = Frame::from_hex("0500AD0000000007").unwrap();
        assert_eq!(stop.opcode(), 0xAD);
        assert_eq!(stop.value(), 0);
        assert_eq!(stop.checksum(), 0x07);
        assert!(!stop.checksum_matches(ChecksumMode::RunningSum));
        assert!(!stop.checksum_matches(ChecksumMode::ValueSum));
        assert_eq!(stop.to_hex(), "0500AD0000000007");

        let backward = Frame::from_hex("0500ADFFFE795F29").unwrap();
        assert_eq!(backward.value(), -100_001);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert_eq!(
            Frame::from_hex("0500AD00"),
            Err(FrameEncodeError::InvalidLength(4))
        );
        assert!(matches!(
            Frame::from_hex("0500ADZZ00000007"),
            Err(FrameEncodeError::InvalidHex(_))
        ));
        assert!(matches!(
            Frame::from_hex("0500AD000000000"),
            Err(FrameEncodeError::InvalidHex(_))
        ));
        assert!(Frame::from_hex("0500 AD00 0000 0007").is_ok());
    }

    #[test]
    fn test_build_range_checks() {
        assert_eq!(
            Frame::build(0x1AD, 0, ChecksumMode::ValueSum),
            Err(FrameEncodeError::OpcodeOutOfRange(0x1AD))
        );
        assert_eq!(
            Frame::build(0xAD, i64::from(i32::MAX) + 1, ChecksumMode::ValueSum),
            Err(FrameEncodeError::ValueOutOfRange(i64::from(i32::MAX) + 1))
        );
        let frame = Frame::build(0xAD, -5, ChecksumMode::RunningSum).unwrap();
        assert_eq!(frame.value(), -5);
    }

    #[test]
    fn test_short_reply_is_not_decoded() {
        let reply = Reply::new(vec![0x05, 0x00, 0x21]);
        assert_eq!(reply.parse(), None);
        assert_eq!(reply.position(), None);
        assert_eq!(reply.stall_flag(), None);

        let seven = Reply::new(vec![0x05, 0x00, 0x21, 0x00, 0x00, 0x00, 0x10]);
        assert_eq!(seven.position(), None);
    }

    #[test]
    fn test_bad_checksum_is_still_decoded() {
        let reply = Reply::new(vec![0x05, 0x00, 0x21, 0xFF, 0xFF, 0xEC, 0x78, 0x00]);
        assert_eq!(reply.position(), Some(-5000));
    }

    #[test]
    fn test_stall_flag_byte() {
        let stalled = Reply::new(vec![0x05, 0x00, 0x6B, 0x01, 0x00, 0x00, 0x00, 0x71]);
        assert_eq!(stalled.stall_flag(), Some(true));
        let clear = Reply::new(vec![0x05, 0x00, 0x6B, 0x00, 0x00, 0x00, 0x00, 0x70]);
        assert_eq!(clear.stall_flag(), Some(false));
    }

    #[test]
    fn test_longer_reply_uses_leading_frame() {
        let mut bytes = Frame::new(0x21, 42, ChecksumMode::RunningSum)
            .as_bytes()
            .to_vec();
        bytes.extend_from_slice(&[0u8; 120]);
        assert_eq!(Reply::new(bytes).position(), Some(42));
    }
}
