//! # MCS Wire Format
//!
//! Tag table, varint32 and frame encoding for the MCS stream.
//!
//! ## Frame Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  first frame:   [version:1][tag:1][varint32 len][payload: len bytes]    │
//! │  later frames:             [tag:1][varint32 len][payload: len bytes]    │
//! │                                                                         │
//! │  The version byte appears once per direction, on the very first         │
//! │  frame. Both sides track "first frame seen" independently.              │
//! │                                                                         │
//! │  VARINT32                                                               │
//! │  ────────                                                               │
//! │  7-bit groups, least significant first, 0x80 = more bytes follow.       │
//! │  300  → [0xAC, 0x02]                                                    │
//! │  0    → [0x00]                                                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{CoreError, CoreResult};

// =============================================================================
// Constants
// =============================================================================

/// Protocol version sent on the first frame.
pub const MCS_VERSION: u8 = 41;

/// Older protocol version still accepted from the server.
pub const MCS_LEGACY_VERSION: u8 = 38;

/// Default MCS host.
pub const MCS_HOST: &str = "mtalk.google.com";

/// Default MCS port.
pub const MCS_PORT: u16 = 5228;

/// Upper bound for a single frame payload.
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Longest valid varint32 encoding.
const MAX_VARINT32_BYTES: usize = 5;

// =============================================================================
// Message Tags
// =============================================================================

/// Tag byte identifying the message kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum McsTag {
    HeartbeatPing = 0,
    HeartbeatAck = 1,
    LoginRequest = 2,
    LoginResponse = 3,
    Close = 4,
    MessageStanza = 5,
    PresenceStanza = 6,
    IqStanza = 7,
    DataMessageStanza = 8,
    BatchPresenceStanza = 9,
    StreamErrorStanza = 10,
    HttpRequest = 11,
    HttpResponse = 12,
    BindAccountRequest = 13,
    BindAccountResponse = 14,
    TalkMetadata = 15,
}

impl McsTag {
    /// Returns the tag byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for McsTag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => McsTag::HeartbeatPing,
            1 => McsTag::HeartbeatAck,
            2 => McsTag::LoginRequest,
            3 => McsTag::LoginResponse,
            4 => McsTag::Close,
            5 => McsTag::MessageStanza,
            6 => McsTag::PresenceStanza,
            7 => McsTag::IqStanza,
            8 => McsTag::DataMessageStanza,
            9 => McsTag::BatchPresenceStanza,
            10 => McsTag::StreamErrorStanza,
            11 => McsTag::HttpRequest,
            12 => McsTag::HttpResponse,
            13 => McsTag::BindAccountRequest,
            14 => McsTag::BindAccountResponse,
            15 => McsTag::TalkMetadata,
            other => return Err(other),
        })
    }
}

impl std::fmt::Display for McsTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// =============================================================================
// Varint32
// =============================================================================

/// Appends the varint32 encoding of `value` to `out`.
pub fn encode_varint32(mut value: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a varint32 from the front of `buf`.
///
/// Returns the value and the number of bytes consumed, or `None` if `buf`
/// ends before the varint does.
pub fn decode_varint32(buf: &[u8]) -> CoreResult<Option<(u32, usize)>> {
    let mut decoder = VarintDecoder::new();
    for (i, byte) in buf.iter().enumerate() {
        if let Some(value) = decoder.push(*byte)? {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Incremental varint32 decoder fed one byte at a time.
///
/// The stream reader pulls bytes off the socket and pushes them here until
/// a value is produced, so a length prefix split across TCP segments is
/// handled without buffering.
#[derive(Debug, Default, Clone)]
pub struct VarintDecoder {
    value: u32,
    count: usize,
}

impl VarintDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte. Returns `Some(value)` once the varint is complete.
    pub fn push(&mut self, byte: u8) -> CoreResult<Option<u32>> {
        if self.count >= MAX_VARINT32_BYTES {
            return Err(CoreError::VarintTooLong);
        }
        let shift = 7 * self.count as u32;
        // The fifth byte may only contribute the top four bits.
        let group = (byte & 0x7f) as u32;
        self.value |= group.checked_shl(shift).unwrap_or(0);
        self.count += 1;

        if byte & 0x80 == 0 {
            let value = self.value;
            self.reset();
            Ok(Some(value))
        } else if self.count == MAX_VARINT32_BYTES {
            Err(CoreError::VarintTooLong)
        } else {
            Ok(None)
        }
    }

    /// Discards any partial value.
    pub fn reset(&mut self) {
        self.value = 0;
        self.count = 0;
    }
}

// =============================================================================
// Frames
// =============================================================================

/// One undecoded frame read off the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Raw tag byte (may not map to a known [`McsTag`]).
    pub tag: u8,
    /// Serialized protobuf body.
    pub payload: Vec<u8>,
}

/// Encodes one frame, prefixing the version byte when `with_version` is set.
pub fn encode_frame(tag: McsTag, payload: &[u8], with_version: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 7);
    if with_version {
        out.push(MCS_VERSION);
    }
    out.push(tag.as_u8());
    encode_varint32(payload.len() as u32, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Validates the version byte the server sent on its first frame.
pub fn check_version(version: u8) -> CoreResult<()> {
    if version == MCS_VERSION || version == MCS_LEGACY_VERSION {
        Ok(())
    } else {
        Err(CoreError::UnsupportedVersion(version))
    }
}

/// Validates an announced payload length against [`MAX_FRAME_SIZE`].
pub fn check_frame_len(len: u32) -> CoreResult<usize> {
    if len > MAX_FRAME_SIZE {
        return Err(CoreError::FrameTooLarge {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint32(value, &mut out);
        out
    }

    #[test]
    fn test_zero_encodes_as_single_byte() {
        assert_eq!(encode(0), vec![0x00]);
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
        assert_eq!(encode(u32::MAX), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn test_varint_round_trip_boundaries() {
        for value in [0, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, u32::MAX] {
            let bytes = encode(value);
            assert_eq!(decode_varint32(&bytes).unwrap(), Some((value, bytes.len())));
        }
    }

    #[test]
    fn test_incomplete_varint() {
        assert_eq!(decode_varint32(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let err = decode_varint32(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert_eq!(err, CoreError::VarintTooLong);
    }

    #[test]
    fn test_decoder_resets_between_values() {
        let mut decoder = VarintDecoder::new();
        assert_eq!(decoder.push(0xac).unwrap(), None);
        assert_eq!(decoder.push(0x02).unwrap(), Some(300));
        assert_eq!(decoder.push(0x05).unwrap(), Some(5));
    }

    #[test]
    fn test_version_byte_only_when_requested() {
        let first = encode_frame(McsTag::LoginRequest, &[1, 2, 3], true);
        assert_eq!(first, vec![MCS_VERSION, 2, 3, 1, 2, 3]);

        let later = encode_frame(McsTag::HeartbeatPing, &[], false);
        assert_eq!(later, vec![0, 0]);
    }

    #[test]
    fn test_tag_table() {
        assert_eq!(McsTag::try_from(8), Ok(McsTag::DataMessageStanza));
        assert_eq!(McsTag::try_from(10), Ok(McsTag::StreamErrorStanza));
        assert_eq!(McsTag::try_from(16), Err(16));
    }

    #[test]
    fn test_version_check() {
        assert!(check_version(41).is_ok());
        assert!(check_version(38).is_ok());
        assert_eq!(check_version(40), Err(CoreError::UnsupportedVersion(40)));
    }

    #[test]
    fn test_frame_len_limit() {
        assert_eq!(check_frame_len(10).unwrap(), 10);
        assert!(check_frame_len(MAX_FRAME_SIZE + 1).is_err());
    }
}
