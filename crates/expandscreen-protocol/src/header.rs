//! Fixed 24-byte message header codec.

use expandscreen_core::WireError;

/// ASCII "EXPS" as a big-endian u32.
pub const MAGIC: u32 = 0x4558_5053;

pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 24;

/// Hard cap on a single payload. Anything larger is a corrupt or hostile
/// stream and fatal to the connection.
pub const MAX_PAYLOAD_LEN: u32 = 10 * 1024 * 1024;

// ── MessageType ───────────────────────────────────────────────────────────────

/// Wire message types. Unrecognised values survive as `Unknown` so a
/// receiver can consume and skip payloads from newer peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake,
    HandshakeAck,
    VideoFrame,
    TouchEvent,
    Heartbeat,
    HeartbeatAck,
    DiscoveryRequest,
    DiscoveryResponse,
    AudioConfig,
    AudioFrame,
    ProtocolFeedback,
    Unknown(u8),
}

impl MessageType {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Handshake,
            2 => Self::HandshakeAck,
            3 => Self::VideoFrame,
            4 => Self::TouchEvent,
            5 => Self::Heartbeat,
            6 => Self::HeartbeatAck,
            7 => Self::DiscoveryRequest,
            8 => Self::DiscoveryResponse,
            9 => Self::AudioConfig,
            10 => Self::AudioFrame,
            11 => Self::ProtocolFeedback,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Handshake => 1,
            Self::HandshakeAck => 2,
            Self::VideoFrame => 3,
            Self::TouchEvent => 4,
            Self::Heartbeat => 5,
            Self::HeartbeatAck => 6,
            Self::DiscoveryRequest => 7,
            Self::DiscoveryResponse => 8,
            Self::AudioConfig => 9,
            Self::AudioFrame => 10,
            Self::ProtocolFeedback => 11,
            Self::Unknown(other) => other,
        }
    }

    /// Control messages are never dropped by the send queue.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::Handshake | Self::HandshakeAck | Self::Heartbeat | Self::HeartbeatAck
        )
    }
}

// ── MessageHeader ─────────────────────────────────────────────────────────────

/// Decoded header. `reserved` is written as zero and not kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub kind: MessageType,
    pub version: u8,
    pub timestamp_ms: u64,
    pub payload_length: u32,
    pub sequence_number: u32,
}

/// Serialise a header to its 24 wire bytes (big-endian).
pub fn encode_header(header: &MessageHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
    buf[4] = header.kind.to_u8();
    buf[5] = header.version;
    // buf[6..8] reserved, zero
    buf[8..16].copy_from_slice(&header.timestamp_ms.to_be_bytes());
    buf[16..20].copy_from_slice(&header.payload_length.to_be_bytes());
    buf[20..24].copy_from_slice(&header.sequence_number.to_be_bytes());
    buf
}

/// Parse 24 header bytes.
///
/// Validation order: size, magic, length cap. A version newer than ours is
/// accepted — the peer may send extra message types, which the receiver
/// skips by type.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::TruncatedHeader(bytes.len()));
    }
    let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let payload_length = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
    if payload_length > MAX_PAYLOAD_LEN {
        return Err(WireError::PayloadTooLarge { len: payload_length, max: MAX_PAYLOAD_LEN });
    }
    Ok(MessageHeader {
        kind: MessageType::from_u8(bytes[4]),
        version: bytes[5],
        timestamp_ms: u64::from_be_bytes(bytes[8..16].try_into().unwrap()),
        payload_length,
        sequence_number: u32::from_be_bytes(bytes[20..24].try_into().unwrap()),
    })
}
