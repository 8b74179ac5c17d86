//! expandscreen-protocol — framed, versioned binary message protocol.
//!
//! Every message on a session stream is a fixed 24-byte big-endian header
//! followed by a payload:
//!
//! ```text
//! [0..4]   magic            u32 BE  0x45585053 ("EXPS")
//! [4]      type             u8      MessageType
//! [5]      version          u8      1
//! [6..8]   reserved         u16 BE  0, ignored by receivers
//! [8..16]  timestamp_ms     u64 BE  UTC ms at send time (media frames carry
//!                                   their capture timestamp instead)
//! [16..20] payload_length   u32 BE  ≤ 10 MiB
//! [20..24] sequence_number  u32 BE  per-direction, strictly increasing
//! [24..]   payload          [u8]    JSON for control, codec bitstream for media
//! ```
//!
//! Control payloads are lenient JSON: unknown fields are ignored so newer
//! peers can add fields without breaking older ones. Unknown message *types*
//! are consumed and skipped by receivers.

pub mod header;
pub mod messages;

pub use header::{
    decode_header, encode_header, MessageHeader, MessageType, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN,
    PROTOCOL_VERSION,
};
pub use messages::*;

use bytes::{BufMut, Bytes, BytesMut};
use expandscreen_core::WireError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current UTC time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serialise a control payload to its wire bytes.
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Decode a control payload, ignoring unknown fields.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Frame a complete message: header + payload in one buffer.
///
/// `timestamp_override` preserves capture time for media frames; control
/// messages pass `None` and get the current time.
pub fn build_message(
    kind: MessageType,
    payload: &[u8],
    sequence_number: u32,
    timestamp_override: Option<u64>,
) -> Bytes {
    let header = MessageHeader {
        kind,
        version: PROTOCOL_VERSION,
        timestamp_ms: timestamp_override.unwrap_or_else(now_ms),
        payload_length: payload.len() as u32,
        sequence_number,
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&encode_header(&header));
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_message_frames_header_and_payload() {
        let msg = build_message(MessageType::VideoFrame, b"abc", 9, Some(1234));
        assert_eq!(msg.len(), HEADER_LEN + 3);
        let header = decode_header(&msg[..HEADER_LEN]).unwrap();
        assert_eq!(header.kind, MessageType::VideoFrame);
        assert_eq!(header.timestamp_ms, 1234);
        assert_eq!(header.payload_length, 3);
        assert_eq!(header.sequence_number, 9);
        assert_eq!(&msg[HEADER_LEN..], b"abc");
    }

    #[test]
    fn build_message_defaults_to_now() {
        let before = now_ms();
        let msg = build_message(MessageType::Heartbeat, b"{}", 0, None);
        let header = decode_header(&msg[..HEADER_LEN]).unwrap();
        assert!(header.timestamp_ms >= before);
    }
}
