//! JSON control payloads.
//!
//! All structs decode leniently: unknown fields are ignored, optional
//! fields default. Field names follow the wire (snake_case).

use serde::{Deserialize, Serialize};

pub use expandscreen_core::types::TouchEvent;

// ── Handshake ─────────────────────────────────────────────────────────────────

/// First message on every session, sent by the handheld client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub device_id: String,
    pub device_name: String,
    pub client_version: String,
    pub screen_width: u32,
    pub screen_height: u32,
    /// 6-digit pairing code, required on TLS-wrapped streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HandshakeAck {
    pub fn accepted(session_id: String, server_version: String) -> Self {
        Self {
            accepted: true,
            session_id: Some(session_id),
            server_version: Some(server_version),
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self { accepted: false, session_id: None, server_version: None, reason: Some(reason.into()) }
    }
}

// ── Heartbeat ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp_ms: u64,
}

/// Echoes the heartbeat's timestamp bit-for-bit so the sender can compute
/// round-trip time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub original_timestamp_ms: u64,
    pub timestamp_ms: u64,
}

// ── Feedback ──────────────────────────────────────────────────────────────────

/// Receiver-side delivery statistics driving the bitrate controller.
/// Deltas are since the previous feedback message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ProtocolFeedback {
    pub total_messages_delta: u64,
    pub dropped_messages_delta: u64,
    pub receive_rate_bps: u64,
    pub average_rtt_ms: f64,
}

// ── Audio ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u8,
}

// ── Discovery (UDP only) ──────────────────────────────────────────────────────

pub const DISCOVERY_REQUEST_TYPE: &str = "DiscoveryRequest";
pub const DISCOVERY_RESPONSE_TYPE: &str = "DiscoveryResponse";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub message_type: String,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub message_type: String,
    pub request_id: String,
    pub server_id: String,
    pub server_name: String,
    pub tcp_port: u16,
    pub websocket_supported: bool,
    pub server_version: String,
}

impl DiscoveryResponse {
    pub fn answering(
        request: &DiscoveryRequest,
        server_id: &str,
        server_name: &str,
        tcp_port: u16,
        server_version: &str,
    ) -> Self {
        Self {
            message_type: DISCOVERY_RESPONSE_TYPE.to_owned(),
            request_id: request.request_id.clone(),
            server_id: server_id.to_owned(),
            server_name: server_name.to_owned(),
            tcp_port,
            websocket_supported: false,
            server_version: server_version.to_owned(),
        }
    }
}
