use bytes::Bytes;
use serde::{Deserialize, Serialize};

// MARK: - VideoProfile

/// Resolution + refresh rate + bitrate tuple driving encoder and virtual
/// monitor creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub bitrate_bps: u64,
}

impl VideoProfile {
    pub const FHD60: Self = Self { width: 1920, height: 1080, refresh_rate: 60, bitrate_bps: 8_000_000 };
    pub const HD30: Self = Self { width: 1280, height: 720, refresh_rate: 30, bitrate_bps: 2_000_000 };

    pub fn new(width: u32, height: u32, refresh_rate: u32, bitrate_bps: u64) -> Self {
        Self { width, height, refresh_rate, bitrate_bps }
    }

    /// Same geometry and bitrate at a different refresh rate.
    pub fn with_refresh_rate(&self, refresh_rate: u32) -> Self {
        Self { refresh_rate, ..*self }
    }

    /// Scale down to fit within `max_w × max_h`, preserving aspect ratio.
    ///
    /// Dimensions are rounded down to even pixels and floored at 640×360.
    /// The bitrate is recomputed proportionally to the pixel count and never
    /// exceeds the current bitrate. Returns `None` when the profile already
    /// fits.
    pub fn scaled_to_fit(&self, max_w: u32, max_h: u32) -> Option<Self> {
        if self.width <= max_w && self.height <= max_h {
            return None;
        }
        let scale = f64::min(max_w as f64 / self.width as f64, max_h as f64 / self.height as f64);
        let w = (((self.width as f64 * scale) as u32) & !1).max(640);
        let h = (((self.height as f64 * scale) as u32) & !1).max(360);
        let pixel_ratio = (w as u64 * h as u64) as f64 / (self.width as u64 * self.height as u64) as f64;
        let bitrate = ((self.bitrate_bps as f64 * pixel_ratio) as u64).min(self.bitrate_bps);
        Some(Self { width: w, height: h, refresh_rate: self.refresh_rate, bitrate_bps: bitrate })
    }

    /// Human-readable summary, e.g. `1920x1080@60 • 8.0Mbps`.
    pub fn summary(&self) -> String {
        format!(
            "{}x{}@{} • {:.1}Mbps",
            self.width,
            self.height,
            self.refresh_rate,
            self.bitrate_bps as f64 / 1_000_000.0
        )
    }
}

impl std::fmt::Display for VideoProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

// MARK: - DeviceState

/// Lifecycle state of one device session as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Error => write!(f, "Error"),
        }
    }
}

// MARK: - DeviceSnapshot

/// Immutable per-device snapshot emitted by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub state: DeviceState,
    pub local_port: u16,
    pub remote_port: u16,
    pub monitor_id: Option<u32>,
    pub profile: VideoProfile,
    pub last_error: Option<String>,
}

// MARK: - ConnectDeviceResult

/// Outcome of `SessionManager::connect`.
#[derive(Debug, Clone)]
pub struct ConnectDeviceResult {
    pub success: bool,
    pub error_message: Option<String>,
    pub used_degraded_profile: bool,
    pub snapshot: Option<DeviceSnapshot>,
}

impl ConnectDeviceResult {
    pub fn ok(snapshot: DeviceSnapshot, used_degraded_profile: bool) -> Self {
        Self { success: true, error_message: None, used_degraded_profile, snapshot: Some(snapshot) }
    }

    pub fn fail(message: impl Into<String>, used_degraded_profile: bool) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            used_degraded_profile,
            snapshot: None,
        }
    }
}

// MARK: - RawFrame

/// Uncompressed captured frame handed from the capture source to the encoder.
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixels: Bytes,
    pub capture_timestamp_ms: u64,
}

// MARK: - EncodedUnit

/// One encoder output unit (access unit / NAL group).
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Bytes,
    pub is_key_frame: bool,
}

// MARK: - EncodedFrame

/// Encoded video frame ready for the transport.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub is_key_frame: bool,
    pub data: Bytes,
    pub capture_timestamp_ms: u64,
}

// MARK: - TouchEvent

/// Pointer action from the handheld, coordinates in the remote screen's
/// pixel space. Serialised as JSON on the control channel; `action` stays a
/// raw byte on the wire (0 = down, 1 = move, 2 = up).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TouchEvent {
    pub action: u8,
    pub pointer_id: u32,
    pub x: f64,
    pub y: f64,
    pub pressure: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchAction {
    Down,
    Move,
    Up,
}

impl TouchEvent {
    pub fn action(&self) -> Option<TouchAction> {
        match self.action {
            0 => Some(TouchAction::Down),
            1 => Some(TouchAction::Move),
            2 => Some(TouchAction::Up),
            _ => None,
        }
    }
}

/// A touch event mapped into host-monitor coordinates with a stable
/// contact slot, ready for the platform injector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedTouch {
    pub action: TouchAction,
    pub slot: u32,
    pub x: f64,
    pub y: f64,
    pub pressure: f64,
}
