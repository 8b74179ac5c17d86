//! Capability interfaces consumed by the core.
//!
//! Screen capture, hardware codecs, the virtual-display driver, touch
//! injection, and the firewall/autostart helpers are all platform adapters
//! behind these traits. The core never talks to the OS directly for any of
//! them.

use anyhow::Result;
use async_trait::async_trait;

use crate::shutdown::Shutdown;
use crate::types::{EncodedUnit, MappedTouch, RawFrame, VideoProfile};

// MARK: - CaptureSource

/// Lazily produces raw frames for one monitor. Lives as long as the device
/// session that owns it.
#[async_trait]
pub trait CaptureSource: Send {
    /// Next captured frame. Returns `Ok(None)` once `cancel` fires or the
    /// underlying source ends.
    async fn next_frame(&mut self, cancel: &Shutdown) -> Result<Option<RawFrame>>;
}

// MARK: - Encoder

/// One video encoder instance (NVENC, QuickSync, or software).
pub trait Encoder: Send {
    fn initialize(&mut self, width: u32, height: u32, fps: u32, bitrate_bps: u64) -> Result<()>;

    /// Feed one raw frame; may return `None` while the codec buffers.
    fn encode(&mut self, frame: &RawFrame) -> Result<Option<EncodedUnit>>;

    fn request_key_frame(&mut self);

    fn set_bitrate(&mut self, bitrate_bps: u64);

    fn release(&mut self);
}

/// Builds encoders for a given profile. The manager probes this while
/// walking the compatibility fallback ladder.
pub trait EncoderFactory: Send + Sync {
    fn make_encoder(&self, profile: &VideoProfile) -> Result<Box<dyn Encoder>>;
}

// MARK: - VirtualDisplayDriver

/// Windows virtual-display driver capability. Optional: the manager treats
/// absence as "no driver-imposed monitor limit".
pub trait VirtualDisplayDriver: Send + Sync {
    fn is_available(&self) -> bool;

    /// `(current_monitor_count, max_monitors)` from the driver.
    fn adapter_info(&self) -> Result<(u32, u32)>;

    fn create_monitor(&self, width: u32, height: u32, refresh_rate: u32) -> Result<u32>;

    /// Best-effort destroy; `false` when the handle was already gone.
    fn try_destroy_monitor(&self, monitor_id: u32) -> bool;
}

// MARK: - TouchInjector

/// Platform touch injection. Fire-and-forget: mapping happened in the core,
/// failures stay inside the adapter.
pub trait TouchInjector: Send + Sync {
    fn handle(&self, touch: MappedTouch);
}

// MARK: - Firewall / autostart helpers

/// Best-effort firewall rule management. Failures are logged by the
/// adapter and never fail a session.
#[async_trait]
pub trait FirewallHelper: Send + Sync {
    async fn try_ensure_rule(&self, name: &str, port: u16, protocol: &str) -> bool;

    async fn try_delete_rule(&self, name: &str) -> bool;
}

pub trait AutostartHelper: Send + Sync {
    fn apply_autostart(&self, enable: bool) -> bool;
}

// MARK: - CertStore

/// Opaque persisted blob for the pairing certificate. The platform adapter
/// decides location and at-rest encryption; the core only moves bytes.
pub trait CertStore: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>>;

    fn save(&self, blob: &[u8]) -> Result<()>;
}
