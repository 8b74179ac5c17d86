//! expandscreen-manager — per-device session lifecycle.
//!
//! The manager owns the map of device sessions and everything needed to
//! bring one up: a local port allocator, the connection factory (USB or
//! Wi-Fi), the encoder factory, and optionally the virtual-display driver.
//! Profiles degrade in two independent ways:
//!
//! - **tier accounting** — once `max_high_quality_sessions` are active, new
//!   devices start from the degraded profile;
//! - **compatibility fallback** — when an encoder refuses a profile, the
//!   ladder in [`ladder`] is walked until something initialises.
//!
//! Lock discipline: the session map sits behind one async mutex; lookups,
//! insertions and removals happen under it, while `connection.connect` and
//! all other I/O happen outside it.

pub mod ladder;
pub mod ports;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use expandscreen_core::interfaces::{Encoder, EncoderFactory, VirtualDisplayDriver};
use expandscreen_core::{ConnectDeviceResult, DeviceSnapshot, DeviceState, VideoProfile};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

pub use ladder::fallback_ladder;
pub use ports::PortAllocator;

/// Returned when the session budget is exhausted. Kept in the operator's
/// language, as shipped.
pub const ERR_SESSION_LIMIT: &str = "连接上限";

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Session cap when no virtual-display driver reports a limit.
    pub default_max_sessions: usize,
    /// Sessions allowed to start from the primary profile.
    pub max_high_quality_sessions: usize,
    pub primary_profile: VideoProfile,
    pub degraded_profile: VideoProfile,
    /// Device-side TCP port (the handheld's listener, reached via forward).
    pub remote_port: u16,
    /// Per-session budget when tearing everything down.
    pub disconnect_deadline: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_max_sessions: 4,
            max_high_quality_sessions: 1,
            primary_profile: VideoProfile::FHD60,
            degraded_profile: VideoProfile::HD30,
            remote_port: 15555,
            disconnect_deadline: Duration::from_secs(2),
        }
    }
}

// ── Connection capability ─────────────────────────────────────────────────────

/// One device's transport link, produced by a [`ConnectionFactory`].
/// `connect` does the actual I/O and is always called outside the manager's
/// session lock.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    async fn connect(&self, device_id: &str) -> Result<()>;

    async fn disconnect(&self);

    fn remote_port(&self) -> u16;
}

/// Builds USB or Wi-Fi connection objects bound to a local port.
pub trait ConnectionFactory: Send + Sync {
    fn open(&self, device_id: &str, local_port: u16) -> Result<Box<dyn DeviceConnection>>;
}

// ── Manager ───────────────────────────────────────────────────────────────────

struct DeviceEntry {
    snapshot: DeviceSnapshot,
    connection: Arc<dyn DeviceConnection>,
    encoder: Option<Box<dyn Encoder>>,
}

pub struct SessionManager {
    config: ManagerConfig,
    sessions: Mutex<HashMap<String, DeviceEntry>>,
    ports: PortAllocator,
    driver: Option<Arc<dyn VirtualDisplayDriver>>,
    connections: Arc<dyn ConnectionFactory>,
    encoders: Arc<dyn EncoderFactory>,
    snapshot_tx: Option<mpsc::Sender<DeviceSnapshot>>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        connections: Arc<dyn ConnectionFactory>,
        encoders: Arc<dyn EncoderFactory>,
        driver: Option<Arc<dyn VirtualDisplayDriver>>,
        snapshot_tx: Option<mpsc::Sender<DeviceSnapshot>>,
    ) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            ports: PortAllocator,
            driver,
            connections,
            encoders,
            snapshot_tx,
        }
    }

    /// Effective session cap: the driver's monitor limit bounds the
    /// configured default when a driver is present.
    fn effective_max_sessions(&self) -> usize {
        let configured = self.config.default_max_sessions;
        match &self.driver {
            Some(driver) if driver.is_available() => match driver.adapter_info() {
                Ok((_, max)) => configured.min(max as usize),
                Err(e) => {
                    warn!("virtual display driver query failed: {e:#}");
                    configured
                }
            },
            _ => configured,
        }
    }

    fn emit(&self, snapshot: &DeviceSnapshot) {
        if let Some(tx) = &self.snapshot_tx {
            let _ = tx.try_send(snapshot.clone());
        }
    }

    /// Bring up (or return) the session for `device_id`.
    ///
    /// Re-entrant per device: while `Connected` the existing snapshot is
    /// returned; a stale non-connected record is replaced.
    pub async fn connect(&self, device_id: &str) -> ConnectDeviceResult {
        // Phase 1, under the lock: idempotency, stale cleanup, capacity, tier.
        let (stale, base_profile) = {
            let mut sessions = self.sessions.lock().await;
            let stale = match sessions.get(device_id) {
                Some(entry) if entry.snapshot.state == DeviceState::Connected => {
                    debug!("connect({device_id}): already connected");
                    return ConnectDeviceResult::ok(entry.snapshot.clone(), false);
                }
                Some(_) => {
                    debug!("connect({device_id}): replacing stale record");
                    sessions.remove(device_id)
                }
                None => None,
            };

            let max = self.effective_max_sessions();
            if sessions.len() >= max {
                return ConnectDeviceResult::fail(
                    format!("{ERR_SESSION_LIMIT} ({}/{})", sessions.len(), max),
                    false,
                );
            }

            let base = if sessions.len() < self.config.max_high_quality_sessions {
                self.config.primary_profile
            } else {
                self.config.degraded_profile
            };
            (stale, base)
        };

        if let Some(entry) = stale {
            dispose_entry(entry, &self.driver, self.config.disconnect_deadline).await;
        }

        // Phase 2, outside the lock: walk the fallback ladder until an
        // encoder, a port, and a connection object all materialise.
        let ladder = fallback_ladder(base_profile, self.config.degraded_profile);
        let mut selected = None;
        for profile in ladder {
            let mut encoder = match self.encoders.make_encoder(&profile) {
                Ok(e) => e,
                Err(e) => {
                    debug!("encoder for {} unavailable: {e:#}", profile.summary());
                    continue;
                }
            };
            if let Err(e) = encoder.initialize(
                profile.width,
                profile.height,
                profile.refresh_rate,
                profile.bitrate_bps,
            ) {
                debug!("encoder init failed for {}: {e:#}", profile.summary());
                continue;
            }
            let local_port = match self.ports.allocate() {
                Ok(p) => p,
                Err(e) => {
                    warn!("port allocation failed: {e:#}");
                    encoder.release();
                    continue;
                }
            };
            match self.connections.open(device_id, local_port) {
                Ok(connection) => {
                    selected = Some((profile, encoder, local_port, Arc::from(connection)));
                    break;
                }
                Err(e) => {
                    debug!("connection open failed on port {local_port}: {e:#}");
                    encoder.release();
                }
            }
        }
        let Some((profile, encoder, local_port, connection)) = selected else {
            return ConnectDeviceResult::fail("no profile in the fallback ladder initialised", true);
        };
        let connection: Arc<dyn DeviceConnection> = connection;
        let used_degraded_profile = profile != base_profile;
        if used_degraded_profile {
            info!(
                "connect({device_id}): base {} fell back to {}",
                base_profile.summary(),
                profile.summary()
            );
        }

        // Phase 3, under the lock: re-check the cap, insert as Connecting.
        {
            let mut sessions = self.sessions.lock().await;
            if sessions.len() >= self.effective_max_sessions() {
                drop(sessions);
                let mut encoder = encoder;
                encoder.release();
                return ConnectDeviceResult::fail(ERR_SESSION_LIMIT, used_degraded_profile);
            }
            let snapshot = DeviceSnapshot {
                device_id: device_id.to_owned(),
                state: DeviceState::Connecting,
                local_port,
                remote_port: connection.remote_port(),
                monitor_id: None,
                profile,
                last_error: None,
            };
            sessions.insert(
                device_id.to_owned(),
                DeviceEntry { snapshot, connection: Arc::clone(&connection), encoder: Some(encoder) },
            );
        }

        // Virtual monitor, best-effort: a driver failure never aborts the
        // connection attempt.
        if let Some(driver) = self.driver.as_ref().filter(|d| d.is_available()) {
            match driver.create_monitor(profile.width, profile.height, profile.refresh_rate) {
                Ok(monitor_id) => {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(entry) = sessions.get_mut(device_id) {
                        entry.snapshot.monitor_id = Some(monitor_id);
                    }
                }
                Err(e) => warn!("virtual monitor creation failed: {e:#}"),
            }
        }

        // Phase 4, outside the lock: the actual network I/O.
        match connection.connect(device_id).await {
            Ok(()) => {
                let snapshot = {
                    let mut sessions = self.sessions.lock().await;
                    let Some(entry) = sessions.get_mut(device_id) else {
                        // Disconnected concurrently while we were connecting.
                        return ConnectDeviceResult::fail("session removed during connect", used_degraded_profile);
                    };
                    entry.snapshot.state = DeviceState::Connected;
                    entry.snapshot.clone()
                };
                info!("device {device_id} connected on {} ({})", local_port, profile.summary());
                self.emit(&snapshot);
                ConnectDeviceResult::ok(snapshot, used_degraded_profile)
            }
            Err(e) => {
                let message = format!("connect failed: {e:#}");
                warn!("device {device_id}: {message}");
                let entry = self.sessions.lock().await.remove(device_id);
                let mut error_snapshot = None;
                if let Some(mut entry) = entry {
                    entry.snapshot.state = DeviceState::Error;
                    entry.snapshot.last_error = Some(message.clone());
                    error_snapshot = Some(entry.snapshot.clone());
                    dispose_entry(entry, &self.driver, self.config.disconnect_deadline).await;
                }
                if let Some(snapshot) = &error_snapshot {
                    self.emit(snapshot);
                }
                ConnectDeviceResult::fail(message, used_degraded_profile)
            }
        }
    }

    /// Tear down one device session. Returns `false` when it did not exist.
    pub async fn disconnect(&self, device_id: &str) -> bool {
        let Some(mut entry) = self.sessions.lock().await.remove(device_id) else {
            return false;
        };
        entry.snapshot.state = DeviceState::Disconnected;
        let snapshot = entry.snapshot.clone();
        dispose_entry(entry, &self.driver, self.config.disconnect_deadline).await;
        info!("device {device_id} disconnected");
        self.emit(&snapshot);
        true
    }

    /// Tear down everything, bounded by the per-session deadline.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for device_id in ids {
            self.disconnect(&device_id).await;
        }
    }

    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.sessions.lock().await.values().map(|e| e.snapshot.clone()).collect()
    }

    pub async fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.sessions.lock().await.get(device_id).map(|e| e.snapshot.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Hand the probed encoder to the pipeline layer. Each successful
    /// connect produces exactly one encoder to take.
    pub async fn take_encoder(&self, device_id: &str) -> Option<Box<dyn Encoder>> {
        self.sessions.lock().await.get_mut(device_id).and_then(|e| e.encoder.take())
    }
}

/// Release everything an entry owns: the connection (bounded), the virtual
/// monitor (best-effort, logged), and the encoder if the pipeline never
/// took it.
async fn dispose_entry(
    mut entry: DeviceEntry,
    driver: &Option<Arc<dyn VirtualDisplayDriver>>,
    deadline: Duration,
) {
    if tokio::time::timeout(deadline, entry.connection.disconnect()).await.is_err() {
        warn!("disconnect of {} exceeded {:?}, dropping", entry.snapshot.device_id, deadline);
    }
    if let (Some(driver), Some(monitor_id)) = (driver, entry.snapshot.monitor_id) {
        if !driver.try_destroy_monitor(monitor_id) {
            warn!("virtual monitor {monitor_id} was already gone");
        }
    }
    if let Some(mut encoder) = entry.encoder.take() {
        encoder.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expandscreen_core::{EncodedUnit, RawFrame};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    // ── Fakes ────────────────────────────────────────────────────────────────

    struct FakeConnection {
        remote_port: u16,
        fail_connect: bool,
        disconnected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DeviceConnection for FakeConnection {
        async fn connect(&self, _device_id: &str) -> Result<()> {
            if self.fail_connect {
                anyhow::bail!("device unreachable");
            }
            Ok(())
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::Relaxed);
        }

        fn remote_port(&self) -> u16 {
            self.remote_port
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        fail_connect: AtomicBool,
        opened: AtomicU64,
    }

    impl ConnectionFactory for FakeFactory {
        fn open(&self, _device_id: &str, _local_port: u16) -> Result<Box<dyn DeviceConnection>> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            Ok(Box::new(FakeConnection {
                remote_port: 15555,
                fail_connect: self.fail_connect.load(Ordering::Relaxed),
                disconnected: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    struct NopEncoder;

    impl Encoder for NopEncoder {
        fn initialize(&mut self, _w: u32, _h: u32, _fps: u32, _bitrate: u64) -> Result<()> {
            Ok(())
        }
        fn encode(&mut self, _frame: &RawFrame) -> Result<Option<EncodedUnit>> {
            Ok(None)
        }
        fn request_key_frame(&mut self) {}
        fn set_bitrate(&mut self, _bitrate_bps: u64) {}
        fn release(&mut self) {}
    }

    /// Refuses every profile wider than `max_width`.
    struct PickyEncoderFactory {
        max_width: u32,
        attempts: StdMutex<Vec<VideoProfile>>,
    }

    impl EncoderFactory for PickyEncoderFactory {
        fn make_encoder(&self, profile: &VideoProfile) -> Result<Box<dyn Encoder>> {
            self.attempts.lock().unwrap().push(*profile);
            if profile.width > self.max_width {
                anyhow::bail!("resolution not supported by hardware");
            }
            Ok(Box::new(NopEncoder))
        }
    }

    fn open_encoder_factory() -> Arc<PickyEncoderFactory> {
        Arc::new(PickyEncoderFactory { max_width: u32::MAX, attempts: StdMutex::new(Vec::new()) })
    }

    struct FakeDriver {
        max_monitors: u32,
        created: AtomicU32,
        destroyed: AtomicU32,
    }

    impl FakeDriver {
        fn new(max_monitors: u32) -> Arc<Self> {
            Arc::new(Self { max_monitors, created: AtomicU32::new(0), destroyed: AtomicU32::new(0) })
        }
    }

    impl VirtualDisplayDriver for FakeDriver {
        fn is_available(&self) -> bool {
            true
        }
        fn adapter_info(&self) -> Result<(u32, u32)> {
            Ok((self.created.load(Ordering::Relaxed), self.max_monitors))
        }
        fn create_monitor(&self, _w: u32, _h: u32, _hz: u32) -> Result<u32> {
            Ok(self.created.fetch_add(1, Ordering::Relaxed) + 1)
        }
        fn try_destroy_monitor(&self, _monitor_id: u32) -> bool {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            true
        }
    }

    fn manager(
        config: ManagerConfig,
        factory: Arc<FakeFactory>,
        encoders: Arc<PickyEncoderFactory>,
        driver: Option<Arc<FakeDriver>>,
    ) -> SessionManager {
        SessionManager::new(
            config,
            factory,
            encoders,
            driver.map(|d| d as Arc<dyn VirtualDisplayDriver>),
            None,
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_connected() {
        let factory = Arc::new(FakeFactory::default());
        let m = manager(ManagerConfig::default(), Arc::clone(&factory), open_encoder_factory(), None);

        let first = m.connect("dev-1").await;
        assert!(first.success);
        assert!(!first.used_degraded_profile);
        let opened_once = factory.opened.load(Ordering::Relaxed);

        let second = m.connect("dev-1").await;
        assert!(second.success);
        assert_eq!(factory.opened.load(Ordering::Relaxed), opened_once, "no new connection");
        assert_eq!(m.session_count().await, 1);
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let config = ManagerConfig { default_max_sessions: 1, ..Default::default() };
        let m = manager(config, Arc::new(FakeFactory::default()), open_encoder_factory(), None);

        assert!(m.connect("dev-1").await.success);
        let result = m.connect("dev-2").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains(ERR_SESSION_LIMIT));
    }

    #[tokio::test]
    async fn driver_monitor_limit_bounds_the_cap() {
        let config = ManagerConfig { default_max_sessions: 4, ..Default::default() };
        let driver = FakeDriver::new(1);
        let m = manager(
            config,
            Arc::new(FakeFactory::default()),
            open_encoder_factory(),
            Some(driver),
        );

        assert!(m.connect("dev-1").await.success);
        assert!(!m.connect("dev-2").await.success);
        assert_eq!(m.session_count().await, 1);
    }

    #[tokio::test]
    async fn second_session_starts_degraded() {
        let config = ManagerConfig {
            default_max_sessions: 2,
            max_high_quality_sessions: 1,
            ..Default::default()
        };
        let m = manager(config.clone(), Arc::new(FakeFactory::default()), open_encoder_factory(), None);

        let first = m.connect("dev-1").await;
        assert_eq!(first.snapshot.unwrap().profile, config.primary_profile);

        let second = m.connect("dev-2").await;
        assert!(second.success);
        assert_eq!(second.snapshot.unwrap().profile, config.degraded_profile);
        // Degraded by tier accounting, not by compatibility fallback.
        assert!(!second.used_degraded_profile);
    }

    #[tokio::test]
    async fn encoder_failures_walk_the_fallback_ladder() {
        let config = ManagerConfig {
            primary_profile: VideoProfile::new(3840, 2160, 120, 40_000_000),
            ..Default::default()
        };
        let encoders =
            Arc::new(PickyEncoderFactory { max_width: 1280, attempts: StdMutex::new(Vec::new()) });
        let m = manager(config, Arc::new(FakeFactory::default()), Arc::clone(&encoders), None);

        let result = m.connect("dev-1").await;
        assert!(result.success);
        assert!(result.used_degraded_profile, "selected profile differs from base");
        let snapshot = result.snapshot.unwrap();
        assert!(snapshot.profile.width <= 1280);

        // The 4K and 1080p rungs were probed and refused, in ladder order.
        let attempts = encoders.attempts.lock().unwrap();
        assert_eq!(attempts[0].width, 3840);
        assert!(attempts.iter().position(|p| p.width == 1280).is_some());
    }

    #[tokio::test]
    async fn exhausted_ladder_fails_cleanly() {
        let encoders = Arc::new(PickyEncoderFactory { max_width: 0, attempts: StdMutex::new(Vec::new()) });
        let m = manager(ManagerConfig::default(), Arc::new(FakeFactory::default()), encoders, None);

        let result = m.connect("dev-1").await;
        assert!(!result.success);
        assert_eq!(m.session_count().await, 0, "no session left behind");
    }

    #[tokio::test]
    async fn connect_failure_rolls_back_and_destroys_the_monitor() {
        let factory = Arc::new(FakeFactory::default());
        factory.fail_connect.store(true, Ordering::Relaxed);
        let driver = FakeDriver::new(4);
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel(8);
        let m = SessionManager::new(
            ManagerConfig::default(),
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
            open_encoder_factory(),
            Some(Arc::clone(&driver) as Arc<dyn VirtualDisplayDriver>),
            Some(snapshot_tx),
        );

        let result = m.connect("dev-1").await;
        assert!(!result.success);
        assert!(result.error_message.unwrap().contains("device unreachable"));
        assert_eq!(m.session_count().await, 0);
        assert_eq!(driver.destroyed.load(Ordering::Relaxed), 1, "monitor released on rollback");

        let snapshot = snapshot_rx.try_recv().expect("terminal snapshot emitted");
        assert_eq!(snapshot.state, DeviceState::Error);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn disconnect_emits_a_final_snapshot_and_frees_the_monitor() {
        let driver = FakeDriver::new(4);
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel(8);
        let m = SessionManager::new(
            ManagerConfig::default(),
            Arc::new(FakeFactory::default()) as Arc<dyn ConnectionFactory>,
            open_encoder_factory(),
            Some(Arc::clone(&driver) as Arc<dyn VirtualDisplayDriver>),
            Some(snapshot_tx),
        );

        assert!(m.connect("dev-1").await.success);
        let _connected = snapshot_rx.try_recv().expect("connected snapshot");

        assert!(m.disconnect("dev-1").await);
        assert!(!m.disconnect("dev-1").await, "second disconnect is a no-op");
        assert_eq!(m.session_count().await, 0);
        assert_eq!(driver.destroyed.load(Ordering::Relaxed), 1);

        let snapshot = snapshot_rx.try_recv().expect("disconnected snapshot");
        assert_eq!(snapshot.state, DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_all_clears_the_map() {
        let config = ManagerConfig { default_max_sessions: 3, ..Default::default() };
        let m = manager(config, Arc::new(FakeFactory::default()), open_encoder_factory(), None);
        for id in ["a", "b", "c"] {
            assert!(m.connect(id).await.success);
        }
        assert_eq!(m.session_count().await, 3);
        m.disconnect_all().await;
        assert_eq!(m.session_count().await, 0);
    }

    #[tokio::test]
    async fn encoder_is_takeable_exactly_once() {
        let m = manager(
            ManagerConfig::default(),
            Arc::new(FakeFactory::default()),
            open_encoder_factory(),
            None,
        );
        assert!(m.connect("dev-1").await.success);
        assert!(m.take_encoder("dev-1").await.is_some());
        assert!(m.take_encoder("dev-1").await.is_none());
    }
}
