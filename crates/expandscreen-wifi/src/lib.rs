//! expandscreen-wifi — host-side LAN transport.
//!
//! Binds the TCP accept port, optionally wraps accepted streams in TLS
//! with the pairing certificate, and keeps exactly one live session: every
//! accept atomically replaces the previous session, which is closed
//! outside the lock. The discovery responder is started alongside and
//! advertises the bound port; firewall rule installation is best-effort.

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use expandscreen_core::interfaces::{FirewallHelper, TouchInjector};
use expandscreen_core::shutdown::{Shutdown, ShutdownGuard};
use expandscreen_core::touch::{SlotRegistry, TouchMapper};
use expandscreen_core::{MappedTouch, TouchAction, TouchEvent};
use expandscreen_discovery::{DiscoveryConfig, DiscoveryResponder};
use expandscreen_session::{
    HandshakePolicy, Session, SessionConfig, SessionEvent, SessionRole, SessionSinks, TouchSink,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

pub const DEFAULT_TCP_PORT: u16 = 15555;

// ── Touch plumbing ────────────────────────────────────────────────────────────

/// Session → injector glue: maps remote pixels into the host monitor
/// rectangle and pins pointer ids to stable contact slots. Synchronous, as
/// the session dispatch requires.
pub struct MappedTouchSink {
    mapper: Arc<StdMutex<TouchMapper>>,
    slots: Arc<StdMutex<SlotRegistry>>,
    injector: Arc<dyn TouchInjector>,
}

impl MappedTouchSink {
    pub fn new(
        mapper: Arc<StdMutex<TouchMapper>>,
        slots: Arc<StdMutex<SlotRegistry>>,
        injector: Arc<dyn TouchInjector>,
    ) -> Self {
        Self { mapper, slots, injector }
    }
}

impl TouchSink for MappedTouchSink {
    fn on_touch(&self, touch: TouchEvent) {
        let Some(action) = touch.action() else {
            debug!("touch with unknown action {} dropped", touch.action);
            return;
        };
        let slot = {
            let mut slots = self.slots.lock().expect("slot lock");
            match action {
                TouchAction::Down | TouchAction::Move => slots.allocate(touch.pointer_id),
                TouchAction::Up => {
                    let slot = slots.lookup(touch.pointer_id);
                    slots.release(touch.pointer_id);
                    slot
                }
            }
        };
        let Some(slot) = slot else {
            debug!("no contact slot for pointer {}", touch.pointer_id);
            return;
        };
        let (x, y) = self.mapper.lock().expect("mapper lock").map(touch.x, touch.y);
        self.injector.handle(MappedTouch { action, slot, x, y, pressure: touch.pressure });
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WifiConfig {
    /// Accept port; 0 binds ephemeral.
    pub tcp_port: u16,
    pub server_id: String,
    pub server_name: String,
    pub enable_discovery: bool,
    pub firewall_rule_name: String,
    pub session: SessionConfig,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            server_id: "expandscreen-host".to_owned(),
            server_name: "ExpandScreen".to_owned(),
            enable_discovery: true,
            firewall_rule_name: "ExpandScreen".to_owned(),
            session: SessionConfig::default(),
        }
    }
}

// ── WifiHost ──────────────────────────────────────────────────────────────────

/// Running accept loop plus the current session slot.
pub struct WifiHost {
    port: u16,
    current: Arc<Mutex<Option<Session>>>,
    guard: ShutdownGuard,
}

impl WifiHost {
    /// Bind and start serving. `acceptor` switches the port to TLS;
    /// `sinks` (touch/feedback/media) are shared by every accepted session;
    /// all session events funnel into `events_tx`.
    pub async fn start(
        config: WifiConfig,
        acceptor: Option<TlsAcceptor>,
        policy: Arc<dyn HandshakePolicy>,
        sinks: SessionSinks,
        events_tx: mpsc::Sender<SessionEvent>,
        firewall: Option<Arc<dyn FirewallHelper>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
            .await
            .with_context(|| format!("binding accept port {}", config.tcp_port))?;
        let port = listener.local_addr().context("reading accept port")?.port();
        info!(
            "Wi-Fi host listening on tcp/{port} ({})",
            if acceptor.is_some() { "TLS" } else { "plain" }
        );

        if let Some(firewall) = &firewall {
            if !firewall.try_ensure_rule(&config.firewall_rule_name, port, "tcp").await {
                warn!("firewall rule for tcp/{port} could not be ensured");
            }
        }

        let (guard, shutdown) = Shutdown::channel();

        if config.enable_discovery {
            let discovery = DiscoveryResponder::bind(DiscoveryConfig::new(
                config.server_id.clone(),
                config.server_name.clone(),
                port,
            ))
            .context("starting discovery responder")?;
            tokio::spawn(discovery.run(guard.subscribe()));
        }

        let current = Arc::new(Mutex::new(None));
        tokio::spawn(run_accept_loop(
            listener,
            acceptor,
            policy,
            config.session,
            sinks,
            events_tx,
            Arc::clone(&current),
            shutdown,
        ));

        Ok(Self { port, current, guard })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// Stop accepting and close the live session.
    pub async fn stop(&self) {
        self.guard.trigger();
        let old = self.current.lock().await.take();
        if let Some(session) = old {
            session.close().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    policy: Arc<dyn HandshakePolicy>,
    session_config: SessionConfig,
    sinks: SessionSinks,
    events_tx: mpsc::Sender<SessionEvent>,
    current: Arc<Mutex<Option<Session>>>,
    mut shutdown: Shutdown,
) {
    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.recv() => {
                info!("accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            },
        };

        if let Err(e) = configure_stream(&stream) {
            warn!("socket options for {addr} failed: {e}");
        }

        let role = SessionRole::Server { policy: Arc::clone(&policy) };
        let session = match &acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => {
                    info!("TLS connection from {addr}");
                    let (reader, writer) = tokio::io::split(tls);
                    attach_and_forward(reader, writer, role, session_config.clone(), sinks.clone(), events_tx.clone())
                }
                Err(e) => {
                    // Fingerprint mismatches land here; no session state
                    // exists yet.
                    warn!("TLS handshake with {addr} failed: {e}");
                    continue;
                }
            },
            None => {
                info!("connection from {addr}");
                let (reader, writer) = tokio::io::split(stream);
                attach_and_forward(reader, writer, role, session_config.clone(), sinks.clone(), events_tx.clone())
            }
        };

        // Atomic replacement: swap under the lock, close the old session
        // outside it.
        let old = current.lock().await.replace(session);
        if let Some(old) = old {
            debug!("replacing previous session");
            old.close().await;
        }
    }
}

fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).context("TCP_NODELAY")?;
    socket2::SockRef::from(stream).set_keepalive(true).context("SO_KEEPALIVE")?;
    Ok(())
}

fn attach_and_forward<R, W>(
    reader: R,
    writer: W,
    role: SessionRole,
    config: SessionConfig,
    sinks: SessionSinks,
    events_tx: mpsc::Sender<SessionEvent>,
) -> Session
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (session, mut events) = Session::attach(reader, writer, role, config, sinks);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if events_tx.send(event).await.is_err() {
                return;
            }
        }
    });
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use expandscreen_core::SessionError;
    use expandscreen_pairing::{pinned_connector, PairingIdentity, PairingPolicy, PairingManager};
    use expandscreen_protocol::HandshakeRequest;
    use expandscreen_session::AcceptAll;
    use std::time::Duration;

    struct RecordingInjector(StdMutex<Vec<MappedTouch>>);
    impl TouchInjector for RecordingInjector {
        fn handle(&self, touch: MappedTouch) {
            self.0.lock().unwrap().push(touch);
        }
    }

    fn test_config() -> WifiConfig {
        WifiConfig { tcp_port: 0, enable_discovery: false, ..Default::default() }
    }

    fn request(code: Option<&str>) -> HandshakeRequest {
        HandshakeRequest {
            device_id: "phone".into(),
            device_name: "Phone".into(),
            client_version: "1".into(),
            screen_width: 1080,
            screen_height: 2400,
            pairing_code: code.map(str::to_owned),
        }
    }

    async fn connect_plain_client(port: u16) -> (Session, mpsc::Receiver<SessionEvent>) {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (r, w) = tokio::io::split(stream);
        Session::attach(r, w, SessionRole::Client, SessionConfig::default(), SessionSinks::default())
    }

    #[tokio::test]
    async fn plain_accept_creates_a_session() {
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let host = WifiHost::start(
            test_config(),
            None,
            Arc::new(AcceptAll),
            SessionSinks::default(),
            events_tx,
            None,
        )
        .await
        .unwrap();

        let (client, _client_events) = connect_plain_client(host.port()).await;
        client.perform_handshake(request(None)).await.expect("handshake");

        match tokio::time::timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap() {
            Some(SessionEvent::Connected { peer: Some(peer), .. }) => {
                assert_eq!(peer.device_id, "phone");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(host.current_session().await.is_some());
        host.stop().await;
    }

    #[tokio::test]
    async fn new_accept_replaces_the_previous_session() {
        let (events_tx, _events_rx) = mpsc::channel(64);
        let host = WifiHost::start(
            test_config(),
            None,
            Arc::new(AcceptAll),
            SessionSinks::default(),
            events_tx,
            None,
        )
        .await
        .unwrap();

        let (first, _e1) = connect_plain_client(host.port()).await;
        first.perform_handshake(request(None)).await.expect("first handshake");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_server = host.current_session().await.expect("first session");

        let (second, _e2) = connect_plain_client(host.port()).await;
        second.perform_handshake(request(None)).await.expect("second handshake");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let current = host.current_session().await.expect("second session");
        assert_ne!(current.session_id(), first_server.session_id());
        assert_eq!(first_server.state(), expandscreen_session::SessionState::Closed);
        host.stop().await;
    }

    #[tokio::test]
    async fn tls_pairing_accepts_the_right_code_and_rejects_the_wrong_one() {
        struct MemStore(StdMutex<Option<Vec<u8>>>);
        impl expandscreen_core::interfaces::CertStore for MemStore {
            fn load(&self) -> Result<Option<Vec<u8>>> {
                Ok(self.0.lock().unwrap().clone())
            }
            fn save(&self, blob: &[u8]) -> Result<()> {
                *self.0.lock().unwrap() = Some(blob.to_vec());
                Ok(())
            }
        }

        let manager =
            Arc::new(PairingManager::load_or_generate(Arc::new(MemStore(StdMutex::new(None)))).unwrap());
        let identity = manager.current();
        let code = identity.pairing_code().to_owned();
        let fingerprint = *identity.fingerprint();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let host = WifiHost::start(
            test_config(),
            Some(identity.acceptor().unwrap()),
            Arc::new(PairingPolicy::new(manager)),
            SessionSinks::default(),
            events_tx,
            None,
        )
        .await
        .unwrap();

        let connect_tls = |port: u16, fingerprint: [u8; 32]| async move {
            let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let connector = pinned_connector(fingerprint);
            let name = rustls::pki_types::ServerName::try_from("expandscreen.local").unwrap();
            let tls = connector.connect(name, tcp).await.expect("TLS handshake");
            let (r, w) = tokio::io::split(tls);
            Session::attach(r, w, SessionRole::Client, SessionConfig::default(), SessionSinks::default())
        };

        // Wrong code: protocol-level rejection, no Connected event.
        let (client, _ev) = connect_tls(host.port(), fingerprint).await;
        let err = client.perform_handshake(request(Some("000000"))).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeRejected(ref r) if r == "pairing code mismatch"));
        match tokio::time::timeout(Duration::from_secs(2), events_rx.recv()).await.unwrap() {
            Some(SessionEvent::HandshakeRejected { reason }) => {
                assert_eq!(reason, "pairing code mismatch");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Right code: connected.
        let (client, _ev) = connect_tls(host.port(), fingerprint).await;
        client.perform_handshake(request(Some(&code))).await.expect("paired handshake");
        host.stop().await;
    }

    #[tokio::test]
    async fn pinned_client_refuses_a_different_certificate() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let identity = PairingIdentity::generate().unwrap();
        let host = WifiHost::start(
            test_config(),
            Some(identity.acceptor().unwrap()),
            Arc::new(AcceptAll),
            SessionSinks::default(),
            events_tx,
            None,
        )
        .await
        .unwrap();

        let tcp = TcpStream::connect(("127.0.0.1", host.port())).await.unwrap();
        let connector = pinned_connector([0u8; 32]); // pin for some other host
        let name = rustls::pki_types::ServerName::try_from("expandscreen.local").unwrap();
        assert!(connector.connect(name, tcp).await.is_err(), "mismatched pin must fail TLS");
        host.stop().await;
    }

    #[tokio::test]
    async fn touch_sink_maps_and_allocates_slots() {
        let mapper = Arc::new(StdMutex::new(TouchMapper::new(
            100,
            100,
            expandscreen_core::touch::TargetRect::new(0.0, 0.0, 200.0, 200.0),
            0,
        )));
        let slots = Arc::new(StdMutex::new(SlotRegistry::new(2)));
        let injector = Arc::new(RecordingInjector(StdMutex::new(Vec::new())));
        let sink = MappedTouchSink::new(mapper, slots, injector.clone());

        sink.on_touch(TouchEvent { action: 0, pointer_id: 7, x: 99.0, y: 0.0, pressure: 1.0 });
        sink.on_touch(TouchEvent { action: 1, pointer_id: 7, x: 0.0, y: 99.0, pressure: 0.5 });
        sink.on_touch(TouchEvent { action: 2, pointer_id: 7, x: 0.0, y: 99.0, pressure: 0.0 });
        // Unknown action: dropped.
        sink.on_touch(TouchEvent { action: 9, pointer_id: 7, x: 0.0, y: 0.0, pressure: 0.0 });

        let events = injector.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].action, TouchAction::Down);
        assert_eq!(events[0].slot, 0);
        assert_eq!((events[0].x, events[0].y), (200.0, 0.0));
        assert_eq!(events[1].action, TouchAction::Move);
        assert_eq!((events[1].x, events[1].y), (0.0, 200.0));
        assert_eq!(events[2].action, TouchAction::Up);
        assert_eq!(events[2].slot, 0);
    }
}
