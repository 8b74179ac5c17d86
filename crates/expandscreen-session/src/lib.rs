//! expandscreen-session — the per-connection protocol engine.
//!
//! A `Session` owns one byte stream (through the frame transport) and runs
//! the handshake → heartbeat lifecycle:
//!
//! ```text
//! Idle ──attach──► WaitingHandshake ──► PerformingHandshake ──► Connected ──► Closed
//!                        (server waits; client calls perform_handshake)
//! ```
//!
//! Until the handshake completes the session sends no media and runs no
//! heartbeat. Once connected, a heartbeat goes out every interval and the
//! session closes itself when nothing has been received for the timeout.
//! Inbound messages are demultiplexed: control is consumed internally,
//! touch goes to the touch sink, feedback to the feedback sink, audio and
//! video to their channels, unknown types are skipped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use expandscreen_core::shutdown::{Shutdown, ShutdownGuard};
use expandscreen_core::{EncodedFrame, SessionError, TouchEvent};
use expandscreen_protocol::{
    decode_json, encode_json, now_ms, Heartbeat, HeartbeatAck, MessageHeader, MessageType,
};
use expandscreen_transport::{FrameSender, FrameTransport, TransportConfig, TransportEvent, TransportStats};

pub use expandscreen_protocol::{AudioConfig, HandshakeAck, HandshakeRequest, ProtocolFeedback};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub handshake_deadline: Duration,
    pub server_version: String,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            handshake_deadline: Duration::from_secs(5),
            server_version: env!("CARGO_PKG_VERSION").to_owned(),
            transport: TransportConfig::default(),
        }
    }
}

// ── State / events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitingHandshake,
    PerformingHandshake,
    Connected,
    Closed,
}

/// Peer identity learned from the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerDevice {
    pub device_id: String,
    pub device_name: String,
    pub client_version: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

/// Everything a session reports, on one typed channel per session.
#[derive(Debug)]
pub enum SessionEvent {
    Connected { session_id: String, peer: Option<PeerDevice> },
    HandshakeRejected { reason: String },
    HeartbeatTimeout,
    Error(SessionError),
    Closed,
}

// ── Sinks and policy ──────────────────────────────────────────────────────────

/// Receives remote pointer events, synchronously, from the dispatch task.
pub trait TouchSink: Send + Sync {
    fn on_touch(&self, touch: TouchEvent);
}

/// Receives delivery feedback for the bitrate controller.
pub trait FeedbackSink: Send + Sync {
    fn on_feedback(&self, feedback: ProtocolFeedback);
}

/// Server-side accept/reject hook invoked on every inbound handshake.
/// Pairing-code verification plugs in here for TLS-wrapped streams.
#[async_trait]
pub trait HandshakePolicy: Send + Sync {
    async fn authorize(&self, request: &HandshakeRequest) -> Result<(), String>;
}

/// Accepts every handshake. Used on plain USB streams.
pub struct AcceptAll;

#[async_trait]
impl HandshakePolicy for AcceptAll {
    async fn authorize(&self, _request: &HandshakeRequest) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Clone)]
pub enum SessionRole {
    Client,
    Server { policy: Arc<dyn HandshakePolicy> },
}

/// Opaque media payload passed through to consumers.
#[derive(Debug)]
pub struct MediaFrame {
    pub header: MessageHeader,
    pub payload: Bytes,
}

/// Where demultiplexed inbound traffic goes. Absent sinks mean the traffic
/// is dropped with a trace log.
#[derive(Default, Clone)]
pub struct SessionSinks {
    pub touch: Option<Arc<dyn TouchSink>>,
    pub feedback: Option<Arc<dyn FeedbackSink>>,
    pub media: Option<mpsc::Sender<MediaFrame>>,
    pub audio: Option<mpsc::Sender<MediaFrame>>,
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_id: Option<String>,
    pub state: SessionState,
    pub ms_since_last_heartbeat: u64,
    pub last_rtt_ms: f64,
    pub avg_rtt_ms: f64,
    pub send_count: u64,
    pub recv_count: u64,
    pub dropped_count: u64,
}

#[derive(Default)]
struct Rtt {
    last_ms: f64,
    avg_ms: f64,
    samples: u64,
}

impl Rtt {
    const ALPHA: f64 = 0.2;

    fn record(&mut self, rtt_ms: f64) {
        self.last_ms = rtt_ms;
        self.avg_ms = if self.samples == 0 {
            rtt_ms
        } else {
            self.avg_ms * (1.0 - Self::ALPHA) + rtt_ms * Self::ALPHA
        };
        self.samples += 1;
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

struct SessionInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    session_id: Mutex<Option<String>>,
    peer: Mutex<Option<PeerDevice>>,
    sender: FrameSender,
    rtt: Mutex<Rtt>,
    epoch: Instant,
    last_rx_ms: AtomicU64,
    last_heartbeat_sent_ms: AtomicU64,
    pending_ack: Mutex<Option<oneshot::Sender<HandshakeAck>>>,
    events: mpsc::Sender<SessionEvent>,
    heartbeat_guard: Mutex<Option<ShutdownGuard>>,
    transport: tokio::sync::Mutex<Option<FrameTransport>>,
}

impl SessionInner {
    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn state(&self) -> SessionState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().expect("state lock") = next;
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    fn send_control<T: serde::Serialize>(&self, kind: MessageType, payload: &T) -> bool {
        match encode_json(payload) {
            Ok(bytes) => self.sender.send(kind, bytes, None),
            Err(e) => {
                warn!("failed to encode {:?} payload: {e}", kind);
                false
            }
        }
    }
}

/// Shut the session down exactly once: stop the heartbeat, close the
/// transport (flushing the queue), and move to `Closed`.
async fn shutdown_session(inner: &Arc<SessionInner>, emit_closed: bool) {
    {
        let mut state = inner.state.lock().expect("state lock");
        if *state == SessionState::Closed {
            return;
        }
        *state = SessionState::Closed;
    }
    if let Some(guard) = inner.heartbeat_guard.lock().expect("heartbeat lock").take() {
        guard.trigger();
    }
    // Dropping a pending ack waiter fails perform_handshake immediately.
    inner.pending_ack.lock().expect("pending lock").take();
    if let Some(transport) = inner.transport.lock().await.take() {
        transport.close().await;
    }
    if emit_closed {
        inner.emit(SessionEvent::Closed).await;
    }
}

/// A finite-state protocol engine bound to one byte stream.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Bind a session to a stream. The receiver starts immediately; the
    /// heartbeat does not start until the handshake completes.
    pub fn attach<R, W>(
        reader: R,
        writer: W,
        role: SessionRole,
        config: SessionConfig,
        sinks: SessionSinks,
    ) -> (Self, mpsc::Receiver<SessionEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (transport_tx, transport_rx) = mpsc::channel(config.transport.inbound_channel_capacity);
        let transport = FrameTransport::spawn(reader, writer, transport_tx, config.transport.clone());

        let inner = Arc::new(SessionInner {
            sender: transport.sender(),
            config,
            state: Mutex::new(SessionState::WaitingHandshake),
            session_id: Mutex::new(None),
            peer: Mutex::new(None),
            rtt: Mutex::new(Rtt::default()),
            epoch: Instant::now(),
            last_rx_ms: AtomicU64::new(0),
            last_heartbeat_sent_ms: AtomicU64::new(0),
            pending_ack: Mutex::new(None),
            events: events_tx,
            heartbeat_guard: Mutex::new(None),
            transport: tokio::sync::Mutex::new(Some(transport)),
        });

        tokio::spawn(run_dispatch(Arc::clone(&inner), role, sinks, transport_rx));

        (Self { inner }, events_rx)
    }

    /// Client side: send the handshake and wait for the ack, bounded by the
    /// configured deadline. Returns the server-assigned session id.
    pub async fn perform_handshake(&self, request: HandshakeRequest) -> Result<String, SessionError> {
        let inner = &self.inner;
        match inner.state() {
            SessionState::WaitingHandshake => {}
            SessionState::Closed => return Err(SessionError::Closed),
            other => {
                return Err(SessionError::Protocol(format!("handshake attempted in state {other:?}")));
            }
        }
        inner.set_state(SessionState::PerformingHandshake);

        let (ack_tx, ack_rx) = oneshot::channel();
        *inner.pending_ack.lock().expect("pending lock") = Some(ack_tx);

        if !inner.send_control(MessageType::Handshake, &request) {
            shutdown_session(inner, false).await;
            return Err(SessionError::Closed);
        }

        match tokio::time::timeout(inner.config.handshake_deadline, ack_rx).await {
            Ok(Ok(ack)) if ack.accepted => {
                let session_id = ack.session_id.unwrap_or_default();
                *inner.session_id.lock().expect("session_id lock") = Some(session_id.clone());
                inner.set_state(SessionState::Connected);
                start_heartbeat(inner);
                inner
                    .emit(SessionEvent::Connected { session_id: session_id.clone(), peer: None })
                    .await;
                info!("handshake accepted, session {}", session_id);
                Ok(session_id)
            }
            Ok(Ok(ack)) => {
                let reason = ack.reason.unwrap_or_else(|| "rejected".to_owned());
                inner.emit(SessionEvent::HandshakeRejected { reason: reason.clone() }).await;
                shutdown_session(inner, false).await;
                Err(SessionError::HandshakeRejected(reason))
            }
            Ok(Err(_)) => {
                shutdown_session(inner, false).await;
                Err(SessionError::Closed)
            }
            Err(_) => {
                *inner.pending_ack.lock().expect("pending lock") = None;
                shutdown_session(inner, false).await;
                Err(SessionError::HandshakeTimeout)
            }
        }
    }

    /// Queue an encoded video frame. Refused until the session is connected.
    /// The frame's capture timestamp rides in the message header so the peer
    /// can observe end-to-end latency.
    pub fn send_video(&self, frame: &EncodedFrame) -> bool {
        if self.inner.state() != SessionState::Connected {
            return false;
        }
        self.inner.sender.send(
            MessageType::VideoFrame,
            frame.data.clone(),
            Some(frame.capture_timestamp_ms),
        )
    }

    pub fn send_audio_config(&self, config: &AudioConfig) -> bool {
        self.inner.state() == SessionState::Connected
            && self.inner.send_control(MessageType::AudioConfig, config)
    }

    pub fn send_audio_frame(&self, data: Bytes, capture_timestamp_ms: u64) -> bool {
        self.inner.state() == SessionState::Connected
            && self.inner.sender.send(MessageType::AudioFrame, data, Some(capture_timestamp_ms))
    }

    /// Client side: forward a local pointer event to the host.
    pub fn send_touch(&self, touch: &TouchEvent) -> bool {
        self.inner.state() == SessionState::Connected
            && self.inner.send_control(MessageType::TouchEvent, touch)
    }

    /// Client side: report delivery statistics to the host.
    pub fn send_feedback(&self, feedback: &ProtocolFeedback) -> bool {
        self.inner.state() == SessionState::Connected
            && self.inner.send_control(MessageType::ProtocolFeedback, feedback)
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().expect("session_id lock").clone()
    }

    pub fn peer(&self) -> Option<PeerDevice> {
        self.inner.peer.lock().expect("peer lock").clone()
    }

    pub async fn stats(&self) -> SessionStats {
        let transport: TransportStats = self
            .inner
            .transport
            .lock()
            .await
            .as_ref()
            .map(|t| t.stats())
            .unwrap_or_default();
        let rtt = self.inner.rtt.lock().expect("rtt lock");
        let sent = self.inner.last_heartbeat_sent_ms.load(Ordering::Relaxed);
        SessionStats {
            session_id: self.session_id(),
            state: self.inner.state(),
            ms_since_last_heartbeat: self.inner.elapsed_ms().saturating_sub(sent),
            last_rtt_ms: rtt.last_ms,
            avg_rtt_ms: rtt.avg_ms,
            send_count: transport.sent_count,
            recv_count: transport.received_count,
            dropped_count: transport.dropped_count,
        }
    }

    /// Explicitly end the session, flushing pending control traffic.
    pub async fn close(&self) {
        shutdown_session(&self.inner, true).await;
    }
}

// ── Heartbeat task ────────────────────────────────────────────────────────────

fn start_heartbeat(inner: &Arc<SessionInner>) {
    let (guard, shutdown) = Shutdown::channel();
    *inner.heartbeat_guard.lock().expect("heartbeat lock") = Some(guard);
    inner.last_rx_ms.store(inner.elapsed_ms(), Ordering::Relaxed);
    tokio::spawn(run_heartbeat(Arc::clone(inner), shutdown));
}

async fn run_heartbeat(inner: Arc<SessionInner>, mut shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {}
        }

        let idle_ms = inner.elapsed_ms().saturating_sub(inner.last_rx_ms.load(Ordering::Relaxed));
        if idle_ms > inner.config.heartbeat_timeout.as_millis() as u64 {
            warn!("no inbound traffic for {idle_ms}ms, closing session");
            inner.emit(SessionEvent::HeartbeatTimeout).await;
            shutdown_session(&inner, false).await;
            return;
        }

        if inner.send_control(MessageType::Heartbeat, &Heartbeat { timestamp_ms: now_ms() }) {
            inner.last_heartbeat_sent_ms.store(inner.elapsed_ms(), Ordering::Relaxed);
        }
    }
}

// ── Dispatch task ─────────────────────────────────────────────────────────────

async fn run_dispatch(
    inner: Arc<SessionInner>,
    role: SessionRole,
    sinks: SessionSinks,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = transport_rx.recv().await {
        match event {
            TransportEvent::Message { header, payload } => {
                inner.last_rx_ms.store(inner.elapsed_ms(), Ordering::Relaxed);
                dispatch_message(&inner, &role, &sinks, header, payload).await;
            }
            TransportEvent::Closed { error } => {
                match error {
                    None => {
                        debug!("peer closed the connection");
                        shutdown_session(&inner, true).await;
                    }
                    Some(e) => {
                        let err = SessionError::Transport(e);
                        warn!("session transport failed: {err}");
                        inner.emit(SessionEvent::Error(err)).await;
                        shutdown_session(&inner, false).await;
                    }
                }
                return;
            }
        }
    }
}

async fn dispatch_message(
    inner: &Arc<SessionInner>,
    role: &SessionRole,
    sinks: &SessionSinks,
    header: MessageHeader,
    payload: Bytes,
) {
    match header.kind {
        MessageType::Handshake => {
            let SessionRole::Server { policy } = role else {
                debug!("ignoring handshake on client session");
                return;
            };
            if inner.state() == SessionState::Connected {
                debug!("duplicate handshake ignored");
                return;
            }
            let request: HandshakeRequest = match decode_json(&payload) {
                Ok(r) => r,
                Err(e) => {
                    let err = SessionError::Protocol(format!("bad handshake payload: {e}"));
                    inner.emit(SessionEvent::Error(err)).await;
                    shutdown_session(inner, false).await;
                    return;
                }
            };
            inner.set_state(SessionState::PerformingHandshake);
            match policy.authorize(&request).await {
                Ok(()) => {
                    let session_id = uuid::Uuid::new_v4().to_string();
                    let ack =
                        HandshakeAck::accepted(session_id.clone(), inner.config.server_version.clone());
                    inner.send_control(MessageType::HandshakeAck, &ack);
                    *inner.session_id.lock().expect("session_id lock") = Some(session_id.clone());
                    let peer = PeerDevice {
                        device_id: request.device_id.clone(),
                        device_name: request.device_name.clone(),
                        client_version: request.client_version.clone(),
                        screen_width: request.screen_width,
                        screen_height: request.screen_height,
                    };
                    *inner.peer.lock().expect("peer lock") = Some(peer.clone());
                    inner.set_state(SessionState::Connected);
                    start_heartbeat(inner);
                    info!(
                        "device '{}' ({}) connected, session {}",
                        request.device_name, request.device_id, session_id
                    );
                    inner.emit(SessionEvent::Connected { session_id, peer: Some(peer) }).await;
                }
                Err(reason) => {
                    warn!("handshake from '{}' rejected: {reason}", request.device_id);
                    inner.send_control(MessageType::HandshakeAck, &HandshakeAck::rejected(reason.clone()));
                    inner.emit(SessionEvent::HandshakeRejected { reason }).await;
                    shutdown_session(inner, false).await;
                }
            }
        }
        MessageType::HandshakeAck => {
            match decode_json::<HandshakeAck>(&payload) {
                Ok(ack) => {
                    if let Some(tx) = inner.pending_ack.lock().expect("pending lock").take() {
                        let _ = tx.send(ack);
                    } else {
                        debug!("unsolicited handshake ack ignored");
                    }
                }
                Err(e) => {
                    let err = SessionError::Protocol(format!("bad handshake ack: {e}"));
                    inner.emit(SessionEvent::Error(err)).await;
                    shutdown_session(inner, false).await;
                }
            }
        }
        MessageType::Heartbeat => {
            if let Ok(hb) = decode_json::<Heartbeat>(&payload) {
                let ack = HeartbeatAck { original_timestamp_ms: hb.timestamp_ms, timestamp_ms: now_ms() };
                inner.send_control(MessageType::HeartbeatAck, &ack);
            }
        }
        MessageType::HeartbeatAck => {
            if let Ok(ack) = decode_json::<HeartbeatAck>(&payload) {
                let rtt_ms = now_ms().saturating_sub(ack.original_timestamp_ms) as f64;
                inner.rtt.lock().expect("rtt lock").record(rtt_ms);
            }
        }
        MessageType::TouchEvent => match decode_json::<TouchEvent>(&payload) {
            Ok(touch) => {
                if let Some(sink) = &sinks.touch {
                    sink.on_touch(touch);
                } else {
                    trace!("touch event dropped: no sink");
                }
            }
            Err(e) => debug!("bad touch payload skipped: {e}"),
        },
        MessageType::ProtocolFeedback => match decode_json::<ProtocolFeedback>(&payload) {
            Ok(feedback) => {
                if let Some(sink) = &sinks.feedback {
                    sink.on_feedback(feedback);
                } else {
                    trace!("feedback dropped: no sink");
                }
            }
            Err(e) => debug!("bad feedback payload skipped: {e}"),
        },
        MessageType::AudioConfig | MessageType::AudioFrame => {
            if let Some(audio) = &sinks.audio {
                let _ = audio.send(MediaFrame { header, payload }).await;
            }
        }
        MessageType::VideoFrame => {
            if let Some(media) = &sinks.media {
                let _ = media.send(MediaFrame { header, payload }).await;
            }
        }
        MessageType::DiscoveryRequest | MessageType::DiscoveryResponse => {
            // UDP-only types have no business on a session stream.
            trace!("discovery message on session stream skipped");
        }
        MessageType::Unknown(raw) => {
            trace!("unknown message type {raw} skipped ({} bytes)", payload.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expandscreen_protocol::{build_message, decode_header, encode_json, HEADER_LEN};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(30),
            heartbeat_timeout: Duration::from_millis(200),
            handshake_deadline: Duration::from_millis(300),
            ..Default::default()
        }
    }

    fn handshake_request() -> HandshakeRequest {
        HandshakeRequest {
            device_id: "a".into(),
            device_name: "A".into(),
            client_version: "1".into(),
            screen_width: 1920,
            screen_height: 1080,
            pairing_code: None,
        }
    }

    struct RecordingTouchSink(Mutex<Vec<TouchEvent>>);
    impl TouchSink for RecordingTouchSink {
        fn on_touch(&self, touch: TouchEvent) {
            self.0.lock().unwrap().push(touch);
        }
    }

    struct RecordingFeedbackSink(Mutex<Vec<ProtocolFeedback>>);
    impl FeedbackSink for RecordingFeedbackSink {
        fn on_feedback(&self, feedback: ProtocolFeedback) {
            self.0.lock().unwrap().push(feedback);
        }
    }

    struct RejectAll;
    #[async_trait]
    impl HandshakePolicy for RejectAll {
        async fn authorize(&self, _request: &HandshakeRequest) -> Result<(), String> {
            Err("not paired".into())
        }
    }

    fn session_pair(
        server_policy: Arc<dyn HandshakePolicy>,
        server_sinks: SessionSinks,
    ) -> (Session, mpsc::Receiver<SessionEvent>, Session, mpsc::Receiver<SessionEvent>) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let (client, client_events) =
            Session::attach(cr, cw, SessionRole::Client, fast_config(), SessionSinks::default());
        let (server, server_events) = Session::attach(
            sr,
            sw,
            SessionRole::Server { policy: server_policy },
            fast_config(),
            server_sinks,
        );
        (client, client_events, server, server_events)
    }

    #[tokio::test]
    async fn handshake_then_heartbeats_both_ways() {
        let (client, mut client_events, server, mut server_events) =
            session_pair(Arc::new(AcceptAll), SessionSinks::default());

        let session_id = client.perform_handshake(handshake_request()).await.expect("handshake");
        assert!(!session_id.is_empty());
        assert_eq!(client.state(), SessionState::Connected);

        match client_events.recv().await.expect("client event") {
            SessionEvent::Connected { session_id: sid, peer: None } => assert_eq!(sid, session_id),
            other => panic!("unexpected: {other:?}"),
        }
        match server_events.recv().await.expect("server event") {
            SessionEvent::Connected { peer: Some(peer), .. } => {
                assert_eq!(peer.device_id, "a");
                assert_eq!((peer.screen_width, peer.screen_height), (1920, 1080));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // A few heartbeat intervals: both directions must have exchanged
        // heartbeat/ack pairs, which shows up as RTT samples on both ends.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let cs = client.stats().await;
        let ss = server.stats().await;
        assert_eq!(cs.state, SessionState::Connected);
        assert_eq!(ss.state, SessionState::Connected);
        assert!(cs.send_count >= 2, "client sent {}", cs.send_count);
        assert!(ss.recv_count >= 2, "server received {}", ss.recv_count);
        assert!(client.inner.rtt.lock().unwrap().samples > 0, "client saw no heartbeat ack");
        assert!(server.inner.rtt.lock().unwrap().samples > 0, "server saw no heartbeat ack");
    }

    #[tokio::test]
    async fn rejected_handshake_reaches_both_sides() {
        let (client, _client_events, _server, mut server_events) =
            session_pair(Arc::new(RejectAll), SessionSinks::default());

        let err = client.perform_handshake(handshake_request()).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeRejected(ref r) if r == "not paired"));
        assert_eq!(client.state(), SessionState::Closed);

        match server_events.recv().await.expect("server event") {
            SessionEvent::HandshakeRejected { reason } => assert_eq!(reason, "not paired"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_deadline_applies() {
        // The far end never answers.
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (cr, cw) = tokio::io::split(client_io);
        let mut config = fast_config();
        config.handshake_deadline = Duration::from_millis(50);
        let (client, _events) =
            Session::attach(cr, cw, SessionRole::Client, config, SessionSinks::default());

        let err = client.perform_handshake(handshake_request()).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout));
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn touch_and_feedback_are_routed_to_sinks() {
        let touch_sink = Arc::new(RecordingTouchSink(Mutex::new(Vec::new())));
        let feedback_sink = Arc::new(RecordingFeedbackSink(Mutex::new(Vec::new())));
        let sinks = SessionSinks {
            touch: Some(touch_sink.clone()),
            feedback: Some(feedback_sink.clone()),
            ..Default::default()
        };
        let (client, _ce, _server, _se) = session_pair(Arc::new(AcceptAll), sinks);
        client.perform_handshake(handshake_request()).await.expect("handshake");

        assert!(client.send_touch(&TouchEvent { action: 0, pointer_id: 1, x: 10.0, y: 20.0, pressure: 1.0 }));
        assert!(client.send_feedback(&ProtocolFeedback {
            total_messages_delta: 100,
            dropped_messages_delta: 5,
            receive_rate_bps: 4_000_000,
            average_rtt_ms: 50.0,
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let touches = touch_sink.0.lock().unwrap();
        assert_eq!(touches.len(), 1);
        assert_eq!(touches[0].pointer_id, 1);
        let feedback = feedback_sink.0.lock().unwrap();
        assert_eq!(feedback.len(), 1);
        assert_eq!(feedback[0].total_messages_delta, 100);
    }

    #[tokio::test]
    async fn media_is_refused_before_connected() {
        let (_io, far) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(far);
        let (session, _events) =
            Session::attach(r, w, SessionRole::Client, fast_config(), SessionSinks::default());
        let frame = EncodedFrame {
            frame_number: 0,
            width: 1920,
            height: 1080,
            is_key_frame: true,
            data: Bytes::from_static(b"nal"),
            capture_timestamp_ms: 1,
        };
        assert!(!session.send_video(&frame));
        assert!(!session.send_audio_frame(Bytes::from_static(b"pcm"), 1));
    }

    #[tokio::test]
    async fn heartbeat_timeout_closes_a_silent_connection() {
        let (client_io, far_io) = tokio::io::duplex(4096);
        let (cr, cw) = tokio::io::split(client_io);
        let (mut fr, mut fw) = tokio::io::split(far_io);

        let mut config = fast_config();
        config.heartbeat_interval = Duration::from_millis(25);
        config.heartbeat_timeout = Duration::from_millis(120);
        let (client, mut events) =
            Session::attach(cr, cw, SessionRole::Client, config, SessionSinks::default());

        // Far end: answer the handshake by hand, then go silent while
        // keeping the stream open.
        let far = tokio::spawn(async move {
            let mut header = [0u8; HEADER_LEN];
            fr.read_exact(&mut header).await.unwrap();
            let parsed = decode_header(&header).unwrap();
            assert_eq!(parsed.kind, MessageType::Handshake);
            let mut payload = vec![0u8; parsed.payload_length as usize];
            fr.read_exact(&mut payload).await.unwrap();

            let ack = HandshakeAck::accepted("sid-1".into(), "1".into());
            let msg = build_message(MessageType::HandshakeAck, &encode_json(&ack).unwrap(), 0, None);
            fw.write_all(&msg).await.unwrap();

            // Hold both halves open so the client sees silence, not EOF.
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(fr);
            drop(fw);
        });

        client.perform_handshake(handshake_request()).await.expect("handshake");

        let mut saw_timeout = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        {
            match event {
                SessionEvent::HeartbeatTimeout => {
                    saw_timeout = true;
                    break;
                }
                SessionEvent::Connected { .. } => {}
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(saw_timeout, "expected a heartbeat timeout");
        assert_eq!(client.state(), SessionState::Closed);
        far.abort();
    }

    #[tokio::test]
    async fn unknown_message_types_are_skipped() {
        let (client_io, far_io) = tokio::io::duplex(4096);
        let (cr, cw) = tokio::io::split(client_io);
        let (_fr, mut fw) = tokio::io::split(far_io);

        let (client, _events) =
            Session::attach(cr, cw, SessionRole::Client, fast_config(), SessionSinks::default());

        let msg = build_message(MessageType::Unknown(42), b"whatever", 0, None);
        fw.write_all(&msg).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The stream survives unknown types.
        assert_ne!(client.state(), SessionState::Closed);
    }
}
