//! Host wiring: pairing identity, Wi-Fi accept loop, discovery, touch and
//! feedback plumbing.
//!
//! Configuration comes from the environment:
//!
//! | Variable             | Default        | Meaning                       |
//! |----------------------|----------------|-------------------------------|
//! | `EXPANDSCREEN_PORT`  | `15555`        | TCP accept port               |
//! | `EXPANDSCREEN_NAME`  | hostname-ish   | Advertised server name        |
//! | `EXPANDSCREEN_CERT`  | `expandscreen-cert.pem` | Pairing cert store   |
//! | `EXPANDSCREEN_TLS`   | `1`            | TLS-wrap the accept port      |

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use expandscreen_bitrate::{BitrateConfig, BitrateController};
use expandscreen_core::interfaces::{CertStore, TouchInjector};
use expandscreen_core::touch::{SlotRegistry, TargetRect, TouchMapper};
use expandscreen_core::MappedTouch;
use expandscreen_pairing::{PairingManager, PairingPolicy};
use expandscreen_session::{
    AcceptAll, FeedbackSink, HandshakePolicy, ProtocolFeedback, SessionEvent, SessionSinks,
};
use expandscreen_wifi::{MappedTouchSink, WifiConfig, WifiHost};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MAX_TOUCH_CONTACTS: usize = 10;

// ── Plain-file certificate store ──────────────────────────────────────────────

/// Development store: the platform adapter that supplies an encrypted
/// location replaces this in packaged builds.
struct FileCertStore {
    path: PathBuf,
}

impl CertStore for FileCertStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    fn save(&self, blob: &[u8]) -> Result<()> {
        std::fs::write(&self.path, blob).with_context(|| format!("writing {}", self.path.display()))
    }
}

// ── Placeholder adapters ──────────────────────────────────────────────────────

/// Stands in for the Windows touch-injection adapter.
struct LogTouchInjector;

impl TouchInjector for LogTouchInjector {
    fn handle(&self, touch: MappedTouch) {
        debug!("touch {:?} slot {} at ({:.0}, {:.0})", touch.action, touch.slot, touch.x, touch.y);
    }
}

/// Feeds delivery feedback into the bitrate controller and publishes
/// decisions for whichever pipeline is running.
struct ControllerFeedbackSink {
    controller: StdMutex<BitrateController>,
    decisions: mpsc::Sender<expandscreen_bitrate::BitrateDecision>,
}

impl FeedbackSink for ControllerFeedbackSink {
    fn on_feedback(&self, feedback: ProtocolFeedback) {
        let decision = self.controller.lock().expect("controller lock").on_feedback(&feedback);
        if decision.changed {
            info!("bitrate target {} bps ({})", decision.target_bps, decision.reason);
            let _ = self.decisions.try_send(decision);
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

struct HostOptions {
    port: u16,
    server_name: String,
    cert_path: PathBuf,
    enable_tls: bool,
}

impl HostOptions {
    fn from_env() -> Self {
        let port = std::env::var("EXPANDSCREEN_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(expandscreen_wifi::DEFAULT_TCP_PORT);
        let server_name = std::env::var("EXPANDSCREEN_NAME").unwrap_or_else(|_| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "ExpandScreen".to_owned())
        });
        let cert_path = std::env::var("EXPANDSCREEN_CERT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("expandscreen-cert.pem"));
        let enable_tls = std::env::var("EXPANDSCREEN_TLS").map(|v| v != "0").unwrap_or(true);
        Self { port, server_name, cert_path, enable_tls }
    }
}

// ── Main loop ─────────────────────────────────────────────────────────────────

pub async fn run() -> Result<()> {
    let options = HostOptions::from_env();

    let pairing = Arc::new(
        PairingManager::load_or_generate(Arc::new(FileCertStore { path: options.cert_path.clone() }))
            .context("pairing certificate")?,
    );
    let identity = pairing.current();

    info!("╔══════════════════════════════════════╗");
    info!("║  ExpandScreen pairing code:  {}  ║", identity.pairing_code());
    info!("╚══════════════════════════════════════╝");
    info!("Certificate fingerprint: {}", identity.fingerprint_hex());

    // Touch path: remote pixels → host monitor rectangle → injector.
    // The target rectangle is updated once the virtual monitor exists.
    let mapper = Arc::new(StdMutex::new(TouchMapper::new(
        1080,
        2400,
        TargetRect::new(0.0, 0.0, 1920.0, 1080.0),
        0,
    )));
    let slots = Arc::new(StdMutex::new(SlotRegistry::new(MAX_TOUCH_CONTACTS)));
    let touch_sink =
        Arc::new(MappedTouchSink::new(Arc::clone(&mapper), slots, Arc::new(LogTouchInjector)));

    let (decision_tx, mut decision_rx) = mpsc::channel(16);
    let feedback_sink = Arc::new(ControllerFeedbackSink {
        controller: StdMutex::new(BitrateController::new(BitrateConfig::default(), 8_000_000)),
        decisions: decision_tx,
    });

    let sinks = SessionSinks {
        touch: Some(touch_sink),
        feedback: Some(feedback_sink),
        ..Default::default()
    };

    let (acceptor, policy): (_, Arc<dyn HandshakePolicy>) = if options.enable_tls {
        (Some(identity.acceptor()?), Arc::new(PairingPolicy::new(Arc::clone(&pairing))))
    } else {
        warn!("TLS disabled: sessions are unencrypted and unpaired");
        (None, Arc::new(AcceptAll))
    };

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let host = WifiHost::start(
        WifiConfig {
            tcp_port: options.port,
            server_id: format!("{:016x}", rand::random::<u64>()),
            server_name: options.server_name.clone(),
            ..Default::default()
        },
        acceptor,
        policy,
        sinks,
        events_tx,
        None,
    )
    .await?;

    info!("Waiting for a device on tcp/{} …", host.port());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down…");
                host.stop().await;
                return Ok(());
            }
            decision = decision_rx.recv() => {
                if let Some(decision) = decision {
                    debug!("bitrate decision pending pipeline pickup: {} bps", decision.target_bps);
                }
            }
            event = events_rx.recv() => {
                let Some(event) = event else { continue };
                match event {
                    SessionEvent::Connected { session_id, peer } => {
                        if let Some(peer) = &peer {
                            mapper
                                .lock()
                                .expect("mapper lock")
                                .set_source(peer.screen_width, peer.screen_height);
                            info!(
                                "'{}' connected ({}×{}), session {session_id}",
                                peer.device_name, peer.screen_width, peer.screen_height
                            );
                        } else {
                            info!("session {session_id} connected");
                        }
                    }
                    SessionEvent::HandshakeRejected { reason } => warn!("handshake rejected: {reason}"),
                    SessionEvent::HeartbeatTimeout => warn!("device stopped responding"),
                    SessionEvent::Error(e) => warn!("session error: {e}"),
                    SessionEvent::Closed => info!("session closed"),
                }
            }
        }
    }
}
