//! expandscreen-pipeline — one device's capture → encode → send loop.
//!
//! ```text
//! CaptureSource ──► 2-slot queue (drop oldest) ──► Encoder ──► Session
//!                                                     ▲
//!                              bitrate decisions ─────┘ (set_bitrate + key frame)
//! ```
//!
//! Latency beats completeness: when the encoder falls behind, the oldest
//! captured frame is discarded rather than queued. The capture timestamp
//! rides through the encoder and into the message header so the handheld
//! can measure true end-to-end latency.
//!
//! The pipeline is started only once its session is connected, and a key
//! frame is requested at start, on every published bitrate decision, and
//! whenever the profile changes (a profile change is a pipeline restart).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use expandscreen_bitrate::BitrateDecision;
use expandscreen_core::interfaces::{CaptureSource, Encoder};
use expandscreen_core::shutdown::{Shutdown, ShutdownGuard};
use expandscreen_core::{EncodedFrame, RawFrame, VideoProfile};
use expandscreen_session::{Session, SessionState};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

// ── Capture queue ─────────────────────────────────────────────────────────────

/// Frames the capture→encode queue holds before dropping the oldest.
const CAPTURE_QUEUE_DEPTH: usize = 2;

struct FrameQueue {
    frames: Mutex<VecDeque<RawFrame>>,
    notify: Notify,
    depth: usize,
    dropped: AtomicU64,
}

impl FrameQueue {
    fn new(depth: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: RawFrame) {
        {
            let mut frames = self.frames.lock().expect("frame queue lock");
            if frames.len() >= self.depth {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> RawFrame {
        loop {
            if let Some(frame) = self.frames.lock().expect("frame queue lock").pop_front() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── FpsCounter ────────────────────────────────────────────────────────────────

struct FpsCounter {
    timestamps: VecDeque<Instant>,
}

impl FpsCounter {
    fn new() -> Self {
        Self { timestamps: VecDeque::with_capacity(128) }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.timestamps.push_back(now);
        while self.timestamps.front().is_some_and(|t| now - *t > Duration::from_secs(1)) {
            self.timestamps.pop_front();
        }
    }

    fn fps(&self) -> f32 {
        self.timestamps.len() as f32
    }
}

// ── StreamPipeline ────────────────────────────────────────────────────────────

/// Periodic pipeline status for observers.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub fps: f32,
}

/// Handle to a running pipeline. Dropping it (or calling [`stop`]) winds
/// the tasks down and releases the encoder.
///
/// [`stop`]: StreamPipeline::stop
pub struct StreamPipeline {
    guard: ShutdownGuard,
    frames_sent: Arc<AtomicU64>,
    queue: Arc<FrameQueue>,
}

impl StreamPipeline {
    /// Spawn the capture and encode tasks for a connected session.
    ///
    /// `bitrate_rx` carries published bitrate decisions; each one is applied
    /// to the encoder together with a key-frame request so the receiver
    /// resynchronises immediately.
    pub fn spawn(
        capture: Box<dyn CaptureSource>,
        encoder: Box<dyn Encoder>,
        session: Session,
        profile: VideoProfile,
        bitrate_rx: mpsc::Receiver<BitrateDecision>,
        status_tx: Option<mpsc::Sender<PipelineStatus>>,
    ) -> Self {
        debug_assert_eq!(session.state(), SessionState::Connected);
        let (guard, shutdown) = Shutdown::channel();
        let frames_sent = Arc::new(AtomicU64::new(0));
        let queue = Arc::new(FrameQueue::new(CAPTURE_QUEUE_DEPTH));

        tokio::spawn(run_capture(capture, Arc::clone(&queue), shutdown.clone()));
        tokio::spawn(run_encode(
            encoder,
            Arc::clone(&queue),
            session,
            profile,
            bitrate_rx,
            status_tx,
            Arc::clone(&frames_sent),
            shutdown,
        ));

        Self { guard, frames_sent, queue }
    }

    pub fn stop(&self) {
        self.guard.trigger();
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

// ── Capture task ──────────────────────────────────────────────────────────────

async fn run_capture(mut capture: Box<dyn CaptureSource>, queue: Arc<FrameQueue>, cancel: Shutdown) {
    loop {
        if cancel.is_triggered() {
            return;
        }
        match capture.next_frame(&cancel).await {
            Ok(Some(frame)) => queue.push(frame),
            Ok(None) => {
                debug!("capture source ended");
                return;
            }
            Err(e) => {
                warn!("capture failed: {e:#}");
                return;
            }
        }
    }
}

// ── Encode task ───────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_encode(
    mut encoder: Box<dyn Encoder>,
    queue: Arc<FrameQueue>,
    session: Session,
    profile: VideoProfile,
    mut bitrate_rx: mpsc::Receiver<BitrateDecision>,
    status_tx: Option<mpsc::Sender<PipelineStatus>>,
    frames_sent: Arc<AtomicU64>,
    mut shutdown: Shutdown,
) {
    // Every new session starts on a key frame.
    encoder.request_key_frame();
    info!("pipeline streaming at {}", profile.summary());

    let mut frame_number: u64 = 0;
    let mut fps = FpsCounter::new();
    let mut status_ticker = tokio::time::interval(Duration::from_secs(1));
    status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            decision = bitrate_rx.recv() => {
                let Some(decision) = decision else { break };
                if decision.changed {
                    debug!("applying bitrate {} ({})", decision.target_bps, decision.reason);
                    encoder.set_bitrate(decision.target_bps);
                    encoder.request_key_frame();
                }
            }

            raw = queue.pop() => {
                let capture_timestamp_ms = raw.capture_timestamp_ms;
                match encoder.encode(&raw) {
                    Ok(Some(unit)) => {
                        let frame = EncodedFrame {
                            frame_number,
                            width: raw.width,
                            height: raw.height,
                            is_key_frame: unit.is_key_frame,
                            data: unit.data,
                            capture_timestamp_ms,
                        };
                        frame_number += 1;
                        if session.send_video(&frame) {
                            frames_sent.fetch_add(1, Ordering::Relaxed);
                            fps.tick();
                        }
                    }
                    Ok(None) => {} // codec is buffering
                    Err(e) => {
                        warn!("encode failed: {e:#}");
                        break;
                    }
                }
            }

            _ = status_ticker.tick() => {
                if let Some(tx) = &status_tx {
                    let _ = tx.try_send(PipelineStatus {
                        frames_sent: frames_sent.load(Ordering::Relaxed),
                        frames_dropped: queue.dropped(),
                        fps: fps.fps(),
                    });
                }
                if session.state() != SessionState::Connected {
                    debug!("session left Connected, stopping pipeline");
                    break;
                }
            }
        }
    }

    encoder.release();
    info!("pipeline stopped after {} frames", frames_sent.load(Ordering::Relaxed));
}
