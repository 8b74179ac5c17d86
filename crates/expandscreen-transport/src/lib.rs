//! expandscreen-transport — framed messages over one reliable byte stream.
//!
//! ```text
//! FrameSender ──► send queue (bounded, drop-oldest-non-control)
//!                     │ writer task: assign seq → frame → write → flush
//!                     ▼
//!                byte stream
//!                     │ reader task: 24-byte header → payload → event
//!                     ▼
//!            mpsc::Receiver<TransportEvent>
//! ```
//!
//! The queue is the sole synchronisation point between producers and the
//! writer. Enqueue never blocks: when the queue is full the oldest
//! non-control entry is evicted so video stays fresh, while handshake and
//! heartbeat messages are never dropped. Sequence numbers are assigned at
//! dequeue time so they stay dense after drops.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use expandscreen_core::TransportError;
use expandscreen_protocol::{
    build_message, decode_header, MessageHeader, MessageType, HEADER_LEN,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Send queue capacity in messages.
    pub send_queue_capacity: usize,
    /// Queue latency above which a warning is logged.
    pub queue_latency_warn: Duration,
    /// How long `close` waits for the writer to drain before dropping.
    pub close_flush_deadline: Duration,
    /// Capacity of the inbound event channel.
    pub inbound_channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: 1000,
            queue_latency_warn: Duration::from_millis(100),
            close_flush_deadline: Duration::from_millis(500),
            inbound_channel_capacity: 256,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything the reader side produces, on one typed channel.
#[derive(Debug)]
pub enum TransportEvent {
    Message { header: MessageHeader, payload: Bytes },
    /// Stream ended. `error: None` is a clean peer close (EOF); `Some` is a
    /// wire or IO failure.
    Closed { error: Option<TransportError> },
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct StatsInner {
    sent_count: AtomicU64,
    received_count: AtomicU64,
    dropped_count: AtomicU64,
    queued_bytes: AtomicU64,
    last_queue_latency_ms: AtomicU64,
    send_seq: AtomicU32,
    recv_seq_gaps: AtomicU64,
    queue_running_late: AtomicBool,
}

/// Point-in-time snapshot of the transport's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent_count: u64,
    pub received_count: u64,
    pub dropped_count: u64,
    pub queued_bytes: u64,
    pub last_queue_latency_ms: u64,
    pub send_seq: u32,
    pub recv_seq_gaps: u64,
}

impl StatsInner {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            sent_count: self.sent_count.load(Ordering::Relaxed),
            received_count: self.received_count.load(Ordering::Relaxed),
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
            queued_bytes: self.queued_bytes.load(Ordering::Relaxed),
            last_queue_latency_ms: self.last_queue_latency_ms.load(Ordering::Relaxed),
            send_seq: self.send_seq.load(Ordering::Relaxed),
            recv_seq_gaps: self.recv_seq_gaps.load(Ordering::Relaxed),
        }
    }
}

// ── Send queue ────────────────────────────────────────────────────────────────

struct QueuedMessage {
    kind: MessageType,
    payload: Bytes,
    timestamp_override: Option<u64>,
    enqueued_at: Instant,
}

struct QueueInner {
    entries: VecDeque<QueuedMessage>,
    closed: bool,
}

struct SendShared {
    queue: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    stats: Arc<StatsInner>,
}

impl SendShared {
    fn new(capacity: usize, stats: Arc<StatsInner>) -> Self {
        Self {
            queue: Mutex::new(QueueInner { entries: VecDeque::new(), closed: false }),
            notify: Notify::new(),
            capacity,
            stats,
        }
    }

    /// Admit one message. Returns `false` when it could not be queued.
    ///
    /// At capacity, the oldest non-control entry is evicted to make room.
    /// If only control entries remain, a non-control newcomer is refused
    /// and a control newcomer is admitted regardless.
    fn admit(&self, kind: MessageType, payload: Bytes, timestamp_override: Option<u64>) -> bool {
        let mut q = self.queue.lock().expect("send queue poisoned");
        if q.closed {
            return false;
        }
        if q.entries.len() >= self.capacity {
            if let Some(victim_idx) = q.entries.iter().position(|m| !m.kind.is_control()) {
                let victim = q.entries.remove(victim_idx).expect("index just found");
                self.stats.queued_bytes.fetch_sub(victim.payload.len() as u64, Ordering::Relaxed);
                self.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
                trace!("send queue full: evicted {:?} ({} bytes)", victim.kind, victim.payload.len());
            } else if !kind.is_control() {
                self.stats.dropped_count.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        self.stats.queued_bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        q.entries.push_back(QueuedMessage { kind, payload, timestamp_override, enqueued_at: Instant::now() });
        drop(q);
        self.notify.notify_one();
        true
    }

    fn pop(&self) -> Option<QueuedMessage> {
        let mut q = self.queue.lock().expect("send queue poisoned");
        let msg = q.entries.pop_front()?;
        self.stats.queued_bytes.fetch_sub(msg.payload.len() as u64, Ordering::Relaxed);
        Some(msg)
    }

    fn is_drained(&self) -> bool {
        let q = self.queue.lock().expect("send queue poisoned");
        q.closed && q.entries.is_empty()
    }

    fn close(&self) {
        self.queue.lock().expect("send queue poisoned").closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

// ── FrameSender ───────────────────────────────────────────────────────────────

/// Cloneable enqueue handle. Safe from any task; never blocks.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<SendShared>,
}

impl FrameSender {
    /// Queue one message. `timestamp_override` preserves media capture time.
    /// Returns `false` if the message was refused (queue closed, or full of
    /// control traffic).
    pub fn send(&self, kind: MessageType, payload: Bytes, timestamp_override: Option<u64>) -> bool {
        self.shared.admit(kind, payload, timestamp_override)
    }
}

// ── FrameTransport ────────────────────────────────────────────────────────────

/// Owns the writer and reader tasks for one byte stream.
pub struct FrameTransport {
    sender: FrameSender,
    shared: Arc<SendShared>,
    stats: Arc<StatsInner>,
    config: TransportConfig,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl FrameTransport {
    /// Start writer + reader tasks over the given stream halves. Inbound
    /// messages and the terminal `Closed` event arrive on `events`.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        events: mpsc::Sender<TransportEvent>,
        config: TransportConfig,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let stats = Arc::new(StatsInner::default());
        let shared = Arc::new(SendShared::new(config.send_queue_capacity, Arc::clone(&stats)));

        let writer_task = tokio::spawn(run_writer(
            writer,
            Arc::clone(&shared),
            Arc::clone(&stats),
            events.clone(),
            config.queue_latency_warn,
        ));
        let reader_task = tokio::spawn(run_reader(reader, Arc::clone(&stats), events));

        Self {
            sender: FrameSender { shared: Arc::clone(&shared) },
            shared,
            stats,
            config,
            writer_task,
            reader_task,
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    /// Stop both loops. Pending queued messages are flushed for up to the
    /// configured deadline, then dropped.
    pub async fn close(self) {
        self.shared.close();
        let deadline = self.config.close_flush_deadline;
        let shared = Arc::clone(&self.shared);
        let drained = tokio::time::timeout(deadline, async move {
            while !shared.is_drained() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("transport close: flush deadline elapsed with messages pending");
        }
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

// ── Writer loop ───────────────────────────────────────────────────────────────

async fn run_writer<W>(
    mut writer: W,
    shared: Arc<SendShared>,
    stats: Arc<StatsInner>,
    events: mpsc::Sender<TransportEvent>,
    latency_warn: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = loop {
            if let Some(msg) = shared.pop() {
                break msg;
            }
            if shared.is_drained() {
                let _ = writer.shutdown().await;
                return;
            }
            shared.notify.notified().await;
        };

        // Sequence numbers are assigned here, not at enqueue, so drops do
        // not leave gaps in the outbound direction. Wraps at u32::MAX.
        let seq = stats.send_seq.fetch_add(1, Ordering::Relaxed);

        let latency = msg.enqueued_at.elapsed();
        stats.last_queue_latency_ms.store(latency.as_millis() as u64, Ordering::Relaxed);
        if latency > latency_warn {
            if !stats.queue_running_late.swap(true, Ordering::Relaxed) {
                warn!("send queue latency {}ms exceeds {}ms", latency.as_millis(), latency_warn.as_millis());
            }
        } else {
            stats.queue_running_late.store(false, Ordering::Relaxed);
        }

        let buf = build_message(msg.kind, &msg.payload, seq, msg.timestamp_override);
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                stats.sent_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.close();
                let _ = events.send(TransportEvent::Closed { error: Some(TransportError::Io(e)) }).await;
                return;
            }
        }
    }
}

// ── Reader loop ───────────────────────────────────────────────────────────────

async fn run_reader<R>(mut reader: R, stats: Arc<StatsInner>, events: mpsc::Sender<TransportEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    let mut last_seq: Option<u32> = None;

    let error = loop {
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break None,
            Err(e) => break Some(TransportError::Io(e)),
        }

        let header = match decode_header(&header_buf) {
            Ok(h) => h,
            Err(e) => break Some(TransportError::Wire(e)),
        };

        let mut payload = vec![0u8; header.payload_length as usize];
        match reader.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break None,
            Err(e) => break Some(TransportError::Io(e)),
        }

        stats.received_count.fetch_add(1, Ordering::Relaxed);
        if let Some(last) = last_seq {
            let expected = last.wrapping_add(1);
            if header.sequence_number != expected && header.sequence_number > expected {
                // A decrease is a wrap, not a gap.
                let gap = header.sequence_number - expected;
                stats.recv_seq_gaps.fetch_add(gap as u64, Ordering::Relaxed);
                debug!("inbound sequence gap: expected {}, got {}", expected, header.sequence_number);
            }
        }
        last_seq = Some(header.sequence_number);

        if events
            .send(TransportEvent::Message { header, payload: Bytes::from(payload) })
            .await
            .is_err()
        {
            // Consumer went away; nothing left to do.
            return;
        }
    };

    let _ = events.send(TransportEvent::Closed { error }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use expandscreen_core::WireError;
    use expandscreen_protocol::MAX_PAYLOAD_LEN;

    fn stats() -> Arc<StatsInner> {
        Arc::new(StatsInner::default())
    }

    #[test]
    fn queue_evicts_oldest_non_control_at_capacity() {
        let st = stats();
        let q = SendShared::new(3, Arc::clone(&st));
        assert!(q.admit(MessageType::VideoFrame, Bytes::from_static(b"v0"), None));
        assert!(q.admit(MessageType::Heartbeat, Bytes::from_static(b"hb"), None));
        assert!(q.admit(MessageType::VideoFrame, Bytes::from_static(b"v1"), None));
        // Full. The next video frame evicts v0, not the heartbeat.
        assert!(q.admit(MessageType::VideoFrame, Bytes::from_static(b"v2"), None));
        assert_eq!(st.dropped_count.load(Ordering::Relaxed), 1);

        let kinds: Vec<MessageType> = std::iter::from_fn(|| q.pop().map(|m| m.kind)).collect();
        assert_eq!(
            kinds,
            vec![MessageType::Heartbeat, MessageType::VideoFrame, MessageType::VideoFrame]
        );
        assert_eq!(st.queued_bytes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn queue_never_exceeds_capacity_for_non_control() {
        let st = stats();
        let q = SendShared::new(2, Arc::clone(&st));
        for i in 0..10u8 {
            q.admit(MessageType::VideoFrame, Bytes::copy_from_slice(&[i]), None);
        }
        assert_eq!(q.queue.lock().unwrap().entries.len(), 2);
        assert_eq!(st.dropped_count.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn control_is_never_dropped() {
        let st = stats();
        let q = SendShared::new(2, Arc::clone(&st));
        assert!(q.admit(MessageType::Handshake, Bytes::new(), None));
        assert!(q.admit(MessageType::Heartbeat, Bytes::new(), None));
        // Full of control: video is refused, control is still admitted.
        assert!(!q.admit(MessageType::VideoFrame, Bytes::new(), None));
        assert!(q.admit(MessageType::HeartbeatAck, Bytes::new(), None));
        let kinds: Vec<MessageType> = std::iter::from_fn(|| q.pop().map(|m| m.kind)).collect();
        assert!(kinds.iter().all(|k| k.is_control()));
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn closed_queue_refuses() {
        let q = SendShared::new(2, stats());
        q.close();
        assert!(!q.admit(MessageType::Heartbeat, Bytes::new(), None));
    }

    #[tokio::test]
    async fn messages_arrive_in_order_with_dense_sequences() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, _sw) = tokio::io::split(server);

        let (tx, mut rx) = mpsc::channel(64);
        let transport = FrameTransport::spawn(cr, cw, mpsc::channel(8).0, TransportConfig::default());
        let _reader_side = FrameTransport::spawn(sr, tokio::io::sink(), tx, TransportConfig::default());

        for i in 0..5u8 {
            assert!(transport.sender().send(
                MessageType::VideoFrame,
                Bytes::copy_from_slice(&[i]),
                Some(1000 + i as u64),
            ));
        }

        for i in 0..5u8 {
            let event = rx.recv().await.expect("message expected");
            match event {
                TransportEvent::Message { header, payload } => {
                    assert_eq!(header.sequence_number, i as u32);
                    assert_eq!(header.timestamp_ms, 1000 + i as u64);
                    assert_eq!(payload.as_ref(), &[i]);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(transport.stats().sent_count >= 5);
    }

    #[tokio::test]
    async fn oversized_inbound_payload_is_fatal() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (sr, _sw) = tokio::io::split(server);
        let (tx, mut rx) = mpsc::channel(8);
        let _t = FrameTransport::spawn(sr, tokio::io::sink(), tx, TransportConfig::default());

        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&expandscreen_protocol::MAGIC.to_be_bytes());
        header[4] = MessageType::VideoFrame.to_u8();
        header[5] = 1;
        header[16..20].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        client.write_all(&header).await.unwrap();

        match rx.recv().await.expect("closed event") {
            TransportEvent::Closed { error: Some(TransportError::Wire(WireError::PayloadTooLarge { .. })) } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_is_a_clean_close() {
        let (client, server) = tokio::io::duplex(4096);
        let (sr, _sw) = tokio::io::split(server);
        let (tx, mut rx) = mpsc::channel(8);
        let _t = FrameTransport::spawn(sr, tokio::io::sink(), tx, TransportConfig::default());

        drop(client);
        match rx.recv().await.expect("closed event") {
            TransportEvent::Closed { error: None } => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sequence_gaps_are_counted_not_fatal() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (sr, _sw) = tokio::io::split(server);
        let (tx, mut rx) = mpsc::channel(8);
        let t = FrameTransport::spawn(sr, tokio::io::sink(), tx, TransportConfig::default());

        for seq in [0u32, 1, 5] {
            let msg = build_message(MessageType::Heartbeat, b"{}", seq, Some(0));
            client.write_all(&msg).await.unwrap();
        }
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                TransportEvent::Message { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(t.stats().recv_seq_gaps, 3);
        assert_eq!(t.stats().received_count, 3);
    }
}
