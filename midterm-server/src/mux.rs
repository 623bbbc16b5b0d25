//! `MuxClient` (§4.5): one instance per attached browser WebSocket. Fans
//! session output in, multiplexes it onto the single WS connection, and
//! relays input/resize/buffer requests back to the right `HostClient`.
//!
//! Queue and drop-oldest behavior is grounded on the teacher's
//! `RingBuffer` (`broker/ring_buffer.rs`) generalized from bytes to whole
//! frames; per-session broadcast fan-in follows `state.rs`'s
//! `broadcast_to_browsers`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use midterm_proto::mux::MuxFrame;
use midterm_proto::session::{SessionId, SessionInfo};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::host_client::{HostClient, HostClientEvent};
use crate::registry::SessionRegistry;

/// Per-client queue bound (§4.5).
const QUEUE_CAP: usize = 1000;
/// Frames whose raw payload exceeds this are sent gzip-compressed (§4.5).
const COMPRESSION_THRESHOLD: usize = 2048;
/// Chunk size for buffer replay streaming, both at attach and resync (§4.5).
const REPLAY_CHUNK: usize = 32 * 1024;

/// Bounded MPSC-shaped queue of already-encoded outbound mux frames, with
/// drop-oldest-on-overflow and a "has anything been dropped since last
/// check" transition flag (§4.5, §8 property 2).
pub struct MuxQueue {
    frames: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
    dropped_since_check: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl MuxQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(QUEUE_CAP.min(64))),
            notify: Notify::new(),
            dropped_since_check: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn push(&self, frame: Vec<u8>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut frames = self.frames.lock().expect("mux queue lock poisoned");
        if frames.len() >= QUEUE_CAP {
            frames.pop_front();
            self.dropped_since_check.fetch_add(1, Ordering::AcqRel);
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
    }

    /// Waits for and removes the next frame, or `None` once closed with an
    /// empty queue.
    pub async fn pop(&self) -> Option<Vec<u8>> {
        loop {
            {
                let mut frames = self.frames.lock().expect("mux queue lock poisoned");
                if let Some(frame) = frames.pop_front() {
                    return Some(frame);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Discards everything queued; used when the socket is no longer Open
    /// (§8 property 10 "discarded without deadlock").
    pub fn close_and_drain(&self) {
        self.closed.store(true, Ordering::Release);
        self.frames.lock().expect("mux queue lock poisoned").clear();
        self.notify.notify_waiters();
    }

    /// `true`, and resets to `false`, iff at least one frame has been
    /// dropped since the last call (§4.5 resync trigger).
    pub fn take_drop_transition(&self) -> bool {
        self.dropped_since_check.swap(0, Ordering::AcqRel) > 0
    }
}

impl Default for MuxQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one session Output chunk, choosing plain vs. gzip per the
/// 2048-byte threshold (§4.5). Splits at `REPLAY_CHUNK` boundaries first;
/// callers needing chunked replay should call this per-chunk.
#[must_use]
pub fn encode_output(session: &SessionId, cols: u16, rows: u16, data: &[u8]) -> Vec<u8> {
    if data.len() > COMPRESSION_THRESHOLD {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fastest());
        use std::io::Write;
        let _ = encoder.write_all(data);
        if let Ok(gzipped) = encoder.finish() {
            return MuxFrame::CompressedOutput {
                session: session.clone(),
                cols,
                rows,
                uncompressed_len: data.len() as u32,
                data: gzipped,
            }
            .encode();
        }
    }
    MuxFrame::Output { session: session.clone(), cols, rows, data: data.to_vec() }.encode()
}

/// Splits `data` into `MuxFrame::Output`-encoded chunks of at most
/// `REPLAY_CHUNK` bytes, for buffer replay on attach/resync/`BufferRequest`
/// (§4.5 "streams it back ... in chunks of 32 KiB").
#[must_use]
pub fn replay_chunks(session: &SessionId, cols: u16, rows: u16, data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    data.chunks(REPLAY_CHUNK).map(|chunk| encode_output(session, cols, rows, chunk)).collect()
}

fn session_state_frame(session: &SessionId, created: bool) -> Vec<u8> {
    MuxFrame::SessionState { session: session.clone(), created }.encode()
}

/// Drives one attached browser WebSocket's session fan-in, buffer replay,
/// and resync bookkeeping (§4.5). The actual socket read/write loop lives
/// in the HTTP layer; this is the transport-agnostic half.
pub struct MuxRuntime {
    queue: Arc<MuxQueue>,
    registry: SessionRegistry,
    cancel: CancellationToken,
}

impl MuxRuntime {
    /// `shutdown` is the registry's process-wide root token; this
    /// runtime's own `cancel` is a child of it so a server-wide shutdown
    /// tears it down the same way an individual socket close does (§11).
    #[must_use]
    pub fn new(registry: SessionRegistry, shutdown: &CancellationToken) -> Arc<Self> {
        Arc::new(Self { queue: Arc::new(MuxQueue::new()), registry, cancel: shutdown.child_token() })
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<MuxQueue> {
        &self.queue
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Begin fanning in every currently known session plus any created
    /// later, for the lifetime of this runtime (§4.5 attach handshake).
    pub fn start(self: &Arc<Self>) {
        for client in self.registry.all_clients() {
            self.spawn_fan_in(client, false);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut created = this.registry.subscribe_created();
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => return,
                    result = created.recv() => match result {
                        Ok(client) => this.spawn_fan_in(client, true),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    },
                }
            }
        });
    }

    /// `announce` is true for a session discovered after this runtime
    /// started (§12 open question 2: "delivered via a live SessionState
    /// push with no guaranteed ordering relative to the initial-buffer
    /// pass"); the initial `all_clients()` walk in `start()` already
    /// covers those sessions via the attach handshake's buffer replay, so
    /// it passes false.
    fn spawn_fan_in(self: &Arc<Self>, client: Arc<HostClient>, announce: bool) {
        if announce {
            self.queue.push(session_state_frame(client.session_id(), true));
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = client.subscribe();
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => return,
                    result = events.recv() => {
                        let Ok(event) = result else { return };
                        this.handle_event(&event, &client).await;
                    }
                }
            }
        });
    }

    /// Only `Closed` and `StateChanged` have a wire representation
    /// (§4.5 SessionState is a 1-byte created/closed flag). A `StateChanged`
    /// triggers a `GetInfo` round-trip to refresh the registry's cached
    /// `SessionInfo` before announcing it as a fresh `created` frame;
    /// process/foreground changes and resize acks otherwise have no mux
    /// frame of their own and are observed via the next `GET /api/sessions`.
    async fn handle_event(&self, event: &HostClientEvent, client: &Arc<HostClient>) {
        match event {
            HostClientEvent::Output { session, cols, rows, data } => {
                self.queue.push(encode_output(session, *cols, *rows, data));
            }
            HostClientEvent::Closed { session } => {
                self.queue.push(session_state_frame(session, false));
            }
            HostClientEvent::StateChanged { session } => {
                if client.get_info().await.is_ok() {
                    self.queue.push(session_state_frame(session, true));
                }
            }
            HostClientEvent::ProcessEvent { .. }
            | HostClientEvent::ForegroundChanged { .. }
            | HostClientEvent::Reconnected { .. }
            | HostClientEvent::Disconnected { .. } => {}
        }
    }

    /// Stream every session's current buffer to the queue in 32 KiB
    /// chunks, used both at attach and after a resync trigger (§4.5).
    pub async fn send_all_buffers(&self) {
        for client in self.registry.all_clients() {
            self.send_one_buffer(&client).await;
        }
    }

    async fn send_one_buffer(&self, client: &Arc<HostClient>) {
        let Some(info) = client.cached_info() else { return };
        let Ok(buffer) = client.get_buffer().await else { return };
        for chunk in replay_chunks(client.session_id(), info.cols, info.rows, &buffer) {
            self.queue.push(chunk);
        }
    }

    /// Route one client-originated frame to the right `HostClient` (§4.5).
    pub async fn handle_inbound(&self, frame: MuxFrame) {
        match frame {
            MuxFrame::Input { session, data } => {
                if let Some(client) = self.registry.get(&session) {
                    client.send_input(data).await;
                }
            }
            MuxFrame::Resize { session, cols, rows } => {
                if let Some(client) = self.registry.get(&session) {
                    client.resize(cols, rows).await;
                }
            }
            MuxFrame::BufferRequest { session } => {
                if let Some(client) = self.registry.get(&session) {
                    self.send_one_buffer(&client).await;
                }
            }
            _ => tracing::warn!("ignoring unexpected client-to-server mux frame"),
        }
    }

    /// Called after each inbound client message (§4.5 "the quiet moments").
    /// If frames were dropped since the last check, resync from scratch.
    pub async fn maybe_resync(&self) {
        if !self.queue.take_drop_transition() {
            return;
        }
        self.queue.push(MuxFrame::Resync { session: SessionId::all_zero() }.encode());
        self.send_all_buffers().await;
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.queue.close_and_drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drops_oldest_on_overflow_and_flags_the_transition() {
        let queue = MuxQueue::new();
        for i in 0..QUEUE_CAP {
            queue.push(vec![i as u8]);
        }
        assert!(!queue.take_drop_transition());
        queue.push(vec![0xFF]);
        assert!(queue.take_drop_transition());
        // Transition flag resets after being read.
        assert!(!queue.take_drop_transition());
    }

    #[tokio::test]
    async fn pop_returns_frames_in_fifo_order() {
        let queue = MuxQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        assert_eq!(queue.pop().await, Some(vec![1]));
        assert_eq!(queue.pop().await, Some(vec![2]));
    }

    #[tokio::test]
    async fn close_and_drain_unblocks_pending_pop() {
        let queue = std::sync::Arc::new(MuxQueue::new());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close_and_drain();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[test]
    fn small_payload_is_not_compressed() {
        let session = SessionId::from_raw("deadbeef".to_string());
        let encoded = encode_output(&session, 80, 24, b"hi");
        let decoded = midterm_proto::mux::decode_message(&encoded).expect("decodes");
        assert!(matches!(decoded, MuxFrame::Output { .. }));
    }

    #[test]
    fn large_payload_is_compressed() {
        let session = SessionId::from_raw("deadbeef".to_string());
        let data = vec![b'x'; COMPRESSION_THRESHOLD + 1];
        let encoded = encode_output(&session, 80, 24, &data);
        let decoded = midterm_proto::mux::decode_message(&encoded).expect("decodes");
        assert!(matches!(decoded, MuxFrame::CompressedOutput { .. }));
    }

    #[test]
    fn replay_chunks_splits_at_32kib_boundaries() {
        let session = SessionId::from_raw("deadbeef".to_string());
        let data = vec![b'a'; REPLAY_CHUNK * 2 + 5];
        let chunks = replay_chunks(&session, 80, 24, &data);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn replay_chunks_of_empty_data_is_empty() {
        let session = SessionId::from_raw("deadbeef".to_string());
        assert!(replay_chunks(&session, 80, 24, &[]).is_empty());
    }
}
