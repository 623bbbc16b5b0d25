//! Shared state for the one session this process owns (§4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use midterm_proto::session::{ForegroundProcess, SessionId, SessionInfo};
use tokio_util::sync::CancellationToken;

use crate::pty::PtyHandle;
use crate::ring_buffer::{RingBuffer, DEFAULT_RING_CAPACITY};

/// Pre-handshake output cap: 1 MiB (§4.2).
const PRE_HANDSHAKE_CAP: usize = 1024 * 1024;

pub struct SessionState {
    pub info: Mutex<SessionInfo>,
    pub pty: PtyHandle,
    pub ring: Mutex<RingBuffer>,
    /// Output produced before any client has completed the handshake.
    /// Flushed to the first client, then never written to again.
    pub pre_handshake: Mutex<Vec<u8>>,
    pub pre_handshake_overflow_warned: AtomicBool,
    pub handshake_done: AtomicBool,
    /// Cancellation token for whichever client is currently attached. A new
    /// connection cancels the previous one before installing its own token
    /// (§4.2 "only one client attached at a time").
    pub active_client: Mutex<Option<CancellationToken>>,
}

impl SessionState {
    #[must_use]
    pub fn new(info: SessionInfo, pty: PtyHandle) -> Self {
        Self {
            info: Mutex::new(info),
            pty,
            ring: Mutex::new(RingBuffer::new(DEFAULT_RING_CAPACITY)),
            pre_handshake: Mutex::new(Vec::new()),
            pre_handshake_overflow_warned: AtomicBool::new(false),
            handshake_done: AtomicBool::new(false),
            active_client: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.info.lock().expect("info lock poisoned").id.clone()
    }

    /// Record raw PTY output: before the first handshake, buffer bounded by
    /// `PRE_HANDSHAKE_CAP`, with further overflow silently dropped after a
    /// single warning; after handshake, the ring buffer is authoritative.
    pub fn record_output(&self, data: &[u8]) {
        if self.handshake_done.load(Ordering::Acquire) {
            self.ring.lock().expect("ring lock poisoned").push(data);
        } else {
            let mut buf = self.pre_handshake.lock().expect("pre-handshake lock poisoned");
            if buf.len() >= PRE_HANDSHAKE_CAP {
                if !self.pre_handshake_overflow_warned.swap(true, Ordering::AcqRel) {
                    tracing::warn!("pre-handshake output buffer full, dropping further output");
                }
                return;
            }
            let remaining = PRE_HANDSHAKE_CAP - buf.len();
            let take = data.len().min(remaining);
            buf.extend_from_slice(&data[..take]);
        }
    }

    /// Mark the handshake complete and return the buffered pre-handshake
    /// bytes to flush to the newly attached client. Idempotent: returns an
    /// empty vec on subsequent calls (§4.2 "starts only after the first
    /// client").
    pub fn complete_handshake(&self) -> Vec<u8> {
        if self.handshake_done.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        std::mem::take(&mut *self.pre_handshake.lock().expect("pre-handshake lock poisoned"))
    }

    pub fn set_name(&self, name: String) {
        let mut info = self.info.lock().expect("info lock poisoned");
        info.display_name = if name.is_empty() { None } else { Some(name) };
    }

    pub fn set_dims(&self, cols: u16, rows: u16) {
        let mut info = self.info.lock().expect("info lock poisoned");
        info.cols = cols;
        info.rows = rows;
    }

    pub fn mark_exited(&self, exit_code: i32) {
        let mut info = self.info.lock().expect("info lock poisoned");
        info.is_running = false;
        info.exit_code = Some(exit_code);
    }

    pub fn set_foreground(&self, fg: Option<ForegroundProcess>) {
        let mut info = self.info.lock().expect("info lock poisoned");
        info.foreground_process = fg;
    }

    pub fn set_cwd(&self, cwd: Option<String>) {
        let mut info = self.info.lock().expect("info lock poisoned");
        info.current_working_directory = cwd;
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionInfo {
        self.info.lock().expect("info lock poisoned").clone()
    }

    #[must_use]
    pub fn buffer_snapshot(&self) -> Vec<u8> {
        self.ring.lock().expect("ring lock poisoned").to_vec()
    }

    /// Install `token` as the active client, cancelling and returning
    /// whichever token (if any) was previously attached.
    pub fn attach_client(&self, token: CancellationToken) -> Option<CancellationToken> {
        let mut slot = self.active_client.lock().expect("active client lock poisoned");
        let previous = slot.replace(token);
        if let Some(old) = &previous {
            old.cancel();
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> SessionState {
        let (pty, _rx) = PtyHandle::spawn("/bin/cat", std::path::Path::new("/tmp"), 80, 24)
            .expect("spawn /bin/cat for test");
        let info = SessionInfo::new(
            SessionId::from_raw("deadbeef".to_string()),
            1234,
            "cat",
            80,
            24,
            0,
            "0.1.0",
        );
        SessionState::new(info, pty)
    }

    #[test]
    fn pre_handshake_output_is_buffered_not_ringed() {
        let session = test_session();
        session.record_output(b"hello");
        assert!(session.ring.lock().unwrap().is_empty());
        assert_eq!(*session.pre_handshake.lock().unwrap(), b"hello");
    }

    #[test]
    fn complete_handshake_drains_buffer_once() {
        let session = test_session();
        session.record_output(b"hello");
        let flushed = session.complete_handshake();
        assert_eq!(flushed, b"hello");
        assert_eq!(session.complete_handshake(), Vec::<u8>::new());
    }

    #[test]
    fn post_handshake_output_goes_to_ring() {
        let session = test_session();
        session.complete_handshake();
        session.record_output(b"world");
        assert_eq!(session.ring.lock().unwrap().to_vec(), b"world");
    }

    #[test]
    fn pre_handshake_overflow_drops_silently_after_warning() {
        let session = test_session();
        session.record_output(&vec![0u8; PRE_HANDSHAKE_CAP]);
        session.record_output(b"overflow");
        let flushed = session.complete_handshake();
        assert_eq!(flushed.len(), PRE_HANDSHAKE_CAP);
    }

    #[test]
    fn set_name_empty_clears_display_name() {
        let session = test_session();
        session.set_name("foo".to_string());
        assert_eq!(session.snapshot().display_name, Some("foo".to_string()));
        session.set_name(String::new());
        assert_eq!(session.snapshot().display_name, None);
    }

    #[test]
    fn attach_client_cancels_previous_token() {
        let session = test_session();
        let first = CancellationToken::new();
        session.attach_client(first.clone());
        assert!(!first.is_cancelled());

        let second = CancellationToken::new();
        session.attach_client(second);
        assert!(first.is_cancelled());
    }

    #[test]
    fn mark_exited_sets_exit_code_and_clears_running() {
        let session = test_session();
        session.mark_exited(7);
        let info = session.snapshot();
        assert!(!info.is_running);
        assert_eq!(info.exit_code, Some(7));
    }
}
