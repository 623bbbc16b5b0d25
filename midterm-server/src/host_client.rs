//! Per-session framed IPC client (§4.3). One instance per session, owned
//! exclusively by the `SessionRegistry`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use midterm_proto::ipc::{IpcFrame, IpcFrameDecoder};
use midterm_proto::session::{SessionId, SessionInfo};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::HostError;
use crate::transport::probe_alive;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const READ_DEADLINE: Duration = Duration::from_secs(10);
const RECONNECT_BASE: Duration = Duration::from_millis(100);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostClientState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub enum HostClientEvent {
    Output { session: SessionId, cols: u16, rows: u16, data: Vec<u8> },
    StateChanged { session: SessionId },
    ProcessEvent { session: SessionId, payload: Vec<u8> },
    ForegroundChanged { session: SessionId, payload: Vec<u8> },
    Disconnected { session: SessionId },
    Reconnected { session: SessionId },
    /// Reconnect budget exhausted; registry should reap this session.
    Closed { session: SessionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Info,
    ResizeAck,
    Buffer,
    SetNameAck,
    SetLogLevelAck,
    CloseAck,
}

struct Pending {
    kind: PendingKind,
    tx: oneshot::Sender<IpcFrame>,
}

pub struct HostClient {
    session_id: SessionId,
    endpoint_path: PathBuf,
    host_pid: AtomicU32,
    state: Mutex<HostClientState>,
    transport: Mutex<Option<Arc<UnixStream>>>,
    write_lock: tokio::sync::Mutex<()>,
    request_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<Pending>>,
    cached_info: Mutex<Option<SessionInfo>>,
    events_tx: broadcast::Sender<HostClientEvent>,
    reconnect_count: AtomicU32,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl HostClient {
    /// `parent_shutdown` is the process-wide root token (§11); this
    /// client's own `shutdown` is a child of it, so cancelling the root
    /// unwinds every supervisor loop without disturbing a sibling
    /// session's independent `close_requested()` cancellation.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        endpoint_path: PathBuf,
        host_pid: u32,
        clock: Arc<dyn Clock>,
        parent_shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            session_id,
            endpoint_path,
            host_pid: AtomicU32::new(host_pid),
            state: Mutex::new(HostClientState::Connecting),
            transport: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            request_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            cached_info: Mutex::new(None),
            events_tx,
            reconnect_count: AtomicU32::new(0),
            clock,
            shutdown: parent_shutdown.child_token(),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn state(&self) -> HostClientState {
        *self.state.lock().expect("state lock poisoned")
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostClientEvent> {
        self.events_tx.subscribe()
    }

    #[must_use]
    pub fn cached_info(&self) -> Option<SessionInfo> {
        self.cached_info.lock().expect("cached info lock poisoned").clone()
    }

    /// Connect once with a bounded timeout (§4.4 creation path step 3).
    /// Does not start the background read/heartbeat loop.
    pub async fn connect(self: &Arc<Self>, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, UnixStream::connect(&self.endpoint_path)).await {
            Ok(Ok(stream)) => {
                *self.transport.lock().expect("transport lock poisoned") = Some(Arc::new(stream));
                true
            }
            _ => false,
        }
    }

    /// Start the background demux/heartbeat/reconnect supervisor. Runs
    /// until shutdown or reconnect exhaustion.
    pub fn start_read_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervisor().await });
    }

    pub fn close_requested(&self) {
        self.shutdown.cancel();
    }

    async fn supervisor(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                self.set_state(HostClientState::Closed);
                return;
            }

            let had_transport = self.transport.lock().expect("transport lock poisoned").is_some();
            if !had_transport {
                let timeout = Duration::from_secs(1);
                if !self.connect(timeout).await {
                    if !self.schedule_backoff().await {
                        self.finish_exhausted();
                        return;
                    }
                    continue;
                }
            }

            match self.get_info().await {
                Ok(_) => {
                    let was_reconnecting = self.reconnect_count.load(Ordering::Acquire) > 0;
                    self.set_state(HostClientState::Ready);
                    if was_reconnecting {
                        self.reconnect_count.store(0, Ordering::Release);
                        let _ = self.events_tx.send(HostClientEvent::Reconnected { session: self.session_id.clone() });
                    }
                }
                Err(_) => {
                    self.drop_transport();
                    if !self.schedule_backoff().await {
                        self.finish_exhausted();
                        return;
                    }
                    continue;
                }
            }

            self.run_connected().await;
            self.drop_transport();
            let _ = self.events_tx.send(HostClientEvent::Disconnected { session: self.session_id.clone() });
            if self.shutdown.is_cancelled() {
                self.set_state(HostClientState::Closed);
                return;
            }
            self.set_state(HostClientState::Reconnecting);
        }
    }

    /// Run the heartbeat and read-dispatch loops until the transport dies
    /// or shutdown is requested.
    async fn run_connected(self: &Arc<Self>) {
        let transport = match self.transport.lock().expect("transport lock poisoned").clone() {
            Some(t) => t,
            None => return,
        };
        let conn_dead = CancellationToken::new();

        let heartbeat = {
            let this = Arc::clone(self);
            let transport = Arc::clone(&transport);
            let conn_dead = conn_dead.clone();
            tokio::spawn(async move {
                loop {
                    if !this.clock.sleep(HEARTBEAT_INTERVAL, &conn_dead).await {
                        return;
                    }
                    if !probe_alive(&transport) {
                        conn_dead.cancel();
                        return;
                    }
                }
            })
        };

        let reader = {
            let this = Arc::clone(self);
            let transport = Arc::clone(&transport);
            let conn_dead = conn_dead.clone();
            tokio::spawn(async move { this.read_dispatch_loop(transport, conn_dead).await })
        };

        tokio::select! {
            () = conn_dead.cancelled() => {}
            () = self.shutdown.cancelled() => { conn_dead.cancel(); }
        }
        heartbeat.abort();
        reader.abort();
    }

    async fn read_dispatch_loop(self: Arc<Self>, transport: Arc<UnixStream>, conn_dead: CancellationToken) {
        let mut decoder = IpcFrameDecoder::new();
        let mut buf = [0u8; 16384];
        loop {
            let n = match tokio::time::timeout(READ_DEADLINE, read_some(&transport, &mut buf)).await {
                Ok(Ok(0)) => {
                    conn_dead.cancel();
                    return;
                }
                Ok(Ok(n)) => n,
                Ok(Err(_)) => {
                    conn_dead.cancel();
                    return;
                }
                Err(_) => continue, // read timeout alone is not fatal (§4.3)
            };

            match decoder.feed(&buf[..n]) {
                Ok(frames) => {
                    for frame in frames {
                        self.dispatch_inbound(frame);
                    }
                }
                Err(_) => {
                    conn_dead.cancel();
                    return;
                }
            }
        }
    }

    fn dispatch_inbound(&self, frame: IpcFrame) {
        let sid = self.session_id.clone();
        match frame {
            IpcFrame::Info(json) => {
                if let Ok(info) = serde_json::from_slice::<SessionInfo>(&json) {
                    *self.cached_info.lock().expect("cached info lock poisoned") = Some(info);
                }
                self.complete_pending(PendingKind::Info, IpcFrame::Info(json));
            }
            IpcFrame::ResizeAck => self.complete_pending(PendingKind::ResizeAck, IpcFrame::ResizeAck),
            IpcFrame::Buffer(data) => self.complete_pending(PendingKind::Buffer, IpcFrame::Buffer(data)),
            IpcFrame::SetNameAck => self.complete_pending(PendingKind::SetNameAck, IpcFrame::SetNameAck),
            IpcFrame::SetLogLevelAck => self.complete_pending(PendingKind::SetLogLevelAck, IpcFrame::SetLogLevelAck),
            IpcFrame::CloseAck => self.complete_pending(PendingKind::CloseAck, IpcFrame::CloseAck),
            IpcFrame::Output { cols, rows, data } => {
                let _ = self.events_tx.send(HostClientEvent::Output { session: sid, cols, rows, data });
            }
            IpcFrame::StateChange => {
                let _ = self.events_tx.send(HostClientEvent::StateChanged { session: sid });
            }
            IpcFrame::ProcessEvent(payload) => {
                let _ = self.events_tx.send(HostClientEvent::ProcessEvent { session: sid, payload });
            }
            IpcFrame::ForegroundChange(payload) => {
                let _ = self.events_tx.send(HostClientEvent::ForegroundChanged { session: sid, payload });
            }
            IpcFrame::GetInfo | IpcFrame::Input(_) | IpcFrame::Resize { .. } | IpcFrame::GetBuffer
            | IpcFrame::SetName(_) | IpcFrame::SetLogLevel(_) | IpcFrame::Close => {
                tracing::warn!(session = %self.session_id, "host sent a client-to-host frame, ignoring");
            }
        }
    }

    fn complete_pending(&self, kind: PendingKind, frame: IpcFrame) {
        let mut slot = self.pending.lock().expect("pending lock poisoned");
        if let Some(pending) = slot.take() {
            if pending.kind == kind {
                let _ = pending.tx.send(frame);
            } else {
                *slot = Some(pending);
            }
        }
    }

    async fn send_request(self: &Arc<Self>, request: IpcFrame, kind: PendingKind) -> Result<IpcFrame, HostError> {
        let _guard = self.request_lock.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().expect("pending lock poisoned") = Some(Pending { kind, tx });

        if let Err(e) = self.write_frame(&request).await {
            *self.pending.lock().expect("pending lock poisoned") = None;
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            _ => {
                *self.pending.lock().expect("pending lock poisoned") = None;
                Err(HostError::RequestTimeout)
            }
        }
    }

    async fn write_frame(&self, frame: &IpcFrame) -> Result<(), HostError> {
        let transport = self.transport.lock().expect("transport lock poisoned").clone();
        let Some(transport) = transport else {
            return Err(HostError::TransportClosed);
        };
        let _guard = self.write_lock.lock().await;
        let encoded = frame.encode();
        write_all(&transport, &encoded).await.map_err(|_| HostError::TransportClosed)
    }

    pub async fn get_info(self: &Arc<Self>) -> Result<SessionInfo, HostError> {
        let frame = self.send_request(IpcFrame::GetInfo, PendingKind::Info).await?;
        match frame {
            IpcFrame::Info(json) => serde_json::from_slice(&json).map_err(|_| HostError::InvalidFrame),
            _ => Err(HostError::InvalidFrame),
        }
    }

    /// Fire-and-forget; on transport error, just drops — the supervisor
    /// loop already owns reconnect scheduling (§4.3 "schedules reconnect
    /// and returns without raising").
    pub async fn send_input(self: &Arc<Self>, data: Vec<u8>) {
        let _ = self.write_frame(&IpcFrame::Input(data)).await;
    }

    pub async fn resize(self: &Arc<Self>, cols: u16, rows: u16) -> bool {
        self.send_request(IpcFrame::Resize { cols, rows }, PendingKind::ResizeAck).await.is_ok()
    }

    pub async fn get_buffer(self: &Arc<Self>) -> Result<Vec<u8>, HostError> {
        let frame = self.send_request(IpcFrame::GetBuffer, PendingKind::Buffer).await?;
        match frame {
            IpcFrame::Buffer(data) => Ok(data),
            _ => Err(HostError::InvalidFrame),
        }
    }

    pub async fn set_name(self: &Arc<Self>, name: String) -> bool {
        self.send_request(IpcFrame::SetName(name), PendingKind::SetNameAck).await.is_ok()
    }

    pub async fn set_log_level(self: &Arc<Self>, level: u8) -> bool {
        self.send_request(IpcFrame::SetLogLevel(level), PendingKind::SetLogLevelAck).await.is_ok()
    }

    pub async fn close(self: &Arc<Self>) -> bool {
        let ok = self.send_request(IpcFrame::Close, PendingKind::CloseAck).await.is_ok();
        self.close_requested();
        self.set_state(HostClientState::Closed);
        let _ = self.events_tx.send(HostClientEvent::Closed { session: self.session_id.clone() });
        ok
    }

    #[must_use]
    pub fn host_pid(&self) -> u32 {
        self.host_pid.load(Ordering::Acquire)
    }

    fn set_state(&self, state: HostClientState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn drop_transport(&self) {
        *self.transport.lock().expect("transport lock poisoned") = None;
    }

    /// Sleep with exponential backoff; returns `false` if the attempt
    /// budget is exhausted or shutdown fires first.
    async fn schedule_backoff(&self) -> bool {
        let attempt = self.reconnect_count.fetch_add(1, Ordering::AcqRel) + 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            return false;
        }
        self.set_state(HostClientState::Reconnecting);
        let backoff = RECONNECT_BASE
            .saturating_mul(2u32.saturating_pow((attempt - 1).min(20)))
            .min(RECONNECT_CAP);
        self.clock.sleep(backoff, &self.shutdown).await;
        !self.shutdown.is_cancelled()
    }

    fn finish_exhausted(&self) {
        self.set_state(HostClientState::Closed);
        let _ = self.events_tx.send(HostClientEvent::Closed { session: self.session_id.clone() });
    }
}

async fn read_some(transport: &Arc<UnixStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        transport.readable().await?;
        match transport.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_all(transport: &Arc<UnixStream>, data: &[u8]) -> std::io::Result<()> {
    let mut written = 0;
    while written < data.len() {
        transport.writable().await?;
        match transport.try_write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use midterm_proto::session::SessionInfo;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    fn fake_session_info() -> SessionInfo {
        SessionInfo::new(SessionId::from_raw("cafebabe".to_string()), 999, "bash", 80, 24, 0, "0.1.0")
    }

    /// Spawns a Unix listener that accepts one connection and hands the
    /// caller raw read/write access to the peer stream, so tests can act as
    /// the PtyHost side of the wire without a real midterm-host process.
    async fn fake_host_endpoint() -> (PathBuf, tokio::net::UnixListener) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("fake.sock");
        let listener = tokio::net::UnixListener::bind(&path).expect("bind fake endpoint");
        std::mem::forget(dir); // keep the tempdir alive for the socket's lifetime
        (path, listener)
    }

    #[tokio::test]
    async fn get_info_round_trips_through_fake_host() {
        let (path, listener) = fake_host_endpoint().await;
        let client = HostClient::new(SessionId::from_raw("cafebabe".to_string()), path, 999, Arc::new(crate::clock::SystemClock), &CancellationToken::new());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut decoder = IpcFrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                stream.readable().await.unwrap();
                let n = match stream.try_read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => panic!("read error: {e}"),
                };
                if n == 0 {
                    return;
                }
                for frame in decoder.feed(&buf[..n]).expect("valid frame") {
                    if let IpcFrame::GetInfo = frame {
                        let json = serde_json::to_vec(&fake_session_info()).unwrap();
                        let reply = IpcFrame::Info(json).encode();
                        let mut written = 0;
                        while written < reply.len() {
                            stream.writable().await.unwrap();
                            written += stream.try_write(&reply[written..]).unwrap_or(0);
                        }
                        return;
                    }
                }
            }
        });

        assert!(client.connect(StdDuration::from_secs(1)).await);
        let info = client.get_info().await.expect("get_info should succeed");
        assert_eq!(info.id, SessionId::from_raw("cafebabe".to_string()));
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn only_one_outstanding_request_at_a_time() {
        let (path, listener) = fake_host_endpoint().await;
        let client = HostClient::new(SessionId::from_raw("cafebabe".to_string()), path, 999, Arc::new(crate::clock::SystemClock), &CancellationToken::new());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut decoder = IpcFrameDecoder::new();
            let mut buf = [0u8; 4096];
            let mut seen = Vec::new();
            while seen.len() < 2 {
                stream.readable().await.unwrap();
                let n = match stream.try_read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => panic!("read error: {e}"),
                };
                if n == 0 {
                    break;
                }
                for frame in decoder.feed(&buf[..n]).expect("valid frame") {
                    seen.push(frame);
                }
            }
            // Reply to both requests at the end, after both were observed to
            // have arrived, proving the second was not blocked on the wire.
            for frame in seen {
                let reply = match frame {
                    IpcFrame::GetInfo => IpcFrame::Info(serde_json::to_vec(&fake_session_info()).unwrap()),
                    IpcFrame::Resize { .. } => IpcFrame::ResizeAck,
                    _ => continue,
                }
                .encode();
                let mut written = 0;
                while written < reply.len() {
                    stream.writable().await.unwrap();
                    written += stream.try_write(&reply[written..]).unwrap_or(0);
                }
            }
        });

        assert!(client.connect(StdDuration::from_secs(1)).await);
        // Drive the read-dispatch loop directly rather than through the
        // full supervisor, so its own handshake GetInfo doesn't also
        // compete for the fake server's two-frame budget.
        let transport = client.transport.lock().unwrap().clone().unwrap();
        let conn_dead = CancellationToken::new();
        let reader = tokio::spawn(Arc::clone(&client).read_dispatch_loop(transport, conn_dead.clone()));

        let a = Arc::clone(&client);
        let b = Arc::clone(&client);
        let (r1, r2) = tokio::join!(async move { a.get_info().await }, async move { b.resize(100, 40).await });

        assert!(r1.is_ok() && r2);
        server.await.expect("server task");
        conn_dead.cancel();
        reader.abort();
    }

    #[tokio::test]
    async fn dead_transport_emits_exactly_one_disconnected_event() {
        let (path, listener) = fake_host_endpoint().await;
        let client = HostClient::new(SessionId::from_raw("cafebabe".to_string()), path, 999, Arc::new(crate::clock::SystemClock), &CancellationToken::new());
        let mut events = client.subscribe();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut decoder = IpcFrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                stream.readable().await.unwrap();
                let n = match stream.try_read(&mut buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => panic!("read error: {e}"),
                };
                if n == 0 {
                    return;
                }
                for frame in decoder.feed(&buf[..n]).expect("valid frame") {
                    if let IpcFrame::GetInfo = frame {
                        let json = serde_json::to_vec(&fake_session_info()).unwrap();
                        let reply = IpcFrame::Info(json).encode();
                        let mut written = 0;
                        while written < reply.len() {
                            stream.writable().await.unwrap();
                            written += stream.try_write(&reply[written..]).unwrap_or(0);
                        }
                        // Now drop the connection entirely.
                        return;
                    }
                }
            }
        });

        assert!(client.connect(StdDuration::from_secs(1)).await);
        client.start_read_loop();
        server.await.expect("server task");

        let mut disconnected_count = 0;
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(StdDuration::from_millis(200), events.recv()).await {
                Ok(Ok(HostClientEvent::Disconnected { .. })) => disconnected_count += 1,
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert_eq!(disconnected_count, 1);
        client.close_requested();
    }

    #[test]
    fn backoff_exponent_starts_at_one_not_two() {
        // attempt 1 -> 2^0 * 100ms = 100ms, not 200ms.
        let attempt: u32 = 1;
        let backoff = RECONNECT_BASE.saturating_mul(2u32.saturating_pow((attempt - 1).min(20))).min(RECONNECT_CAP);
        assert_eq!(backoff, Duration::from_millis(100));
    }
}

