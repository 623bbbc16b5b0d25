//! `SessionRegistry` (§3, §4.4): the concurrent map of live sessions, plus
//! the creation and closing paths. Keyed storage is grounded on the
//! teacher's `ClientRegistry`; the concurrency model (a `DashMap` behind a
//! cloneable handle) is grounded on the relay server's `AppState`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use midterm_proto::endpoint::endpoint_path;
use midterm_proto::session::{SessionId, SessionInfo};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::HostError;
use crate::host_client::HostClient;
use crate::spawner::{ProcessSpawner, SpawnArgs};

/// Initial grace before the first connect attempt, plus the bound on
/// subsequent 1 s-spaced attempts (§4.4 creation path step 3).
const CREATE_INITIAL_GRACE: Duration = Duration::from_millis(500);
const CREATE_CONNECT_RETRIES: u32 = 10;
const CREATE_CONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub loglevel: String,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    clients: DashMap<SessionId, Arc<HostClient>>,
    host_binary: PathBuf,
    spawner: Arc<dyn ProcessSpawner>,
    clock: Arc<dyn Clock>,
    session_created_tx: tokio::sync::broadcast::Sender<Arc<HostClient>>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(
        host_binary: PathBuf,
        spawner: Arc<dyn ProcessSpawner>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let (session_created_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            inner: Arc::new(Inner { clients: DashMap::new(), host_binary, spawner, clock, session_created_tx, shutdown }),
        }
    }

    /// Process-wide root token (§11): every `HostClient` this registry
    /// creates or adopts derives its own shutdown from this one, so
    /// cancelling it unwinds all of their supervisor tasks.
    #[must_use]
    pub fn shutdown(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    /// Notified whenever a session joins the registry, whether freshly
    /// created or adopted from discovery. Lets a live `MuxClient` (attached
    /// before the session existed) start fanning it out without polling.
    #[must_use]
    pub fn subscribe_created(&self) -> tokio::sync::broadcast::Receiver<Arc<HostClient>> {
        self.inner.session_created_tx.subscribe()
    }

    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<HostClient>> {
        self.inner.clients.get(id).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    /// Snapshot of every known session's cached `SessionInfo`, used by
    /// `GetSessionList` and the periodic sidebar state feed (§6).
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<SessionInfo> {
        self.inner.clients.iter().filter_map(|e| e.value().cached_info()).collect()
    }

    /// Every currently registered `HostClient`, for a fresh `MuxClient` to
    /// walk at attach time (§4.5 "walks all sessions and streams initial
    /// buffers").
    #[must_use]
    pub fn all_clients(&self) -> Vec<Arc<HostClient>> {
        self.inner.clients.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Adopt an already-connected, already-handshaked `HostClient` found by
    /// discovery (§4.4 step 3 "Connected & compatible").
    pub fn adopt(&self, session_id: SessionId, client: Arc<HostClient>) {
        self.inner.clients.insert(session_id, Arc::clone(&client));
        let _ = self.inner.session_created_tx.send(client);
    }

    /// Creation path (§4.4): spawn, wait, handshake, start the client, or
    /// tear everything back down on any failure.
    pub async fn create_session(&self, req: CreateSessionRequest) -> Result<SessionInfo, HostError> {
        let session_id = SessionId::generate();
        let args = SpawnArgs {
            session_id: session_id.as_str().to_string(),
            shell: req.shell,
            cwd: req.cwd,
            cols: req.cols,
            rows: req.rows,
            loglevel: req.loglevel,
        };

        let host_pid = self.inner.spawner.spawn(&self.inner.host_binary, &args, None).map_err(|e| {
            tracing::warn!(error = %e, "failed to spawn PtyHost");
            HostError::SpawnFailed
        })?;

        let path = endpoint_path(&session_id, host_pid);
        let fresh_token = tokio_util::sync::CancellationToken::new();
        self.inner.clock.sleep(CREATE_INITIAL_GRACE, &fresh_token).await;

        let client = HostClient::new(session_id.clone(), path, host_pid, Arc::clone(&self.inner.clock), &self.inner.shutdown);
        if !self.connect_with_retries(&client).await {
            self.inner.spawner.kill(host_pid);
            return Err(HostError::SpawnFailed);
        }

        let info = match client.get_info().await {
            Ok(info) => info,
            Err(e) => {
                self.inner.spawner.kill(host_pid);
                return Err(e);
            }
        };

        client.start_read_loop();
        self.inner.clients.insert(session_id, Arc::clone(&client));
        let _ = self.inner.session_created_tx.send(client);
        Ok(info)
    }

    async fn connect_with_retries(&self, client: &Arc<HostClient>) -> bool {
        for _ in 0..CREATE_CONNECT_RETRIES {
            if client.connect(CREATE_CONNECT_INTERVAL).await {
                return true;
            }
        }
        false
    }

    /// Remove from the registry, ask the host to close (best effort), and
    /// drop our handle. Does not wait for the host process to exit.
    pub async fn close_session(&self, id: &SessionId) -> bool {
        let Some((_, client)) = self.inner.clients.remove(id) else {
            return false;
        };
        let _ = client.close().await;
        true
    }

    #[must_use]
    pub fn host_binary(&self) -> &Path {
        &self.inner.host_binary
    }

    #[must_use]
    pub fn spawner(&self) -> &Arc<dyn ProcessSpawner> {
        &self.inner.spawner
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }
}
