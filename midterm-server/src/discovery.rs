//! Discovery/adoption pass (§4.4), run once at `WebServer` startup:
//! reconstructs the registry purely from what's sitting in `/tmp`, with no
//! persisted state file.

use std::sync::Arc;
use std::time::Duration;

use midterm_proto::endpoint::{ENDPOINT_DIR, ENDPOINT_PREFIX};
use midterm_proto::{endpoint, parse_endpoint_name};

use crate::clock::Clock;
use crate::host_client::HostClient;
use crate::registry::SessionRegistry;
use crate::spawner::ProcessSpawner;

const DISCOVERY_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Current `ttyHostVersion` this server expects, and the floor below which
/// a host is rejected outright (§4.4 step 4).
#[derive(Debug, Clone)]
pub struct CompatibilityPolicy {
    pub expected_version: String,
    pub min_compatible_version: String,
}

pub trait EndpointEnumerator: Send + Sync + 'static {
    fn list(&self) -> Vec<(midterm_proto::session::SessionId, u32)>;
    fn remove(&self, session: &midterm_proto::session::SessionId, host_pid: u32);
}

/// Lists `/tmp/mt-con-*.sock` files and parses host pids out of their names.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsEndpointEnumerator;

impl EndpointEnumerator for FsEndpointEnumerator {
    fn list(&self) -> Vec<(midterm_proto::session::SessionId, u32)> {
        let Ok(entries) = std::fs::read_dir(ENDPOINT_DIR) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                if !name.starts_with(ENDPOINT_PREFIX) {
                    return None;
                }
                parse_endpoint_name(name)
            })
            .collect()
    }

    fn remove(&self, session: &midterm_proto::session::SessionId, host_pid: u32) {
        let path = endpoint::endpoint_path(session, host_pid);
        let _ = std::fs::remove_file(path);
    }
}

/// Run the discovery pass, adopting compatible sessions into `registry`.
/// Returns the number adopted.
pub async fn run(
    registry: &SessionRegistry,
    enumerator: &dyn EndpointEnumerator,
    policy: &CompatibilityPolicy,
) -> usize {
    let mut adopted = 0;
    for (session_id, host_pid) in enumerator.list() {
        let path = endpoint::endpoint_path(&session_id, host_pid);
        let client = HostClient::new(session_id.clone(), path, host_pid, Arc::clone(registry.clock()), registry.shutdown());

        let connected = client.connect(DISCOVERY_CONNECT_TIMEOUT).await;
        if !connected {
            if registry.spawner().is_alive(host_pid) {
                registry.spawner().kill(host_pid);
            }
            enumerator.remove(&session_id, host_pid);
            continue;
        }

        match client.get_info().await {
            Ok(info) => {
                if midterm_proto::session::is_version_compatible(
                    &info.tty_host_version,
                    &policy.expected_version,
                    &policy.min_compatible_version,
                ) {
                    client.start_read_loop();
                    registry.adopt(session_id, client);
                    adopted += 1;
                } else {
                    tracing::warn!(
                        session = %session_id,
                        host_version = %info.tty_host_version,
                        "discovered host failed version compatibility, killing"
                    );
                    registry.spawner().kill(host_pid);
                    enumerator.remove(&session_id, host_pid);
                }
            }
            Err(_) => {
                if registry.spawner().is_alive(host_pid) {
                    registry.spawner().kill(host_pid);
                }
                enumerator.remove(&session_id, host_pid);
            }
        }
    }
    adopted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::spawner::StdProcessSpawner;
    use midterm_proto::session::SessionId;
    use std::sync::Mutex;

    struct FakeEnumerator {
        entries: Vec<(SessionId, u32)>,
        removed: Mutex<Vec<(SessionId, u32)>>,
    }

    impl EndpointEnumerator for FakeEnumerator {
        fn list(&self) -> Vec<(SessionId, u32)> {
            self.entries.clone()
        }
        fn remove(&self, session: &SessionId, host_pid: u32) {
            self.removed.lock().unwrap().push((session.clone(), host_pid));
        }
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_removed_and_not_adopted() {
        let registry = SessionRegistry::new(
            std::path::PathBuf::from("/bin/true"),
            Arc::new(StdProcessSpawner),
            Arc::new(SystemClock),
            tokio_util::sync::CancellationToken::new(),
        );
        let enumerator = FakeEnumerator {
            entries: vec![(SessionId::from_raw("aaaaaaaa".to_string()), 999_999)],
            removed: Mutex::new(Vec::new()),
        };
        let policy = CompatibilityPolicy { expected_version: "0.1.0".to_string(), min_compatible_version: "0.1.0".to_string() };

        let adopted = run(&registry, &enumerator, &policy).await;
        assert_eq!(adopted, 0);
        assert!(registry.is_empty());
        assert_eq!(enumerator.removed.lock().unwrap().len(), 1);
    }
}
