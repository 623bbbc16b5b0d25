//! Unix-socket IPC endpoint binding (§4.2, §6). Naming itself lives in
//! `midterm_proto::endpoint`, shared with the server's discovery pass.

use std::path::Path;

use anyhow::{bail, Context, Result};
use midterm_proto::endpoint::MAX_SOCKET_PATH;
use tokio::net::UnixListener;

pub use midterm_proto::endpoint::endpoint_path;

/// Bind the session's endpoint, removing any stale file first and
/// restricting access to the owning user.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let len = path.as_os_str().len();
    if len >= MAX_SOCKET_PATH {
        bail!("endpoint path too long ({len} bytes, max {}): {}", MAX_SOCKET_PATH - 1, path.display());
    }

    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale endpoint: {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind endpoint: {}", path.display()))?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    listener.set_nonblocking(true)?;
    UnixListener::from_std(listener).context("failed to hand endpoint to tokio")
}
