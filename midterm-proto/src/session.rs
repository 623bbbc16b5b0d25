//! Shared session value types: `SessionId`, `SessionInfo`, version compare.

use serde::{Deserialize, Serialize};

/// 8-character opaque session identifier (first 8 hex chars of a fresh UUID).
///
/// Unique within a single `midterm-server` lifetime. Deliberately short so it
/// fits verbatim into the mux frame header (§4.5) and into IPC endpoint names
/// (`mt-con-<id>-<hostPid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh id from the first 8 hex characters of a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let hex = uuid.simple().to_string();
        Self(hex[..8].to_string())
    }

    /// Wrap an existing 8-character id (e.g. parsed from an endpoint name or
    /// a mux frame header). Does not validate length — callers that parse
    /// untrusted input should check `as_str().len() == 8` themselves.
    #[must_use]
    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The all-zero sentinel id used by mux `Resync` frames to mean
    /// "apply to all sessions" (§4.5).
    #[must_use]
    pub fn all_zero() -> Self {
        Self("00000000".to_string())
    }

    #[must_use]
    pub fn is_all_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A child process currently owning the controlling terminal, reported via
/// `ForegroundChange` (§4.1) and cached on `SessionInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundProcess {
    pub pid: u32,
    pub name: String,
    pub command_line: String,
}

/// Host-side logging verbosity, set via `SetLogLevel` (§4.1) and the
/// `--loglevel` CLI flag (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Error),
            1 => Some(Self::Warn),
            2 => Some(Self::Info),
            3 => Some(Self::Debug),
            4 => Some(Self::Trace),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Server-side cached view of one session (§3).
///
/// Treated as an immutable value: mutation means publishing a new snapshot
/// under the registry's per-key lock (§9 "Shared mutable SessionInfo").
/// Readers never observe a partially-updated snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub host_pid: u32,
    pub shell_kind: String,
    pub cols: u16,
    pub rows: u16,
    pub created_at_unix_ms: u64,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    pub display_name: Option<String>,
    pub terminal_title: Option<String>,
    pub tty_host_version: String,
    pub current_working_directory: Option<String>,
    pub foreground_process: Option<ForegroundProcess>,
}

impl SessionInfo {
    /// Construct the initial snapshot for a freshly spawned host.
    ///
    /// # Panics
    ///
    /// Panics if `cols` or `rows` is zero — violates the §3 invariant
    /// `cols,rows >= 1`.
    #[must_use]
    pub fn new(
        id: SessionId,
        host_pid: u32,
        shell_kind: impl Into<String>,
        cols: u16,
        rows: u16,
        created_at_unix_ms: u64,
        tty_host_version: impl Into<String>,
    ) -> Self {
        assert!(cols >= 1 && rows >= 1, "cols/rows must be >= 1");
        Self {
            id,
            host_pid,
            shell_kind: shell_kind.into(),
            cols,
            rows,
            created_at_unix_ms,
            is_running: true,
            exit_code: None,
            display_name: None,
            terminal_title: None,
            tty_host_version: tty_host_version.into(),
            current_working_directory: None,
            foreground_process: None,
        }
    }

    /// Returns true iff the §3 invariant `isRunning => exitCode.is_none()`
    /// holds for this snapshot. Used by tests and by the host before it
    /// publishes a new snapshot.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        self.cols >= 1 && self.rows >= 1 && !(self.is_running && self.exit_code.is_some())
    }
}

/// Split a dotted version string into numeric components, per §4.4: any
/// `+`-suffix is stripped first, missing trailing components are treated as
/// zero, and a pre-release `-` suffix on the *last* dotted component is also
/// ignored (components are compared up to the first non-digit run).
fn version_components(v: &str) -> Vec<u64> {
    let stripped = v.split('+').next().unwrap_or(v);
    stripped
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u64>().unwrap_or(0)
        })
        .collect()
}

/// Compare two dotted version strings component-wise as integers, treating
/// a missing trailing component as `0`. Returns `Ordering::Equal` when all
/// present components match (e.g. `"1.2"` == `"1.2.0"`).
#[must_use]
pub fn version_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let ca = version_components(a);
    let cb = version_components(b);
    let len = ca.len().max(cb.len());
    for i in 0..len {
        let x = ca.get(i).copied().unwrap_or(0);
        let y = cb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// §4.4 compatibility rule: `release == expected` OR `release >= min_compatible`.
#[must_use]
pub fn is_version_compatible(release: &str, expected: &str, min_compatible: &str) -> bool {
    version_compare(release, expected) == std::cmp::Ordering::Equal
        || version_compare(release, min_compatible) != std::cmp::Ordering::Less
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_generate_is_8_chars() {
        let id = SessionId::generate();
        assert_eq!(id.as_str().len(), 8);
    }

    #[test]
    fn session_id_all_zero_detected() {
        assert!(SessionId::all_zero().is_all_zero());
        assert!(!SessionId::from_raw("a0000000").is_all_zero());
    }

    #[test]
    fn session_info_invariants_hold_by_default() {
        let info = SessionInfo::new(SessionId::generate(), 123, "bash", 80, 24, 0, "1.0.0");
        assert!(info.invariants_hold());
    }

    #[test]
    #[should_panic(expected = "cols/rows must be >= 1")]
    fn session_info_rejects_zero_dims() {
        let _ = SessionInfo::new(SessionId::generate(), 1, "bash", 0, 24, 0, "1.0.0");
    }

    #[test]
    fn version_compare_equal_with_missing_trailing_component() {
        assert_eq!(version_compare("1.2", "1.2.0"), std::cmp::Ordering::Equal);
    }

    #[test]
    fn version_compare_strips_plus_suffix() {
        assert_eq!(
            version_compare("1.2.3+build.5", "1.2.3"),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn version_compare_numeric_not_lexical() {
        // 1.10.0 > 1.9.0 numerically, would be false lexically.
        assert_eq!(version_compare("1.10.0", "1.9.0"), std::cmp::Ordering::Greater);
    }

    #[test]
    fn compatibility_exact_match() {
        assert!(is_version_compatible("1.2.0", "1.2.0", "1.0.0"));
    }

    #[test]
    fn compatibility_above_min() {
        assert!(is_version_compatible("1.5.0", "2.0.0", "1.0.0"));
    }

    #[test]
    fn compatibility_below_min_rejected() {
        assert!(!is_version_compatible("0.0.1", "1.0.0", "0.5.0"));
    }
}
