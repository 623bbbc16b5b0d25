//! IPC endpoint naming (§6): both the host and the server need to agree on
//! where a session's socket lives and how to parse a filename back into
//! `(SessionId, hostPid)` during discovery (§4.4).

use std::path::PathBuf;

use crate::session::SessionId;

pub const ENDPOINT_DIR: &str = "/tmp";
pub const ENDPOINT_PREFIX: &str = "mt-con-";
pub const ENDPOINT_SUFFIX: &str = ".sock";

/// Conservative `sun_path` limit shared across Unix platforms.
pub const MAX_SOCKET_PATH: usize = 104;

#[must_use]
pub fn endpoint_path(session: &SessionId, host_pid: u32) -> PathBuf {
    PathBuf::from(format!("{ENDPOINT_DIR}/{ENDPOINT_PREFIX}{session}-{host_pid}{ENDPOINT_SUFFIX}"))
}

/// Parse a bare filename (not a full path) of the form
/// `mt-con-<sessionId>-<hostPid>.sock` back into its parts. Used by
/// discovery (§4.4) when enumerating `/tmp`.
#[must_use]
pub fn parse_endpoint_name(file_name: &str) -> Option<(SessionId, u32)> {
    let stripped = file_name.strip_prefix(ENDPOINT_PREFIX)?;
    let stripped = stripped.strip_suffix(ENDPOINT_SUFFIX)?;
    let (session, pid) = stripped.rsplit_once('-')?;
    let host_pid = pid.parse::<u32>().ok()?;
    if session.is_empty() {
        return None;
    }
    Some((SessionId::from_raw(session.to_string()), host_pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_path_and_parse() {
        let session = SessionId::from_raw("deadbeef".to_string());
        let path = endpoint_path(&session, 4242);
        let name = path.file_name().unwrap().to_str().unwrap();
        let (parsed_session, parsed_pid) = parse_endpoint_name(name).expect("parses");
        assert_eq!(parsed_session, session);
        assert_eq!(parsed_pid, 4242);
    }

    #[test]
    fn rejects_unrelated_filenames() {
        assert!(parse_endpoint_name("not-a-midterm-socket").is_none());
        assert!(parse_endpoint_name("mt-con-deadbeef.sock").is_none());
        assert!(parse_endpoint_name("mt-con-deadbeef-notanumber.sock").is_none());
    }
}
