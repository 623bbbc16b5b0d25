//! Raw liveness probe for the heartbeat (§4.3): peek the socket without
//! consuming or sending any bytes. Unix sockets have no portable async
//! "peek" in tokio, so this drops to a raw `MSG_PEEK` recv on the fd,
//! mirroring how a PTY proxy would poll a socket for EOF out of band.

use std::os::fd::{AsRawFd, RawFd};

/// `true` if the socket still looks alive: either data is waiting to be
/// read, or the read would simply block. `false` on orderly shutdown
/// (`recv` returns 0) or a hard error.
#[must_use]
pub fn probe_alive(socket: &tokio::net::UnixStream) -> bool {
    probe_alive_fd(socket.as_raw_fd())
}

fn probe_alive_fd(fd: RawFd) -> bool {
    let mut buf = [0u8; 1];
    // SAFETY: `fd` is a valid, open socket for the lifetime of this call
    // (borrowed from a live `UnixStream`); `buf` is a valid 1-byte buffer.
    let n = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };

    if n == 0 {
        return false; // peer performed an orderly shutdown
    }
    if n > 0 {
        return true; // data pending, definitely alive
    }

    let err = std::io::Error::last_os_error();
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn alive_socket_with_no_data_probes_true() {
        let (std_a, _std_b) = std::os::unix::net::UnixStream::pair().unwrap();
        std_a.set_nonblocking(true).unwrap();
        let a = tokio::net::UnixStream::from_std(std_a).unwrap();
        assert!(probe_alive(&a));
    }

    #[tokio::test]
    async fn socket_with_pending_data_probes_true_and_leaves_data() {
        let (std_a, mut std_b) = std::os::unix::net::UnixStream::pair().unwrap();
        std_a.set_nonblocking(true).unwrap();
        std_b.write_all(b"x").unwrap();
        let a = tokio::net::UnixStream::from_std(std_a).unwrap();
        assert!(probe_alive(&a));
        // MSG_PEEK must not consume the byte.
        assert!(probe_alive(&a));
    }

    #[tokio::test]
    async fn closed_peer_probes_false() {
        let (std_a, std_b) = std::os::unix::net::UnixStream::pair().unwrap();
        std_a.set_nonblocking(true).unwrap();
        drop(std_b);
        let a = tokio::net::UnixStream::from_std(std_a).unwrap();
        assert!(!probe_alive(&a));
    }
}
