//! Error taxonomy (§7). Values, not exceptions: every public HostClient/
//! registry operation returns one of these rather than throwing outward.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("transport closed")]
    TransportClosed,
    #[error("read deadline elapsed")]
    TransportTimeout,
    #[error("invalid frame on the wire")]
    InvalidFrame,
    #[error("request timed out waiting for ack")]
    RequestTimeout,
    #[error("host reported an incompatible version: {0}")]
    HostIncompatible(String),
    #[error("failed to spawn PtyHost process")]
    SpawnFailed,
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
    #[error("session is unavailable")]
    Unavailable,
}
