//! Wire formats shared between `midterm-server` and `midterm-host`.
//!
//! Two independent protocols live here:
//!
//! - [`ipc`] — the per-session framed IPC between a `HostClient` (inside
//!   `midterm-server`) and its `PtyHost` subprocess.
//! - [`mux`] — the binary multiplex protocol between `midterm-server` and a
//!   browser WebSocket client.
//!
//! [`session`] holds the types shared by both sides: `SessionId`,
//! `SessionInfo`, and the version-compatibility rule used by discovery.

pub mod endpoint;
pub mod ipc;
pub mod mux;
pub mod session;

pub use endpoint::{endpoint_path, parse_endpoint_name};
pub use ipc::{IpcFrame, IpcFrameDecoder, IpcFrameType};
pub use mux::{MuxFrame, MuxFrameDecoder, MuxMessageType};
pub use session::{ForegroundProcess, LogLevel, SessionId, SessionInfo};
