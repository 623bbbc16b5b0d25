//! `midterm-server` library: supervises `midterm-host` subprocesses and
//! fans their output out to browser WebSocket clients (§2, §4.4, §4.5).
//! Split from `main.rs` so `tests/` can drive the HTTP surface directly.

pub mod auth;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host_client;
pub mod http;
pub mod mux;
pub mod registry;
pub mod spawner;
pub mod transport;
