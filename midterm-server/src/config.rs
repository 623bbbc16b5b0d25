//! CLI configuration (§6, §10.3): everything the `WebServer` binary needs
//! at startup, parsed once via `clap`, mirroring how `midterm-host`'s
//! `Args` struct is laid out.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "midterm-server", about = "Browser-facing terminal multiplexer server")]
pub struct Args {
    /// Address to bind the HTTP/WebSocket listener on.
    #[arg(long, default_value = "127.0.0.1:8765")]
    pub listen: String,

    /// Path to the `midterm-host` binary this server spawns per session.
    #[arg(long, default_value = "midterm-host")]
    pub host_binary: PathBuf,

    /// `ttyHostVersion` this build expects exactly (§4.4).
    #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
    pub expected_host_version: String,

    /// Minimum `ttyHostVersion` still accepted (§4.4).
    #[arg(long, default_value = "0.1.0")]
    pub min_compatible_host_version: String,

    /// Verbosity: error|warn|info|debug|trace.
    #[arg(long, default_value = "info")]
    pub loglevel: String,

    /// Directory served as static assets for the browser client, if any.
    #[arg(long)]
    pub static_dir: Option<PathBuf>,
}
