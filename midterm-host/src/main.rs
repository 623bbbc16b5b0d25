//! `midterm-host`: owns one PTY, serves one IPC endpoint (§4.2).
//!
//! Single-session-per-process is deliberate: it bounds blast radius and
//! lets an OS-level "run as user" spawn de-elevate independently per
//! session (§4.4 step 2). This binary is the whole of that contract: it
//! never talks to any other session's state.

mod connection;
mod endpoint;
mod logging;
mod process_monitor;
mod pty;
mod ring_buffer;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use midterm_proto::session::{LogLevel, SessionId, SessionInfo};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use session::SessionState;

/// `ttyHostVersion` reported in every `SessionInfo` and compared by
/// discovery (§4.4). Matches the package version so a server built from the
/// same commit as a running host is always exactly compatible.
const TTY_HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub enum HostEvent {
    Output(Vec<u8>),
    StateChange,
    ProcessEvent(Vec<u8>),
    ForegroundChange(Vec<u8>),
}

#[derive(Parser, Debug)]
#[command(name = "midterm-host", about = "PTY session host process")]
struct Args {
    /// Required SessionId this process serves.
    #[arg(long = "session")]
    session: String,

    /// Shell selector, mapped to an executable (free-form, e.g. "bash -l").
    #[arg(long = "shell", default_value = "/bin/bash")]
    shell: String,

    /// Initial working directory.
    #[arg(long = "cwd")]
    cwd: Option<PathBuf>,

    #[arg(long = "cols", default_value_t = 80)]
    cols: u16,

    #[arg(long = "rows", default_value_t = 24)]
    rows: u16,

    /// Verbosity: error|warn|info|debug|trace.
    #[arg(long = "loglevel", default_value = "info")]
    loglevel: String,
}

fn parse_loglevel(s: &str) -> LogLevel {
    match s.to_ascii_lowercase().as_str() {
        "error" => LogLevel::Error,
        "warn" => LogLevel::Warn,
        "debug" => LogLevel::Debug,
        "trace" => LogLevel::Trace,
        _ => LogLevel::Info,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(parse_loglevel(&args.loglevel));

    if args.cols == 0 || args.rows == 0 {
        anyhow::bail!("cols/rows must be >= 1");
    }

    let session_id = SessionId::from_raw(args.session.clone());
    let host_pid = std::process::id();
    let cwd = args.cwd.clone().unwrap_or_else(|| std::env::current_dir().unwrap_or(PathBuf::from("/")));

    tracing::info!(session = %session_id, pid = host_pid, "starting midterm-host");

    let (pty_handle, mut pty_rx) = pty::PtyHandle::spawn(&args.shell, &cwd, args.cols, args.rows)
        .context("failed to spawn PTY/shell")?;

    let created_at_unix_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut info = SessionInfo::new(
        session_id.clone(),
        host_pid,
        args.shell.clone(),
        args.cols,
        args.rows,
        created_at_unix_ms,
        TTY_HOST_VERSION,
    );
    info.current_working_directory = Some(cwd.to_string_lossy().into_owned());

    let session = Arc::new(SessionState::new(info, pty_handle));

    let (events_tx, _) = broadcast::channel::<HostEvent>(1024);

    // Output pump: every PTY chunk is recorded (pre-handshake buffer or
    // ring buffer, depending on handshake state) and broadcast live.
    {
        let session = Arc::clone(&session);
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(chunk) = pty_rx.recv().await {
                session.record_output(&chunk.data);
                if session.handshake_done.load(std::sync::atomic::Ordering::Acquire) {
                    let _ = events_tx.send(HostEvent::Output(chunk.data));
                }
            }
            tracing::debug!("PTY output channel closed");
        });
    }

    // Process/foreground monitor: walks the shell's direct children to
    // approximate which one currently owns the controlling terminal.
    if let Some(shell_pid) = session.pty.shell_pid() {
        let session = Arc::clone(&session);
        let events_tx = events_tx.clone();
        tokio::spawn(process_monitor::run(session, events_tx, shell_pid));
    } else {
        tracing::warn!("shell pid unavailable, foreground tracking disabled");
    }

    let endpoint_path = endpoint::endpoint_path(&session_id, host_pid);
    let listener = endpoint::bind(&endpoint_path).context("failed to bind IPC endpoint")?;
    tracing::info!(path = %endpoint_path.display(), "IPC endpoint listening");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    let (conn_done_tx, mut conn_done_rx) = tokio::sync::mpsc::unbounded_channel::<Result<bool>>();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                        continue;
                    }
                };

                let token = CancellationToken::new();
                session.attach_client(token.clone());
                let events_tx = events_tx.clone();
                let session = Arc::clone(&session);
                let conn_done_tx = conn_done_tx.clone();

                tokio::spawn(async move {
                    let result = connection::serve(stream, session, events_tx, token).await;
                    let _ = conn_done_tx.send(result);
                });
            }
            Some(result) = conn_done_rx.recv() => {
                match result {
                    Ok(true) => {
                        tracing::info!("received Close, exiting");
                        let _ = std::fs::remove_file(&endpoint_path);
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "connection ended with error"),
                }
            }
            () = shutdown.cancelled() => {
                let _ = std::fs::remove_file(&endpoint_path);
                return Ok(());
            }
        }
    }
}
