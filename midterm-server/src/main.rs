//! `midterm-server`: supervises `midterm-host` subprocesses and fans their
//! output out to browser WebSocket clients (§2, §4.4, §4.5).

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use midterm_server::clock::SystemClock;
use midterm_server::config::Args;
use midterm_server::discovery::{self, CompatibilityPolicy, FsEndpointEnumerator};
use midterm_server::http;
use midterm_server::registry::SessionRegistry;
use midterm_server::spawner::StdProcessSpawner;

fn init_logging(loglevel: &str) {
    let level = match loglevel.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    };
    let filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.loglevel);

    let shutdown = CancellationToken::new();
    let registry =
        SessionRegistry::new(args.host_binary.clone(), Arc::new(StdProcessSpawner), Arc::new(SystemClock), shutdown.clone());

    let policy = CompatibilityPolicy {
        expected_version: args.expected_host_version.clone(),
        min_compatible_version: args.min_compatible_host_version.clone(),
    };
    let adopted = discovery::run(&registry, &FsEndpointEnumerator, &policy).await;
    tracing::info!(adopted, "discovery pass complete");

    let state = http::AppState::new(registry);
    let app = http::app(state, args.static_dir.clone());

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(addr = %args.listen, "midterm-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("server loop failed")?;

    Ok(())
}

/// Waits for Ctrl+C/SIGTERM, then cancels `shutdown` so every
/// registry-spawned supervisor task and attached `MuxRuntime` unwinds
/// alongside axum's own connection drain (§11).
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
