//! Tracing setup with a runtime-adjustable level, driven by `SetLogLevel`
//! (§4.1) and the `--loglevel` CLI flag (§6).

use std::sync::OnceLock;

use midterm_proto::session::LogLevel;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::reload;
use tracing_subscriber::prelude::*;

type ReloadHandle = reload::Handle<LevelFilter, tracing_subscriber::Registry>;

static HANDLE: OnceLock<ReloadHandle> = OnceLock::new();

pub fn init(initial: LogLevel) {
    let filter = to_level_filter(initial);
    let (filter_layer, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let _ = HANDLE.set(handle);
}

pub fn set_level(level: LogLevel) {
    if let Some(handle) = HANDLE.get() {
        let _ = handle.modify(|filter| *filter = to_level_filter(level));
    }
}

fn to_level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Trace => LevelFilter::TRACE,
    }
}
