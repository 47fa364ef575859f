//! Operator diagnostics via `tracing`.
//!
//! - **Tracing (this module)**: process diagnostics filtered by `RUST_LOG`
//!   (falling back to `logging.level`), written to stderr and optionally a
//!   daily-rolling file.
//! - **Event log (`engine::event_log`)**: the per-run audit trail persisted
//!   with the run. Always written, unaffected by `RUST_LOG`.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

/// Install the global subscriber. Keep the returned guard alive for the
/// process lifetime so buffered file output is flushed on exit.
pub fn init(config: &LoggingSection) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "devflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let json_stderr = config
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let compact_stderr = (!config.json).then(|| {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
    });
    let file = file_writer.map(|writer| fmt::layer().json().with_ansi(false).with_writer(writer));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_stderr)
        .with(compact_stderr)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
