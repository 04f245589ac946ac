//! Structured logging for debugging conductor.
//!
//! Log levels:
//! - ERROR: failures that stop a project from making progress
//! - WARN: recoverable surprises (refused admissions, offline workers)
//! - INFO: state changes (enqueue, phase transitions, retries scheduled)
//! - DEBUG: detailed operation traces
//! - TRACE: very detailed traces (event publication)
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` overrides the level filter entirely.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::Result;

pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() -> Result<WorkerGuard> {
    init_with_debug(false)
}

/// Initialize logging with explicit debug mode setting.
///
/// The returned guard flushes the background writer on drop and must be held
/// for the life of the process.
pub fn init_with_debug(debug: bool) -> Result<WorkerGuard> {
    let debug_enabled = debug || env_flag(std::env::var(DEBUG_ENV).ok().as_deref());
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let path = Config::log_path()?;
    let (writer, guard) = tracing_appender::non_blocking(open_truncated(&path)?);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    // A subscriber may already be installed (tests, embedding binaries).
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(path = %path.display(), debug = debug_enabled, "logging initialized");
    }
    Ok(guard)
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Open the log file for writing, truncating whatever a previous run left.
fn open_truncated(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(fs::File::create(path)?)
}
