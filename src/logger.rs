//! File logging. The real stdout and stderr belong to the sandboxed program,
//! so nothing is ever logged to the terminal.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const APP_DIR: &str = "zvsh";
const LOG_FILE: &str = "zvsh.log";
/// Used when neither a state nor a home directory is known. Dotted so it
/// never collides with the `--zvm-debug` output file in the same directory.
const CWD_LOG_FILE: &str = ".zvsh.log";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init() -> Result<()> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let log_path = resolve_log_path(
        std::env::var("XDG_STATE_HOME").ok(),
        home::home_dir(),
        &std::env::current_dir().context("Failed to get current directory")?,
    );
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let (directory, file_name) = split_path(&log_path)?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::never(directory, file_name));
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_target(false),
        )
        .try_init()
        .context("Failed to initialize tracing subscriber")
}

/// `$XDG_STATE_HOME/zvsh/zvsh.log`, else `~/.local/state/zvsh/zvsh.log`, else the cwd.
fn resolve_log_path(state_home: Option<String>, home: Option<PathBuf>, cwd: &Path) -> PathBuf {
    if let Some(state_home) = state_home.filter(|s| !s.is_empty()) {
        return PathBuf::from(state_home).join(APP_DIR).join(LOG_FILE);
    }
    match home {
        Some(home) => home
            .join(".local")
            .join("state")
            .join(APP_DIR)
            .join(LOG_FILE),
        None => cwd.join(CWD_LOG_FILE),
    }
}

fn split_path(path: &Path) -> Result<(PathBuf, &str)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid log file name"))?;

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok((dir, file_name))
}
