// ABOUTME: Local state directory for checkpoint files and per-run logs
// ABOUTME: Resolves ~/.crm-sync/ and creates it on first use

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Get the directory for checkpoint files and run logs.
///
/// Defaults to `~/.crm-sync/`; the `CRM_SYNC_STATE_DIR` environment variable
/// overrides it (used by integration tests to isolate state).
pub fn get_state_dir() -> Result<PathBuf> {
    let state_dir = match std::env::var_os("CRM_SYNC_STATE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let home = dirs::home_dir().context("Failed to determine home directory")?;
            home.join(".crm-sync")
        }
    };

    if !state_dir.exists() {
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory: {:?}", state_dir))?;
    }

    Ok(state_dir)
}

/// Get the path of the checkpoint file for a sync flavor (e.g. "leads-pages").
pub fn checkpoint_path(flavor: &str) -> Result<PathBuf> {
    Ok(get_state_dir()?.join(format!("checkpoint-{}.json", flavor)))
}

/// Get the directory holding per-run log files, creating it if needed.
pub fn log_dir() -> Result<PathBuf> {
    let dir = get_state_dir()?.join("logs");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
    }
    Ok(dir)
}

/// Build the log file path for a run starting at the given local time.
///
/// One append-only file per scheduled run, named by start timestamp.
pub fn run_log_path(started_at: chrono::DateTime<chrono::Local>) -> Result<PathBuf> {
    let name = format!("run-{}.log", started_at.format("%Y%m%d-%H%M%S"));
    Ok(log_dir()?.join(name))
}
