// ABOUTME: Hourly scheduler running one isolated sync child process per slot
// ABOUTME: Slots are clamped to a daily window; a failed run never kills the loop

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, Timelike};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::DailyWindow;
use crate::statedir;

/// Compute the next run slot after `now`.
///
/// Next slot = the next hour boundary, pushed to the window's opening instant
/// (same or next day) if the boundary falls outside the window.
pub fn next_run_after(now: NaiveDateTime, window: DailyWindow) -> NaiveDateTime {
    let hour_start = now
        .date()
        .and_hms_opt(now.hour(), 0, 0)
        .expect("hour truncation is always valid");
    let boundary = hour_start + ChronoDuration::hours(1);

    if window.contains(boundary.time()) {
        boundary
    } else if boundary.time() < window.opens_at {
        boundary.date().and_time(window.opens_at)
    } else {
        (boundary.date() + ChronoDuration::days(1)).and_time(window.opens_at)
    }
}

/// Spawns one `crm-sync run` child per scheduled slot.
///
/// Each child is an isolated process whose stdout/stderr go to a timestamped
/// log file under the state directory. Overlap between a slow run and the
/// next slot is assumed away by the schedule spacing, not enforced.
pub struct Scheduler {
    window: DailyWindow,
    /// Arguments appended after `run` when spawning the child.
    run_args: Vec<String>,
}

impl Scheduler {
    pub fn new(window: DailyWindow, run_args: Vec<String>) -> Self {
        Self { window, run_args }
    }

    /// Run the scheduling loop until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Scheduler started: hourly slots between {} and {}",
            self.window.opens_at,
            self.window.closes_at
        );

        loop {
            let now = Local::now().naive_local();
            let next = next_run_after(now, self.window);
            let wait = (next - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);

            tracing::info!("Next sync run at {} (in {:?})", next, wait);

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping scheduler");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.spawn_run().await {
                Ok(status) if status.success() => {
                    tracing::info!("Sync run completed cleanly (exit 0)");
                }
                Ok(status) => {
                    // The child's checkpoint survives; the next slot resumes it
                    tracing::error!("Sync run failed with {}; next slot will retry", status);
                }
                Err(e) => {
                    tracing::error!("Failed to launch sync run: {:?}", e);
                }
            }
        }
    }

    async fn spawn_run(&self) -> Result<std::process::ExitStatus> {
        let exe = std::env::current_exe().context("Failed to resolve current executable")?;
        let started_at = Local::now();
        let log_path = statedir::run_log_path(started_at)?;

        let log_file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create run log {:?}", log_path))?;
        let log_err = log_file
            .try_clone()
            .context("Failed to clone run log handle")?;

        tracing::info!("Spawning sync run, logging to {:?}", log_path);

        let mut child = Command::new(exe)
            .arg("run")
            .args(&self.run_args)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .spawn()
            .context("Failed to spawn sync run child process")?;

        let status = child
            .wait()
            .await
            .context("Failed to await sync run child process")?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_mid_window_rolls_to_next_hour() {
        let next = next_run_after(at(14, 25), DailyWindow::default());
        assert_eq!(next, at(15, 0));
    }

    #[test]
    fn test_after_close_pushes_to_next_day_opening() {
        // 23:30 with a 06:00-23:00 window: next run is 06:00 the following day
        let next = next_run_after(at(23, 30), DailyWindow::default());
        assert_eq!(
            next,
            NaiveDate::from_ymd_opt(2025, 6, 11)
                .unwrap()
                .and_hms_opt(6, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_before_open_pushes_to_same_day_opening() {
        let next = next_run_after(at(3, 15), DailyWindow::default());
        assert_eq!(next, at(6, 0));
    }

    #[test]
    fn test_last_in_window_slot_is_kept() {
        // 22:10 -> 23:00, which is still inside the 06:00-23:00 window
        let next = next_run_after(at(22, 10), DailyWindow::default());
        assert_eq!(next, at(23, 0));
    }

    #[test]
    fn test_exact_hour_moves_to_following_boundary() {
        let next = next_run_after(at(10, 0), DailyWindow::default());
        assert_eq!(next, at(11, 0));
    }
}
