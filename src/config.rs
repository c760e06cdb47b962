// ABOUTME: Immutable configuration for the sync engine
// ABOUTME: One SyncConfig value is built in main and passed into every component

use anyhow::{bail, Result};
use chrono::NaiveTime;
use std::path::PathBuf;
use std::time::Duration;

/// Which universe of records a run iterates over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMode {
    /// Open-ended page iteration against the CRM list endpoint.
    Pages,
    /// Targeted re-fetch of the distinct lead ids referenced by the
    /// opportunities table, one lookup per id.
    IdList,
}

impl SyncMode {
    /// Short name used in the checkpoint file name, one file per flavor.
    pub fn flavor(&self) -> &'static str {
        match self {
            SyncMode::Pages => "leads-pages",
            SyncMode::IdList => "leads-by-id",
        }
    }
}

/// Tunable knobs of a run. Conservative and fast variants are the same
/// control loop under different policy values, so they live here as data
/// instead of forked code paths.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Records requested per page (also the upsert batch bound).
    pub page_size: u32,
    /// Fixed delay between loop iterations, success or failure. Sized to stay
    /// under the upstream steady-state rate limit.
    pub page_delay: Duration,
    /// Attempts per fetch/write before the run aborts.
    pub max_attempts: u32,
    /// First delay for transient failures; doubles each retry.
    pub retry_delay: Duration,
    /// Cooldown applied when the upstream reports throttling.
    pub throttle_cooldown: Duration,
    /// Consecutive rejected write batches that abort the run.
    pub max_consecutive_write_failures: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            page_size: 100,
            page_delay: Duration::from_secs(2),
            max_attempts: 4,
            retry_delay: Duration::from_secs(5),
            throttle_cooldown: Duration::from_secs(300), // 5 minutes
            max_consecutive_write_failures: 3,
        }
    }
}

impl SyncPolicy {
    /// Low page size and generous delays for a heavily throttled tenant.
    pub fn conservative() -> Self {
        Self {
            page_size: 50,
            page_delay: Duration::from_secs(5),
            retry_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// Larger pages and a short inter-page delay for an off-peak backfill.
    pub fn fast() -> Self {
        Self {
            page_size: 200,
            page_delay: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub fn by_name(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(Self::default()),
            "conservative" => Ok(Self::conservative()),
            "fast" => Ok(Self::fast()),
            other => bail!(
                "Unknown sync policy '{}'. Expected one of: default, conservative, fast",
                other
            ),
        }
    }
}

/// Daily window inside which the scheduler may start runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    pub opens_at: NaiveTime,
    pub closes_at: NaiveTime,
}

impl Default for DailyWindow {
    fn default() -> Self {
        Self {
            opens_at: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            closes_at: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
        }
    }
}

impl DailyWindow {
    pub fn new(opens_at: NaiveTime, closes_at: NaiveTime) -> Result<Self> {
        if opens_at >= closes_at {
            bail!(
                "Window must open before it closes (got {} .. {})",
                opens_at,
                closes_at
            );
        }
        Ok(Self {
            opens_at,
            closes_at,
        })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.opens_at && time <= self.closes_at
    }
}

/// Everything a run needs, resolved once at startup.
///
/// There is deliberately no ambient global configuration: components receive
/// this by reference through their constructors so tests can substitute
/// doubles behind the same seams.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the CRM API, e.g. "https://example.crmapi.com/v1".
    pub api_base_url: String,
    /// API token; sent as both a header and a query parameter.
    pub api_token: String,
    /// Destination PostgreSQL connection string.
    pub warehouse_url: String,
    /// Schema-qualified destination table, e.g. ("analytics", "crm_leads").
    pub dest_schema: String,
    pub dest_table: String,
    /// Read-only table supplying the id universe in id-list mode.
    pub opportunities_table: String,
    pub mode: SyncMode,
    pub policy: SyncPolicy,
    /// Where the checkpoint for this flavor is persisted.
    pub checkpoint_path: PathBuf,
}
