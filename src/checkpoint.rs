// ABOUTME: Durable checkpoint enabling resume after interruption
// ABOUTME: JSON on local disk; one file per sync flavor, deleted on full drain

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Position within the id-universe of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Cursor {
    /// Open-ended page iteration: the next page to fetch.
    PageCursor { next_page: u64 },
    /// Targeted re-fetch: a precomputed id list and the next index into it.
    IdList { ids: Vec<i64>, position: usize },
}

impl Cursor {
    pub fn first_page() -> Self {
        Cursor::PageCursor { next_page: 0 }
    }

    pub fn id_list(ids: Vec<i64>) -> Self {
        Cursor::IdList { ids, position: 0 }
    }
}

/// Counters carried across a resumed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: u64,
    pub success: u64,
    pub errors: u64,
    pub skipped: u64,
}

/// Durable progress marker. Saved only after a batch has been committed to
/// the warehouse, so the cursor never runs ahead of durably written data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cursor: Cursor,
    pub counters: RunCounters,
    /// Version of the checkpoint format for future migrations
    pub version: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    pub fn new(cursor: Cursor) -> Self {
        let now = chrono::Utc::now();
        Self {
            cursor,
            counters: RunCounters::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the cursor past one committed batch. Panics in debug builds
    /// if the new position would move backwards; the cursor is monotonic
    /// within a run.
    pub fn advance(&mut self, counters: RunCounters) {
        match &mut self.cursor {
            Cursor::PageCursor { next_page } => {
                *next_page += 1;
            }
            Cursor::IdList { ids, position } => {
                debug_assert!(*position < ids.len());
                *position += 1;
            }
        }
        self.counters = counters;
        self.updated_at = chrono::Utc::now();
    }

    /// True once every page or id has been consumed. Page mode only drains
    /// via the upstream's empty-page signal, so it never self-reports done.
    pub fn is_exhausted(&self) -> bool {
        match &self.cursor {
            Cursor::PageCursor { .. } => false,
            Cursor::IdList { ids, position } => *position >= ids.len(),
        }
    }

    /// Load the checkpoint from disk; `None` when no previous run left one.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read checkpoint from {:?}", path))?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse checkpoint from {:?}", path))?;
        Ok(Some(checkpoint))
    }

    /// Persist the checkpoint. `load` after a crash returns exactly the state
    /// from the last successful `save`.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize checkpoint")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write checkpoint to {:?}", path))?;
        Ok(())
    }

    /// Remove the checkpoint after a clean drain so the next run starts fresh.
    pub async fn delete(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to remove checkpoint {:?}", path))?;
        }
        Ok(())
    }
}
