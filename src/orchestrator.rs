// ABOUTME: The sync control loop: fetch, map, write, checkpoint, repeat
// ABOUTME: At-least-once delivery plus idempotent upserts yields effectively-once state

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Instant;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, Cursor, RunCounters};
use crate::config::SyncConfig;
use crate::crm::{CrmClient, Page, SourceRecord, UpstreamError};
use crate::governor::Governor;
use crate::mapper::{map_record, CanonicalRecord, FieldMap};
use crate::sink::RecordSink;

/// Where a finished run ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The upstream was fully drained; the checkpoint file was removed.
    Drained,
    /// A shutdown signal arrived; the last committed checkpoint is the next
    /// run's resume point.
    Interrupted,
}

/// Counters and timings for one run. Logged at exit, never persisted beyond
/// the checkpoint's copy of the counters.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub counters: RunCounters,
    pub batches_written: u64,
    pub unmapped_fields: u64,
    pub elapsed_secs: f64,
}

/// Upstream record source. The production implementation is [`CrmClient`];
/// orchestrator tests substitute a scripted in-memory source.
#[async_trait]
pub trait PageSource {
    async fn fetch_page(&self, page: u64, page_size: u32) -> Result<Page, UpstreamError>;
    async fn fetch_by_id(&self, id: i64) -> Result<Option<SourceRecord>, UpstreamError>;
}

#[async_trait]
impl PageSource for CrmClient {
    async fn fetch_page(&self, page: u64, page_size: u32) -> Result<Page, UpstreamError> {
        CrmClient::fetch_page(self, page, page_size).await
    }

    async fn fetch_by_id(&self, id: i64) -> Result<Option<SourceRecord>, UpstreamError> {
        CrmClient::fetch_by_id(self, id).await
    }
}

/// Runs the fetch/map/write/checkpoint loop for one sync flavor.
///
/// Strictly sequential: the upstream enforces a global per-credential rate
/// limit, so parallel fetches would only buy more throttling.
pub struct Orchestrator<'a, S: PageSource, K: RecordSink> {
    config: &'a SyncConfig,
    source: S,
    sink: K,
    field_map: FieldMap,
}

impl<'a, S: PageSource, K: RecordSink> Orchestrator<'a, S, K> {
    pub fn new(config: &'a SyncConfig, source: S, sink: K, field_map: FieldMap) -> Self {
        Self {
            config,
            source,
            sink,
            field_map,
        }
    }

    /// Execute one run to drain or abort.
    ///
    /// `universe` is the id-universe established at INIT (first page, or the
    /// precomputed reference id list). A persisted checkpoint, if present,
    /// replaces it at RESUME_CHECK. `shutdown` is polled between iterations;
    /// in-flight calls are never cancelled.
    pub async fn run(
        &mut self,
        universe: Cursor,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let policy = &self.config.policy;
        let governor = Governor::new(policy);

        // RESUME_CHECK: a previous interrupted run wins over a fresh universe.
        let mut checkpoint = match Checkpoint::load(&self.config.checkpoint_path).await? {
            Some(existing) => {
                tracing::info!(
                    "Resuming run {} from checkpoint {:?} ({} processed so far)",
                    run_id,
                    self.config.checkpoint_path,
                    existing.counters.processed
                );
                existing
            }
            None => {
                tracing::info!("Starting fresh run {} ({:?} mode)", run_id, self.config.mode);
                Checkpoint::new(universe)
            }
        };

        let mut counters = checkpoint.counters;
        let mut batches_written = 0u64;
        let mut unmapped_total = 0u64;
        let mut consecutive_write_failures = 0u32;

        let drained = loop {
            if shutdown.try_recv().is_ok() {
                tracing::info!(
                    "Shutdown signal received; run {} stopping cleanly at the last committed checkpoint",
                    run_id
                );
                break false;
            }

            if checkpoint.is_exhausted() {
                break true;
            }

            // FETCHING
            let (batch, exhausted) = match &checkpoint.cursor {
                Cursor::PageCursor { next_page } => {
                    let page = *next_page;
                    let fetched: Page = governor
                        .run("fetch page", || {
                            self.source.fetch_page(page, policy.page_size)
                        })
                        .await
                        .with_context(|| format!("Fetching page {} failed terminally", page))?;
                    tracing::info!(
                        "Fetched page {}: {} records{}",
                        page,
                        fetched.records.len(),
                        if fetched.exhausted { " (exhausted)" } else { "" }
                    );
                    (fetched.records, fetched.exhausted)
                }
                Cursor::IdList { ids, position } => {
                    let id = ids[*position];
                    let fetched = governor
                        .run("fetch lead", || self.source.fetch_by_id(id))
                        .await
                        .with_context(|| format!("Fetching lead {} failed terminally", id))?;
                    match fetched {
                        Some(record) => (vec![record], false),
                        None => {
                            tracing::debug!("Lead {} no longer exists upstream, skipping", id);
                            (vec![], false)
                        }
                    }
                }
            };

            if exhausted {
                break true;
            }

            // MAPPING: drop malformed records as skipped, tally unmapped keys
            let now = chrono::Utc::now();
            let mut mapped: Vec<CanonicalRecord> = Vec::with_capacity(batch.len());
            for record in &batch {
                counters.processed += 1;
                unmapped_total += self.field_map.unmapped_fields(record).len() as u64;
                match map_record(&self.field_map, record, now) {
                    Some(row) => mapped.push(row),
                    None => {
                        counters.skipped += 1;
                        tracing::warn!(
                            "Skipping record with missing or malformed id: {:?}",
                            record.raw_id()
                        );
                    }
                }
            }

            // WRITING: all-or-nothing per batch from our point of view.
            // Warehouse faults get the same bounded retry as fetches; only
            // an exhausted budget burns the batch.
            if !mapped.is_empty() {
                let sink = &self.sink;
                let rows = &mapped;
                let written = governor
                    .run("write batch", move || async move {
                        sink.write(rows)
                            .await
                            .map_err(|e| UpstreamError::Transient(format!("{:#}", e)))
                    })
                    .await;
                match written {
                    Ok(outcome) => {
                        counters.success += mapped.len() as u64;
                        batches_written += 1;
                        consecutive_write_failures = 0;
                        tracing::info!(
                            "Wrote batch of {} rows ({} accepted)",
                            mapped.len(),
                            outcome.accepted
                        );
                    }
                    Err(e) => {
                        counters.errors += mapped.len() as u64;
                        consecutive_write_failures += 1;
                        tracing::error!(
                            "Batch write rejected after retries ({} rows, consecutive failure {}): {}",
                            mapped.len(),
                            consecutive_write_failures,
                            e
                        );
                        if consecutive_write_failures >= policy.max_consecutive_write_failures {
                            bail!(
                                "Aborting run after {} consecutive rejected batches",
                                consecutive_write_failures
                            );
                        }
                    }
                }
            }

            // CHECKPOINTING: advance only after the write settled, so the
            // cursor never runs ahead of durably written data
            checkpoint.advance(counters);
            checkpoint
                .save(&self.config.checkpoint_path)
                .await
                .context("Failed to persist checkpoint")?;

            // Steady-state pacing under the upstream rate limit, applied on
            // success and failure alike
            tokio::time::sleep(policy.page_delay).await;
        };

        let summary = RunSummary {
            run_id,
            state: if drained {
                RunState::Drained
            } else {
                RunState::Interrupted
            },
            counters,
            batches_written,
            unmapped_fields: unmapped_total,
            elapsed_secs: started.elapsed().as_secs_f64(),
        };

        if drained {
            // DRAINED: next run starts clean
            Checkpoint::delete(&self.config.checkpoint_path)
                .await
                .context("Failed to remove checkpoint after drain")?;
        }

        log_summary(&summary);
        Ok(summary)
    }
}

fn log_summary(summary: &RunSummary) {
    tracing::info!(
        "Run {} finished ({:?}): processed={} success={} errors={} skipped={} batches={} unmapped_fields={} elapsed={:.1}s",
        summary.run_id,
        summary.state,
        summary.counters.processed,
        summary.counters.success,
        summary.counters.errors,
        summary.counters.skipped,
        summary.batches_written,
        summary.unmapped_fields,
        summary.elapsed_secs
    );
}
