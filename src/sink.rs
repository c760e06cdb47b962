// ABOUTME: Conflict-by-id bulk writer for canonical rows
// ABOUTME: One INSERT ... ON CONFLICT DO UPDATE per batch, full-row last-write-wins

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::mapper::CanonicalRecord;

/// Columns of the destination table, in write order. The first is the
/// conflict key.
pub const COLUMNS: [&str; 13] = [
    "id",
    "firstname",
    "lastname",
    "email",
    "phone",
    "company",
    "stage",
    "source",
    "value",
    "created_at",
    "updated_at",
    "stage_entered_at",
    "synced_at",
];

/// Result of one batch write, as the orchestrator counts it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub accepted: u64,
    pub rejected: u64,
}

/// Destination for mapped batches. The warehouse implementation is
/// [`PostgresSink`]; tests substitute an in-memory double behind this seam.
#[async_trait]
pub trait RecordSink {
    /// Write one batch keyed by canonical id. All-or-nothing from the
    /// caller's view: one attempt, one `Err` on backend failure. Retries are
    /// the orchestrator's job, which is why this takes `&self`.
    async fn write(&self, batch: &[CanonicalRecord]) -> Result<WriteOutcome>;
}

/// Writes batches to the schema-qualified warehouse table using upsert.
///
/// Matching rows are fully overwritten (last-write-wins across all columns),
/// new rows inserted. The write needs no read-back; the affected-row count
/// from `execute` is the acceptance tally.
pub struct PostgresSink {
    client: Client,
    schema: String,
    table: String,
}

impl PostgresSink {
    pub fn new(client: Client, schema: &str, table: &str) -> Self {
        Self {
            client,
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    async fn write(&self, batch: &[CanonicalRecord]) -> Result<WriteOutcome> {
        if batch.is_empty() {
            return Ok(WriteOutcome::default());
        }

        // PostgreSQL caps a statement at ~65535 parameters
        let max_rows = 65000 / COLUMNS.len();
        let mut accepted = 0u64;

        for chunk in batch.chunks(max_rows.max(1)) {
            let query = build_upsert_query(&self.schema, &self.table, chunk.len());
            let params = bind_params(chunk);

            let affected = self
                .client
                .execute(&query, &params)
                .await
                .with_context(|| {
                    format!("Failed to upsert batch into {}.{}", self.schema, self.table)
                })?;
            accepted += affected;
        }

        Ok(WriteOutcome {
            accepted,
            rejected: 0,
        })
    }
}

fn bind_params(batch: &[CanonicalRecord]) -> Vec<&(dyn ToSql + Sync)> {
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(batch.len() * COLUMNS.len());
    for row in batch {
        params.push(&row.id);
        params.push(&row.firstname);
        params.push(&row.lastname);
        params.push(&row.email);
        params.push(&row.phone);
        params.push(&row.company);
        params.push(&row.stage);
        params.push(&row.source);
        params.push(&row.value);
        params.push(&row.created_at);
        params.push(&row.updated_at);
        params.push(&row.stage_entered_at);
        params.push(&row.synced_at);
    }
    params
}

/// Build the upsert statement for a batch of the given size.
///
/// ```sql
/// INSERT INTO "schema"."table" ("id", "firstname", ...)
/// VALUES ($1, ..., $13), ($14, ...), ...
/// ON CONFLICT ("id") DO UPDATE SET
///   "firstname" = EXCLUDED."firstname", ...
/// ```
fn build_upsert_query(schema: &str, table: &str, num_rows: usize) -> String {
    let quoted_columns: Vec<String> = COLUMNS.iter().map(|c| format!("\"{}\"", c)).collect();

    let num_cols = COLUMNS.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let update_columns: Vec<String> = COLUMNS
        .iter()
        .skip(1) // everything but the conflict key
        .map(|c| format!("\"{}\" = EXCLUDED.\"{}\"", c, c))
        .collect();

    format!(
        "INSERT INTO \"{}\".\"{}\" ({}) VALUES {} ON CONFLICT (\"id\") DO UPDATE SET {}",
        schema,
        table,
        quoted_columns.join(", "),
        value_rows.join(", "),
        update_columns.join(", ")
    )
}
