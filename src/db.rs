// ABOUTME: Warehouse PostgreSQL connections and reference-table reads
// ABOUTME: TLS-capable connect with bounded retry, plus the id-universe scan

use anyhow::{Context, Result};
use std::time::Duration;
use tokio_postgres::Client;

/// Connect to the warehouse.
///
/// The connection task is spawned in the background, as tokio-postgres
/// requires; its errors surface through the client on the next query.
pub async fn connect(url: &str) -> Result<Client> {
    let connector = native_tls::TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = postgres_native_tls::MakeTlsConnector::new(connector);

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .context("Failed to connect to warehouse database")?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Warehouse connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect with a small fixed retry budget for transient connect failures
/// (endpoint waking up, brief network blips).
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    let max_attempts = 3;
    let mut delay = Duration::from_secs(2);

    for attempt in 1..=max_attempts {
        match connect(url).await {
            Ok(client) => return Ok(client),
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    "Warehouse connect failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    max_attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop either returns a client or the final error")
}

/// Distinct lead ids referenced by the opportunities table, sorted ascending.
///
/// This read-only scan establishes the id universe for id-list mode. The
/// table is consumed, never written, by the sync engine.
pub async fn list_reference_ids(client: &Client, qualified_table: &str) -> Result<Vec<i64>> {
    let (schema, table) = qualified_table
        .split_once('.')
        .unwrap_or(("public", qualified_table));

    let query = format!(
        "SELECT DISTINCT lead_id FROM \"{}\".\"{}\" WHERE lead_id IS NOT NULL ORDER BY lead_id",
        schema, table
    );

    let rows = client
        .query(&query, &[])
        .await
        .with_context(|| format!("Failed to scan reference ids from {}", qualified_table))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}
