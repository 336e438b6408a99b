//! Initial bulk load of synced tables.
//!
//! Runs between slot setup and streaming, and only when the slot was just
//! created. A new slot starts at its own consistent point, so anything
//! committed while no slot was held exists only in the snapshot. Every
//! enabled table is therefore reloaded, even when its index already has
//! documents. Rows are read from a [`RowSource`] (the slot's exported
//! snapshot in production), keyed by the target's primary key, chunked by
//! [`DocumentBatcher`] and written with replace semantics, so a load
//! interrupted halfway can simply be run again.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pgmeili_core::{BatchConfig, Document, DocumentBatcher, SyncTarget};
use pgmeili_pg::RowSource;
use pgmeili_search::SearchIndex;
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Whether a table gets bulk loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDecision {
    Load,
    /// Load over documents left by an earlier run.
    Reload,
    /// `initial_load` is off for the table and the load was not forced.
    Disabled,
}

/// What loading one table did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub table: String,
    pub index: String,
    pub rows: u64,
    /// Rows without a usable primary key.
    pub skipped: u64,
    pub batches: u64,
}

pub async fn decide<C: SearchIndex>(
    client: &C,
    target: &SyncTarget,
    force: bool,
) -> Result<LoadDecision> {
    if !target.initial_load && !force {
        return Ok(LoadDecision::Disabled);
    }

    let populated = client
        .has_documents(&target.index)
        .await
        .with_context(|| format!("Failed to check index {} for documents", target.index))?;
    Ok(if populated {
        LoadDecision::Reload
    } else {
        LoadDecision::Load
    })
}

/// Load every target that wants it, or every target when `force` is set.
/// Any read or write failure aborts the load: streaming on top of a partial
/// baseline would leave the index silently incomplete.
pub async fn run_initial_load<R, C>(
    source: &mut R,
    client: &C,
    targets: &[SyncTarget],
    force: bool,
) -> Result<Vec<LoadSummary>>
where
    R: RowSource,
    C: SearchIndex,
{
    let mut summaries = Vec::new();

    for target in targets {
        match decide(client, target, force).await? {
            LoadDecision::Load => summaries.push(load_table(source, client, target).await?),
            LoadDecision::Reload => {
                info!(
                    table = %target.table,
                    index = %target.index,
                    "Index already has documents, reloading from the new slot's snapshot"
                );
                summaries.push(load_table(source, client, target).await?);
            }
            LoadDecision::Disabled => {
                debug!(table = %target.table, "Initial load disabled")
            }
        }
    }

    Ok(summaries)
}

pub async fn load_table<R, C>(source: &mut R, client: &C, target: &SyncTarget) -> Result<LoadSummary>
where
    R: RowSource,
    C: SearchIndex,
{
    let estimate = source
        .open(&target.table)
        .await
        .with_context(|| format!("Failed to open {} for the initial load", target.table))?;

    info!(
        table = %target.table,
        index = %target.index,
        estimated_rows = ?estimate,
        "Loading table"
    );

    let mut summary = LoadSummary {
        table: target.table.clone(),
        index: target.index.clone(),
        rows: 0,
        skipped: 0,
        batches: 0,
    };
    let mut batcher = DocumentBatcher::new(BatchConfig {
        max_rows: target.batch_size,
        ..BatchConfig::default()
    });

    let started = Instant::now();
    let mut last_progress = Instant::now();

    loop {
        let rows = source
            .fetch(target.batch_size)
            .await
            .with_context(|| format!("Failed to read rows from {}", target.table))?;
        if rows.is_empty() {
            break;
        }

        for row in rows {
            match target.document_from_row(row) {
                Ok((_, doc)) => {
                    if let Some(batch) = batcher.add(doc) {
                        flush(client, target, batch, &mut summary).await?;
                    }
                }
                Err(e) => {
                    summary.skipped += 1;
                    warn!(table = %target.table, error = %e, "Skipping row during initial load");
                }
            }
        }

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            info!(
                table = %target.table,
                rows = summary.rows,
                estimated_rows = ?estimate,
                "Initial load progress"
            );
            last_progress = Instant::now();
        }
    }

    if let Some(batch) = batcher.flush() {
        flush(client, target, batch, &mut summary).await?;
    }

    info!(
        table = %target.table,
        index = %target.index,
        rows = summary.rows,
        skipped = summary.skipped,
        batches = summary.batches,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Initial load complete"
    );
    Ok(summary)
}

async fn flush<C: SearchIndex>(
    client: &C,
    target: &SyncTarget,
    batch: Vec<Document>,
    summary: &mut LoadSummary,
) -> Result<()> {
    let task = client
        .add_documents(&target.index, &target.primary_key, &batch)
        .await
        .with_context(|| {
            format!(
                "Failed to write {} documents from {} to index {}",
                batch.len(),
                target.table,
                target.index
            )
        })?;

    debug!(
        index = %target.index,
        documents = batch.len(),
        task = task.task_uid,
        "Flushed initial load batch"
    );
    summary.rows += batch.len() as u64;
    summary.batches += 1;
    Ok(())
}
