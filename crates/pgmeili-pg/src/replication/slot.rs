//! Replication slot and publication setup over the replication connection.

use pgmeili_core::{format_lsn, parse_lsn};
use tracing::{info, warn};

use super::decoder::DecodePlugin;
use super::publication::{create_publication_sql, quote_ident, quote_literal};
use super::transport::{ReplicationTransport, TextRow};
use crate::error::{PgError, PgResult};

/// SQLSTATE duplicate_object
const DUPLICATE_OBJECT: &str = "42710";
/// SQLSTATE undefined_object
const UNDEFINED_OBJECT: &str = "42704";

/// What to do with a slot left over from a previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
    /// Drop and recreate the slot, exporting a fresh snapshot.
    #[default]
    Recreate,
    /// Keep an existing slot with the same plugin and continue from its
    /// confirmed flush position. No snapshot is available.
    Resume,
}

impl SlotPolicy {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "recreate" => Some(SlotPolicy::Recreate),
            "resume" => Some(SlotPolicy::Resume),
            _ => None,
        }
    }
}

/// The slot's starting point, produced once by slot setup.
///
/// Not `Clone`: `ReplicationSession::start_streaming` consumes
/// it, so a snapshot read that borrows it must finish first.
#[derive(Debug)]
pub struct SlotAnchor {
    pub slot_name: String,
    pub consistent_point: u64,
    /// Exported snapshot name; `None` when an existing slot was resumed.
    pub snapshot_name: Option<String>,
    /// Whether the slot was created by this run.
    pub created: bool,
}

/// `CREATE PUBLICATION`, tolerating one that already exists.
pub async fn ensure_publication<T: ReplicationTransport>(
    transport: &mut T,
    publication: &str,
    tables: &[String],
) -> PgResult<()> {
    match transport
        .simple_query(&create_publication_sql(publication, tables))
        .await
    {
        Ok(_) => {
            info!(publication, tables = ?tables, "Created publication");
            Ok(())
        }
        Err(e) if e.code() == Some(DUPLICATE_OBJECT) => {
            info!(publication, "Publication already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// `DROP_REPLICATION_SLOT`, tolerating a missing slot.
pub async fn drop_slot<T: ReplicationTransport>(transport: &mut T, slot: &str) -> PgResult<()> {
    match transport
        .simple_query(&format!("DROP_REPLICATION_SLOT {}", quote_ident(slot)))
        .await
    {
        Ok(_) => {
            info!(slot, "Dropped replication slot");
            Ok(())
        }
        Err(e) if e.code() == Some(UNDEFINED_OBJECT) => Ok(()),
        Err(e) => Err(e),
    }
}

/// `CREATE_REPLICATION_SLOT ... EXPORT_SNAPSHOT`.
pub async fn create_slot<T: ReplicationTransport>(
    transport: &mut T,
    slot: &str,
    plugin: DecodePlugin,
) -> PgResult<SlotAnchor> {
    let sql = format!(
        "CREATE_REPLICATION_SLOT {} LOGICAL {} EXPORT_SNAPSHOT",
        quote_ident(slot),
        plugin.name()
    );
    let rows = transport
        .simple_query(&sql)
        .await
        .map_err(|e| PgError::SlotCreationFailed(e.to_string()))?;

    // slot_name | consistent_point | snapshot_name | output_plugin
    let row = rows
        .first()
        .ok_or_else(|| PgError::SlotCreationFailed("no result row".into()))?;
    let consistent_point = parse_lsn(&field(row, 1, "consistent_point")?)?;
    let snapshot_name = field(row, 2, "snapshot_name")?;

    info!(
        slot,
        plugin = %plugin,
        consistent_point = %format_lsn(consistent_point),
        snapshot = %snapshot_name,
        "Created replication slot"
    );

    Ok(SlotAnchor {
        slot_name: slot.to_string(),
        consistent_point,
        snapshot_name: Some(snapshot_name),
        created: true,
    })
}

/// Plugin and confirmed flush position of an existing slot.
pub async fn existing_slot<T: ReplicationTransport>(
    transport: &mut T,
    slot: &str,
) -> PgResult<Option<(String, Option<u64>)>> {
    let sql = format!(
        "SELECT plugin, confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = {}",
        quote_literal(slot)
    );
    let rows = transport.simple_query(&sql).await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let plugin = row.first().cloned().flatten().unwrap_or_default();
    let confirmed = match row.get(1).cloned().flatten() {
        Some(text) => Some(parse_lsn(&text)?),
        None => None,
    };
    Ok(Some((plugin, confirmed)))
}

/// Make sure the publication and slot exist, following `policy`.
pub async fn setup_slot<T: ReplicationTransport>(
    transport: &mut T,
    slot: &str,
    publication: &str,
    tables: &[String],
    plugin: DecodePlugin,
    policy: SlotPolicy,
) -> PgResult<SlotAnchor> {
    ensure_publication(transport, publication, tables).await?;

    if policy == SlotPolicy::Resume {
        match existing_slot(transport, slot).await? {
            Some((existing, Some(confirmed))) if existing == plugin.name() => {
                info!(
                    slot,
                    confirmed_flush = %format_lsn(confirmed),
                    "Resuming existing replication slot"
                );
                return Ok(SlotAnchor {
                    slot_name: slot.to_string(),
                    consistent_point: confirmed,
                    snapshot_name: None,
                    created: false,
                });
            }
            Some((existing, _)) => {
                warn!(
                    slot,
                    existing = %existing,
                    wanted = %plugin,
                    "Existing slot is not resumable, recreating"
                );
            }
            None => {}
        }
    }

    drop_slot(transport, slot).await?;
    create_slot(transport, slot, plugin).await
}

/// `START_REPLICATION SLOT ... LOGICAL X/Y (options)`.
pub fn start_replication_sql(slot: &str, start: u64, options: &str) -> String {
    format!(
        "START_REPLICATION SLOT {} LOGICAL {} {}",
        quote_ident(slot),
        format_lsn(start),
        options
    )
}

fn field(row: &TextRow, index: usize, name: &str) -> PgResult<String> {
    row.get(index)
        .cloned()
        .flatten()
        .ok_or_else(|| PgError::SlotCreationFailed(format!("missing {}", name)))
}
