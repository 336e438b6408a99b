//! Replica identity check for synced tables.
//!
//! A delete only carries the columns of the table's replica identity. With
//! `REPLICA IDENTITY NOTHING` no key is sent at all, so deletes can never be
//! mapped to a document.

use pgmeili_core::split_table;
use tokio_postgres::Client;
use tracing::{debug, warn};

use crate::error::{PgError, PgResult};

/// `pg_class.relreplident` of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentityKind {
    Default,
    Nothing,
    Full,
    Index,
}

impl ReplicaIdentityKind {
    fn from_code(code: i8) -> Self {
        match code as u8 {
            b'n' => ReplicaIdentityKind::Nothing,
            b'f' => ReplicaIdentityKind::Full,
            b'i' => ReplicaIdentityKind::Index,
            _ => ReplicaIdentityKind::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaIdentityReport {
    pub table: String,
    pub identity: ReplicaIdentityKind,
}

impl ReplicaIdentityReport {
    /// Whether deletes on this table will carry old keys.
    pub fn deletes_resolvable(&self) -> bool {
        self.identity != ReplicaIdentityKind::Nothing
    }
}

/// Read the replica identity of every table, warning about ones whose
/// deletes cannot be synced. Fails if a table does not exist.
pub async fn check_replica_identity(
    client: &Client,
    tables: &[String],
) -> PgResult<Vec<ReplicaIdentityReport>> {
    let mut reports = Vec::with_capacity(tables.len());

    for qualified in tables {
        let (schema, table) = split_table(qualified);
        let row = client
            .query_opt(
                "SELECT c.relreplident FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&schema, &table],
            )
            .await?
            .ok_or_else(|| PgError::TableNotFound {
                schema: schema.to_string(),
                table: table.to_string(),
            })?;

        let report = ReplicaIdentityReport {
            table: format!("{}.{}", schema, table),
            identity: ReplicaIdentityKind::from_code(row.get(0)),
        };

        if report.deletes_resolvable() {
            debug!(table = %report.table, identity = ?report.identity, "Replica identity");
        } else {
            warn!(
                table = %report.table,
                "REPLICA IDENTITY NOTHING: deletes will not reach the index"
            );
        }
        reports.push(report);
    }

    Ok(reports)
}
