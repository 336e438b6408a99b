//! Snapshot scanner for the initial load.
//!
//! Reads tables inside a `REPEATABLE READ` transaction pinned to the
//! snapshot the replication slot exported, so the bulk read sees exactly
//! the rows committed before the slot's consistent point.
//!
//! Rows are built server-side as JSON objects typed the way streamed changes
//! are: booleans, numbers and JSON columns keep their JSON type, everything
//! else is the column's text output. A timestamp therefore reads
//! `2024-01-01 00:00:00+00` whether it arrived by snapshot or by stream.

use std::future::Future;

use pgmeili_core::{split_table, Document};
use tokio_postgres::Client;
use tracing::{debug, info};

use crate::error::{PgError, PgResult};
use crate::replication::decoder::oid;
use crate::replication::{quote_ident, quote_literal, SlotAnchor};

const CURSOR_NAME: &str = "pgmeili_snapshot";

/// SQLSTATE undefined_table
const UNDEFINED_TABLE: &str = "42P01";

/// `jsonb_build_object` takes at most 100 arguments.
const PAIRS_PER_OBJECT: usize = 50;

/// A source of table rows for the initial load.
pub trait RowSource: Send {
    /// Start reading a schema-qualified table. Returns the estimated row count.
    fn open(&mut self, table: &str) -> impl Future<Output = PgResult<Option<i64>>> + Send;

    /// Next rows of the open table; empty when the table is exhausted.
    fn fetch(&mut self, max_rows: usize) -> impl Future<Output = PgResult<Vec<Document>>> + Send;
}

/// Scans tables through a server-side cursor in the slot's snapshot.
pub struct SnapshotScanner {
    client: Client,
    table: Option<String>,
}

impl SnapshotScanner {
    /// Open the snapshot transaction. Must run while the replication
    /// connection that exported the snapshot is still idle, which the
    /// borrowed anchor guarantees.
    pub async fn begin(client: Client, anchor: &SlotAnchor) -> PgResult<Self> {
        let snapshot = anchor
            .snapshot_name
            .as_deref()
            .ok_or_else(|| PgError::NoSnapshot(anchor.slot_name.clone()))?;

        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; SET TRANSACTION SNAPSHOT {}",
                quote_literal(snapshot)
            ))
            .await?;

        info!(snapshot, slot = %anchor.slot_name, "Opened snapshot transaction");

        Ok(Self {
            client,
            table: None,
        })
    }

    /// Commit the snapshot transaction.
    pub async fn finish(self) -> PgResult<()> {
        self.client.batch_execute("COMMIT").await?;
        debug!("Closed snapshot transaction");
        Ok(())
    }

    async fn estimate_rows(&self, schema: &str, table: &str) -> PgResult<Option<i64>> {
        let row = self
            .client
            .query_opt(
                "SELECT c.reltuples::bigint FROM pg_class c \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&schema, &table],
            )
            .await?;

        Ok(row.map(|r| r.get::<_, i64>(0)).filter(|n| *n > 0))
    }

    async fn columns(&self, schema: &str, table: &str) -> PgResult<Vec<(String, u32)>> {
        let rows = self
            .client
            .query(
                "SELECT a.attname::text, a.atttypid FROM pg_attribute a \
                 JOIN pg_class c ON c.oid = a.attrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                 AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum",
                &[&schema, &table],
            )
            .await?;

        rows.iter()
            .map(|row| -> PgResult<(String, u32)> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect()
    }
}

impl RowSource for SnapshotScanner {
    async fn open(&mut self, qualified: &str) -> PgResult<Option<i64>> {
        if self.table.is_some() {
            self.client
                .batch_execute(&format!("CLOSE {}", CURSOR_NAME))
                .await?;
            self.table = None;
        }

        let (schema, table) = split_table(qualified);
        let columns = self.columns(schema, table).await?;
        let declare = format!(
            "DECLARE {} NO SCROLL CURSOR FOR {}",
            CURSOR_NAME,
            select_rows_sql(schema, table, &columns)
        );
        if let Err(e) = self.client.batch_execute(&declare).await {
            let err = PgError::from(e);
            if err.code() == Some(UNDEFINED_TABLE) {
                return Err(PgError::TableNotFound {
                    schema: schema.to_string(),
                    table: table.to_string(),
                });
            }
            return Err(err);
        }

        self.table = Some(format!("{}.{}", schema, table));
        let estimate = self.estimate_rows(schema, table).await?;

        debug!(
            table = qualified,
            columns = columns.len(),
            estimate = ?estimate,
            "Opened snapshot cursor"
        );
        Ok(estimate)
    }

    async fn fetch(&mut self, max_rows: usize) -> PgResult<Vec<Document>> {
        if self.table.is_none() {
            return Err(PgError::Protocol("fetch without an open table".into()));
        }

        let rows = self
            .client
            .query(&format!("FETCH {} FROM {}", max_rows.max(1), CURSOR_NAME), &[])
            .await?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            match row.try_get::<_, serde_json::Value>(0)? {
                serde_json::Value::Object(doc) => documents.push(doc),
                other => {
                    return Err(PgError::Decode(format!(
                        "snapshot row is not an object: {}",
                        other
                    )));
                }
            }
        }

        Ok(documents)
    }
}

/// `SELECT` producing one JSON object per row of `schema.table`.
fn select_rows_sql(schema: &str, table: &str, columns: &[(String, u32)]) -> String {
    let object = if columns.is_empty() {
        "'{}'::jsonb".to_string()
    } else {
        columns
            .chunks(PAIRS_PER_OBJECT)
            .map(|chunk| {
                let pairs: Vec<String> = chunk
                    .iter()
                    .map(|(name, type_oid)| {
                        format!("{}, {}", quote_literal(name), column_json(name, *type_oid))
                    })
                    .collect();
                format!("jsonb_build_object({})", pairs.join(", "))
            })
            .collect::<Vec<_>>()
            .join(" || ")
    };

    format!(
        "SELECT {} FROM {}.{} t",
        object,
        quote_ident(schema),
        quote_ident(table)
    )
}

/// JSON for one column, typed the same way a streamed text value is parsed.
fn column_json(name: &str, type_oid: u32) -> String {
    let column = format!("t.{}", quote_ident(name));
    match type_oid {
        oid::BOOL | oid::INT2 | oid::INT4 | oid::INT8 | oid::FLOAT4 | oid::FLOAT8 => {
            format!("to_jsonb({})", column)
        }
        oid::JSON | oid::JSONB => format!("to_jsonb({})", column),
        // Integers too wide for i64 stay text so no digit is lost.
        oid::NUMERIC => format!(
            "CASE WHEN scale({c}) = 0 AND abs({c}) > 9223372036854775807 \
             THEN to_jsonb({c}::text) ELSE to_jsonb({c}) END",
            c = column
        ),
        _ => format!("to_jsonb({}::text)", column),
    }
}
