//! Turns XLogData payloads into `WalChange`s.
//!
//! Two output plugins are supported: wal2json (one JSON document per
//! transaction) and pgoutput (the native binary logical replication
//! protocol). The decoder is chosen once when the session starts.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use pgmeili_core::{ChangeBatch, ChangeKind, OldKeys, Value, WalChange};
use tracing::{debug, info};

use super::pgoutput::{
    ColumnInfo, ColumnValue, OldTuple, PgOutputDecoder, PgOutputMessage, TupleData,
};
use super::publication::quote_ident;
use super::relation_cache::{RelationCache, RelationInfo};
use crate::error::{PgError, PgResult};

/// Logical decoding output plugin used by the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodePlugin {
    #[default]
    Wal2Json,
    PgOutput,
}

impl DecodePlugin {
    pub fn name(&self) -> &'static str {
        match self {
            DecodePlugin::Wal2Json => "wal2json",
            DecodePlugin::PgOutput => "pgoutput",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "wal2json" => Some(DecodePlugin::Wal2Json),
            "pgoutput" => Some(DecodePlugin::PgOutput),
            _ => None,
        }
    }

    /// Option list for `START_REPLICATION ... LOGICAL X/Y (...)`.
    pub fn start_options(&self, publication: &str, proto_version: u32) -> String {
        match self {
            DecodePlugin::Wal2Json => "(\"pretty-print\" '0', \"write-in-chunks\" '0')".to_string(),
            DecodePlugin::PgOutput => {
                let publications = quote_ident(publication).replace('\'', "''");
                let mut options = format!(
                    "(proto_version '{}', publication_names '{}'",
                    proto_version, publications
                );
                if proto_version >= 2 {
                    options.push_str(", streaming 'on'");
                }
                options.push(')');
                options
            }
        }
    }
}

impl fmt::Display for DecodePlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DecodePlugin {
    type Err = PgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
            .ok_or_else(|| PgError::Protocol(format!("unknown output plugin: {}", s)))
    }
}

/// Decoding strategy for one replication session.
#[derive(Debug)]
pub enum MessageDecoder {
    Json,
    Binary(BinaryDecoder),
}

impl MessageDecoder {
    pub fn for_plugin(plugin: DecodePlugin) -> Self {
        match plugin {
            DecodePlugin::Wal2Json => MessageDecoder::Json,
            DecodePlugin::PgOutput => MessageDecoder::Binary(BinaryDecoder::new()),
        }
    }

    /// Decode one XLogData payload. Every change is stamped with `lsn`.
    ///
    /// `PgError::Decode` means only this frame is bad; any other error means
    /// the stream can no longer be interpreted.
    pub fn decode(&mut self, payload: &[u8], lsn: u64) -> PgResult<Vec<WalChange>> {
        match self {
            MessageDecoder::Json => {
                ChangeBatch::parse(payload)
                    .and_then(|batch| batch.into_changes(lsn))
                    .map_err(|e| PgError::Decode(e.to_string()))
            }
            MessageDecoder::Binary(decoder) => decoder.decode(payload, lsn),
        }
    }
}

/// Stateful pgoutput decoder: relation cache plus streamed-transaction buffers.
#[derive(Debug, Default)]
pub struct BinaryDecoder {
    parser: PgOutputDecoder,
    relations: RelationCache,
    /// Top-level xid of the open `Stream Start` block, if any.
    current_stream: Option<u32>,
    /// Changes of in-progress streamed transactions, tagged with the
    /// (sub)transaction that produced them.
    streams: HashMap<u32, Vec<(u32, WalChange)>>,
}

impl BinaryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, payload: &[u8], lsn: u64) -> PgResult<Vec<WalChange>> {
        let in_stream = self.current_stream.is_some();
        let message = self.parser.decode(payload, in_stream)?;

        match message {
            PgOutputMessage::Relation(rel) => {
                debug!(
                    relation_id = rel.relation_id,
                    table = %format!("{}.{}", rel.namespace, rel.name),
                    columns = rel.columns.len(),
                    "Relation"
                );
                self.relations.update(&rel);
                Ok(Vec::new())
            }
            PgOutputMessage::Insert(msg) => {
                let rel = self.relation(msg.relation_id)?;
                let mut change = new_change(rel, ChangeKind::Insert, lsn);
                fill_columns(&mut change, rel, &msg.tuple)?;
                self.emit(msg.xid, change)
            }
            PgOutputMessage::Update(msg) => {
                let rel = self.relation(msg.relation_id)?;
                let mut change = new_change(rel, ChangeKind::Update, lsn);
                fill_columns(&mut change, rel, &msg.new_tuple)?;
                change.old_keys = match &msg.old_tuple {
                    Some(old) => old_keys(rel, old)?,
                    None => key_columns(rel, &msg.new_tuple)?,
                };
                self.emit(msg.xid, change)
            }
            PgOutputMessage::Delete(msg) => {
                let rel = self.relation(msg.relation_id)?;
                let mut change = new_change(rel, ChangeKind::Delete, lsn);
                change.old_keys = old_keys(rel, &msg.old_tuple)?;
                self.emit(msg.xid, change)
            }
            PgOutputMessage::Truncate(msg) => {
                let tables: Vec<String> = msg
                    .relation_ids
                    .iter()
                    .map(|id| match self.relations.get(*id) {
                        Some(rel) => format!("{}.{}", rel.namespace, rel.name),
                        None => format!("oid:{}", id),
                    })
                    .collect();
                info!(tables = ?tables, "Ignoring TRUNCATE");
                Ok(Vec::new())
            }
            PgOutputMessage::StreamStart(start) => {
                debug!(xid = start.xid, first = start.first_segment, "Stream start");
                self.current_stream = Some(start.xid);
                Ok(Vec::new())
            }
            PgOutputMessage::StreamStop => {
                self.current_stream = None;
                Ok(Vec::new())
            }
            PgOutputMessage::StreamCommit(commit) => {
                let buffered = self.streams.remove(&commit.xid).unwrap_or_default();
                info!(
                    xid = commit.xid,
                    changes = buffered.len(),
                    "Streamed transaction committed"
                );
                Ok(buffered.into_iter().map(|(_, change)| change).collect())
            }
            PgOutputMessage::StreamAbort(abort) => {
                let dropped = if abort.xid == abort.subxid {
                    self.streams.remove(&abort.xid).map_or(0, |b| b.len())
                } else if let Some(buffer) = self.streams.get_mut(&abort.xid) {
                    let before = buffer.len();
                    buffer.retain(|(xid, _)| *xid != abort.subxid);
                    before - buffer.len()
                } else {
                    0
                };
                info!(
                    xid = abort.xid,
                    subxid = abort.subxid,
                    dropped,
                    "Streamed transaction aborted"
                );
                Ok(Vec::new())
            }
            PgOutputMessage::Begin(_)
            | PgOutputMessage::Commit(_)
            | PgOutputMessage::Type(_)
            | PgOutputMessage::Origin(_)
            | PgOutputMessage::Message(_) => Ok(Vec::new()),
        }
    }

    fn relation(&self, relation_id: u32) -> PgResult<&RelationInfo> {
        self.relations
            .get(relation_id)
            .ok_or(PgError::RelationNotFound(relation_id))
    }

    /// Changes inside a stream block are held until the stream commits.
    fn emit(&mut self, xid: Option<u32>, change: WalChange) -> PgResult<Vec<WalChange>> {
        match (self.current_stream, xid) {
            (Some(top), Some(xid)) => {
                self.streams.entry(top).or_default().push((xid, change));
                Ok(Vec::new())
            }
            _ => Ok(vec![change]),
        }
    }
}

fn new_change(rel: &RelationInfo, kind: ChangeKind, lsn: u64) -> WalChange {
    let mut change = WalChange::new(kind, &rel.namespace, &rel.name);
    change.lsn = lsn;
    change
}

fn check_width(rel: &RelationInfo, tuple: &TupleData) -> PgResult<()> {
    if tuple.columns.len() != rel.columns.len() {
        return Err(PgError::PgOutput(format!(
            "{}.{}: tuple has {} columns, relation has {}",
            rel.namespace,
            rel.name,
            tuple.columns.len(),
            rel.columns.len()
        )));
    }
    Ok(())
}

fn fill_columns(change: &mut WalChange, rel: &RelationInfo, tuple: &TupleData) -> PgResult<()> {
    check_width(rel, tuple)?;
    for (column, value) in rel.columns.iter().zip(&tuple.columns) {
        change.column_names.push(column.name.clone());
        change.column_types.push(type_name(column.type_oid));
        change.column_values.push(convert_value(column, value));
    }
    Ok(())
}

/// Old keys from an update/delete old tuple.
///
/// `K` tuples only carry meaningful values in key columns. `O` tuples
/// (REPLICA IDENTITY FULL) carry the whole row; null columns are skipped.
fn old_keys(rel: &RelationInfo, old: &OldTuple) -> PgResult<Option<OldKeys>> {
    if old.key_only {
        return key_columns(rel, &old.tuple);
    }

    check_width(rel, &old.tuple)?;
    let mut keys = OldKeys::default();
    for (column, value) in rel.columns.iter().zip(&old.tuple.columns) {
        if matches!(value, ColumnValue::Null) {
            continue;
        }
        push_key(&mut keys, column, value);
    }
    Ok(Some(keys))
}

/// Key-flagged columns of a tuple, or `None` if the relation has no key.
fn key_columns(rel: &RelationInfo, tuple: &TupleData) -> PgResult<Option<OldKeys>> {
    check_width(rel, tuple)?;
    let positions = rel.key_positions();
    if positions.is_empty() {
        return Ok(None);
    }

    let mut keys = OldKeys::default();
    for i in positions {
        push_key(&mut keys, &rel.columns[i], &tuple.columns[i]);
    }
    Ok(Some(keys))
}

fn push_key(keys: &mut OldKeys, column: &ColumnInfo, value: &ColumnValue) {
    keys.key_names.push(column.name.clone());
    keys.key_types.push(type_name(column.type_oid));
    keys.key_values.push(convert_value(column, value));
}

/// Type OIDs from pg_type.h that get a non-text representation.
pub(crate) mod oid {
    pub const BOOL: u32 = 16;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const JSON: u32 = 114;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const VARCHAR: u32 = 1043;
    pub const TIMESTAMP: u32 = 1114;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
}

fn type_name(type_oid: u32) -> String {
    match type_oid {
        oid::BOOL => "boolean".to_string(),
        oid::INT8 => "bigint".to_string(),
        oid::INT2 => "smallint".to_string(),
        oid::INT4 => "integer".to_string(),
        oid::TEXT => "text".to_string(),
        oid::JSON => "json".to_string(),
        oid::FLOAT4 => "real".to_string(),
        oid::FLOAT8 => "double precision".to_string(),
        oid::VARCHAR => "character varying".to_string(),
        oid::TIMESTAMP => "timestamp without time zone".to_string(),
        oid::TIMESTAMPTZ => "timestamp with time zone".to_string(),
        oid::NUMERIC => "numeric".to_string(),
        oid::UUID => "uuid".to_string(),
        oid::JSONB => "jsonb".to_string(),
        other => format!("oid:{}", other),
    }
}

fn convert_value(column: &ColumnInfo, value: &ColumnValue) -> Value {
    match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Unchanged => Value::UnchangedToast,
        ColumnValue::Text(text) => parse_text(column.type_oid, text),
        ColumnValue::Binary(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            Value::String(format!("\\x{}", hex))
        }
    }
}

/// Parse a text-format column value by type OID. Anything unparseable
/// stays a string rather than failing the change.
fn parse_text(type_oid: u32, text: &str) -> Value {
    match type_oid {
        oid::BOOL => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        oid::INT2 | oid::INT4 | oid::INT8 => text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::NUMERIC if is_integer_literal(text) => text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        oid::FLOAT4 | oid::FLOAT8 | oid::NUMERIC => text
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::Float)
            .unwrap_or_else(|| Value::String(text.to_string())),
        oid::JSON | oid::JSONB => serde_json::from_str::<serde_json::Value>(text)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

fn is_integer_literal(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}
