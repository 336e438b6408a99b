//! JSON change-record shape.
//!
//! This is the wal2json (format version 1) layout:
//!
//! ```json
//! {"change":[{"kind":"insert","schema":"public","table":"users",
//!   "columnnames":["id","name"],"columntypes":["integer","text"],
//!   "columnvalues":[1,"a"],
//!   "oldkeys":{"keynames":["id"],"keytypes":["integer"],"keyvalues":[1]}}]}
//! ```
//!
//! The same record shape, extended with `unchanged` and `lsn`, is what gets
//! published on the message bus.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lsn::{format_lsn, parse_lsn};
use crate::types::{ChangeKind, OldKeys, Value, WalChange};

/// A wal2json transaction payload.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    #[serde(default)]
    pub change: Option<Vec<ChangeRecord>>,
}

impl ChangeBatch {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Convert every row change in the batch, skipping non-row records.
    pub fn into_changes(self, lsn: u64) -> Result<Vec<WalChange>> {
        let mut changes = Vec::new();
        for record in self.change.unwrap_or_default() {
            if let Some(change) = record.into_change(lsn)? {
                changes.push(change);
            }
        }
        Ok(changes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub table: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columnnames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columntypes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columnvalues: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldkeys: Option<KeyRecord>,
    /// Positions in `columnvalues` that hold an unchanged TOAST value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unchanged: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KeyRecord {
    #[serde(default)]
    pub keynames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keytypes: Vec<String>,
    #[serde(default)]
    pub keyvalues: Vec<serde_json::Value>,
}

impl ChangeRecord {
    /// Convert to a `WalChange`.
    ///
    /// Returns `Ok(None)` for records that are not row changes (wal2json emits
    /// `"kind":"message"` for logical decoding messages).
    pub fn into_change(self, lsn: u64) -> Result<Option<WalChange>> {
        if self.kind == "message" {
            return Ok(None);
        }
        let kind: ChangeKind = self.kind.parse()?;

        if self.schema.is_empty() || self.table.is_empty() {
            return Err(Error::InvalidRecord(format!(
                "{} record without schema/table",
                kind
            )));
        }

        let mut column_values: Vec<Value> =
            self.columnvalues.into_iter().map(Value::from).collect();
        for pos in self.unchanged {
            let slot = column_values.get_mut(pos).ok_or_else(|| {
                Error::InvalidRecord(format!("unchanged position {} out of range", pos))
            })?;
            *slot = Value::UnchangedToast;
        }

        let lsn = match self.lsn {
            Some(text) => parse_lsn(&text)?,
            None => lsn,
        };

        Ok(Some(WalChange {
            kind,
            schema: self.schema,
            table: self.table,
            column_names: self.columnnames,
            column_types: self.columntypes,
            column_values,
            old_keys: self.oldkeys.map(|keys| OldKeys {
                key_names: keys.keynames,
                key_types: keys.keytypes,
                key_values: keys.keyvalues.into_iter().map(Value::from).collect(),
            }),
            lsn,
        }))
    }

    pub fn from_change(change: &WalChange) -> Self {
        let mut unchanged = Vec::new();
        let columnvalues = change
            .column_values
            .iter()
            .enumerate()
            .map(|(pos, value)| {
                value.to_json().unwrap_or_else(|| {
                    unchanged.push(pos);
                    serde_json::Value::Null
                })
            })
            .collect();

        ChangeRecord {
            kind: change.kind.as_str().to_string(),
            schema: change.schema.clone(),
            table: change.table.clone(),
            columnnames: change.column_names.clone(),
            columntypes: change.column_types.clone(),
            columnvalues,
            oldkeys: change.old_keys.as_ref().map(|keys| KeyRecord {
                keynames: keys.key_names.clone(),
                keytypes: keys.key_types.clone(),
                keyvalues: keys
                    .key_values
                    .iter()
                    .map(|v| v.to_json().unwrap_or(serde_json::Value::Null))
                    .collect(),
            }),
            unchanged,
            lsn: None,
        }
    }
}

/// Encode a single change for the message bus.
pub fn encode(change: &WalChange) -> Result<Vec<u8>> {
    let mut record = ChangeRecord::from_change(change);
    record.lsn = Some(format_lsn(change.lsn));
    Ok(serde_json::to_vec(&record)?)
}

/// Decode a single change published with [`encode`].
pub fn decode(payload: &[u8]) -> Result<WalChange> {
    let record: ChangeRecord = serde_json::from_slice(payload)?;
    record
        .into_change(0)?
        .ok_or_else(|| Error::InvalidRecord("bus payload is not a row change".into()))
}
