use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A decoded column value.
///
/// `UnchangedToast` marks a large out-of-line value the source did not resend
/// because the operation did not touch it. It is not null: consumers must
/// leave the stored field alone rather than clear it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    UnchangedToast,
}

impl Value {
    /// Convert to JSON. Returns `None` when the value (or anything nested in
    /// it) is `UnchangedToast`, since there is nothing to write.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(arr) => serde_json::Value::Array(
                arr.iter().map(Value::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Value::Object(obj) => serde_json::Value::Object(
                obj.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<serde_json::Map<_, _>>>()?,
            ),
            Value::UnchangedToast => return None,
        })
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if n.is_u64() {
                    // Past i64 but exact; a float would round it.
                    Value::String(n.to_string())
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// The type of row change carried by a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(Error::UnknownChangeKind(other.to_string())),
        }
    }
}

/// Row identity sent with updates and deletes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OldKeys {
    pub key_names: Vec<String>,
    pub key_types: Vec<String>,
    pub key_values: Vec<Value>,
}

impl OldKeys {
    /// Look up a key value by column name, pairing names and values by position.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let pos = self.key_names.iter().position(|n| n == name)?;
        self.key_values.get(pos)
    }
}

/// A single row change decoded from the WAL.
///
/// Both decoders produce this shape, so nothing downstream cares which
/// output plugin the slot uses.
#[derive(Debug, Clone, PartialEq)]
pub struct WalChange {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub column_names: Vec<String>,
    /// Type names, parallel to `column_names`. May be empty.
    pub column_types: Vec<String>,
    pub column_values: Vec<Value>,
    pub old_keys: Option<OldKeys>,
    /// Start position of the frame this change was decoded from.
    pub lsn: u64,
}

impl WalChange {
    pub fn new(kind: ChangeKind, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            kind,
            schema: schema.into(),
            table: table.into(),
            column_names: Vec::new(),
            column_types: Vec::new(),
            column_values: Vec::new(),
            old_keys: None,
            lsn: 0,
        }
    }

    /// The schema-qualified table name used for routing, e.g. `public.users`.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Column name/value pairs in order. Positions without a value are skipped.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.column_names
            .iter()
            .map(String::as_str)
            .zip(self.column_values.iter())
    }

    pub fn column(&self, name: &str) -> Option<&Value> {
        self.columns().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_from_json() {
        assert_eq!(Value::from(json!(5)), Value::Int(5));
        assert_eq!(Value::from(json!(1.5)), Value::Float(1.5));
        assert_eq!(Value::from(json!("a")), Value::String("a".into()));
        assert_eq!(Value::from(json!(null)), Value::Null);
        assert_eq!(
            Value::from(json!(18446744073709551615u64)),
            Value::String("18446744073709551615".into())
        );
        assert_eq!(
            Value::from(json!([true, null])),
            Value::Array(vec![Value::Bool(true), Value::Null])
        );
    }

    #[test]
    fn test_unchanged_is_not_null() {
        assert_ne!(Value::UnchangedToast, Value::Null);
        assert_eq!(Value::UnchangedToast.to_json(), None);
        assert_eq!(Value::Null.to_json(), Some(json!(null)));
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::UnchangedToast]).to_json(),
            None
        );
    }

    #[test]
    fn test_columns_pair_positionally() {
        let mut change = WalChange::new(ChangeKind::Insert, "main", "tenants");
        change.column_names = vec!["id".into(), "name".into(), "extra".into()];
        change.column_values = vec![Value::Int(5), Value::String("Acme".into())];

        let pairs: Vec<_> = change.columns().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(change.column("name"), Some(&Value::String("Acme".into())));
        assert_eq!(change.column("extra"), None);
        assert_eq!(change.qualified_table(), "main.tenants");
    }

    #[test]
    fn test_old_keys_lookup() {
        let keys = OldKeys {
            key_names: vec!["tenant_id".into(), "id".into()],
            key_types: vec![],
            key_values: vec![Value::Int(1), Value::Int(9)],
        };
        assert_eq!(keys.get("id"), Some(&Value::Int(9)));
        assert_eq!(keys.get("missing"), None);
    }

    #[test]
    fn test_change_kind_parse() {
        assert_eq!("delete".parse::<ChangeKind>().unwrap(), ChangeKind::Delete);
        assert!("truncate".parse::<ChangeKind>().is_err());
        assert_eq!(ChangeKind::Update.to_string(), "update");
    }
}
