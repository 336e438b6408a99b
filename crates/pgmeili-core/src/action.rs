use std::fmt;

use crate::types::Value;

/// A document to be written to a search index.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// What a single change turns into on the search index.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Add or replace the whole document.
    Upsert {
        id: DocumentId,
        doc: Document,
    },
    /// Merge fields into the stored document, leaving absent fields alone.
    /// Used when some columns were not resent by the source.
    Merge {
        id: DocumentId,
        doc: Document,
    },
    /// Delete a document by primary key.
    Delete {
        id: DocumentId,
    },
}

impl Action {
    pub fn upsert(id: impl Into<DocumentId>, doc: Document) -> Self {
        Action::Upsert { id: id.into(), doc }
    }

    pub fn merge(id: impl Into<DocumentId>, doc: Document) -> Self {
        Action::Merge { id: id.into(), doc }
    }

    pub fn delete(id: impl Into<DocumentId>) -> Self {
        Action::Delete { id: id.into() }
    }

    pub fn id(&self) -> &DocumentId {
        match self {
            Action::Upsert { id, .. } | Action::Merge { id, .. } | Action::Delete { id } => id,
        }
    }
}

/// A search-index primary key. Meilisearch accepts integers and strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentId {
    Int(i64),
    String(String),
}

impl DocumentId {
    /// Build an id from a column value. Returns a reason on failure.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Int(i) => Ok(DocumentId::Int(*i)),
            Value::String(s) if s.is_empty() => Err("empty string".into()),
            Value::String(s) => Ok(DocumentId::String(s.clone())),
            Value::Null => Err("value is null".into()),
            Value::UnchangedToast => Err("value was not transmitted".into()),
            other => Err(format!("unsupported id value {:?}", other)),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DocumentId::Int(i) => serde_json::Value::Number((*i).into()),
            DocumentId::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Int(i) => write!(f, "{}", i),
            DocumentId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for DocumentId {
    fn from(v: i64) -> Self {
        DocumentId::Int(v)
    }
}

impl From<String> for DocumentId {
    fn from(v: String) -> Self {
        DocumentId::String(v)
    }
}

impl From<&str> for DocumentId {
    fn from(v: &str) -> Self {
        DocumentId::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_from_value() {
        assert_eq!(DocumentId::from_value(&Value::Int(5)), Ok(DocumentId::Int(5)));
        assert_eq!(
            DocumentId::from_value(&Value::String("ab-1".into())),
            Ok(DocumentId::String("ab-1".into()))
        );
        assert!(DocumentId::from_value(&Value::Null).is_err());
        assert!(DocumentId::from_value(&Value::UnchangedToast).is_err());
        assert!(DocumentId::from_value(&Value::Float(1.5)).is_err());
    }

    #[test]
    fn test_document_id_display() {
        assert_eq!(DocumentId::Int(5).to_string(), "5");
        assert_eq!(DocumentId::from("abc").to_string(), "abc");
        assert_eq!(DocumentId::Int(-3).to_json(), serde_json::json!(-3));
    }

    #[test]
    fn test_action_id() {
        assert_eq!(Action::delete(9i64).id(), &DocumentId::Int(9));
        assert_eq!(Action::upsert("x", Document::new()).id(), &DocumentId::from("x"));
    }
}
