use crate::action::{Action, Document, DocumentId};
use crate::error::{Error, Result};
use crate::types::{ChangeKind, Value, WalChange};

const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_BATCH_SIZE: usize = 1000;

/// One synced table: where its rows go and how they are keyed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTarget {
    /// Schema-qualified source table, e.g. `public.users`.
    pub table: String,
    /// Target search index uid.
    pub index: String,
    /// Column holding the document primary key.
    pub primary_key: String,
    /// Bulk-load current rows before streaming.
    pub initial_load: bool,
    /// Rows per bulk-load request.
    pub batch_size: usize,
}

impl SyncTarget {
    pub fn new(
        table: impl AsRef<str>,
        index: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            table: qualify_table(table.as_ref()),
            index: index.into(),
            primary_key: primary_key.into(),
            initial_load: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_initial_load(mut self, initial_load: bool) -> Self {
        self.initial_load = initial_load;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Turn a change into the index operation it implies.
    ///
    /// Updates always merge. wal2json drops unchanged out-of-line columns
    /// from the row instead of marking them, so a replace would erase them.
    pub fn plan(&self, change: &WalChange) -> Result<Action> {
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let id = self.document_id(change.column(&self.primary_key))?;

                let mut doc = Document::new();
                let mut partial = false;
                for (name, value) in change.columns() {
                    match value.to_json() {
                        Some(json) => {
                            doc.insert(name.to_string(), json);
                        }
                        None => partial = true,
                    }
                }
                doc.insert(self.primary_key.clone(), id.to_json());

                if partial || change.kind == ChangeKind::Update {
                    Ok(Action::merge(id, doc))
                } else {
                    Ok(Action::upsert(id, doc))
                }
            }
            ChangeKind::Delete => {
                let keys = change.old_keys.as_ref().ok_or_else(|| Error::MissingOldKeys {
                    table: change.qualified_table(),
                })?;
                let value = keys
                    .get(&self.primary_key)
                    .ok_or_else(|| Error::KeyNotInOldKeys {
                        table: change.qualified_table(),
                        key: self.primary_key.clone(),
                    })?;
                let id = self.document_id(Some(value))?;
                Ok(Action::delete(id))
            }
        }
    }

    /// Build a document from a snapshot row.
    pub fn document_from_row(&self, row: Document) -> Result<(DocumentId, Document)> {
        let value = row.get(&self.primary_key).cloned().map(Value::from);
        let id = self.document_id(value.as_ref())?;
        Ok((id, row))
    }

    fn document_id(&self, value: Option<&Value>) -> Result<DocumentId> {
        let value = value.ok_or_else(|| Error::MissingPrimaryKey {
            table: self.table.clone(),
            key: self.primary_key.clone(),
        })?;
        DocumentId::from_value(value).map_err(|reason| Error::InvalidDocumentId {
            table: self.table.clone(),
            key: self.primary_key.clone(),
            reason,
        })
    }
}

/// Qualify a bare table name with the default schema.
pub fn qualify_table(name: &str) -> String {
    let (schema, table) = split_table(name);
    format!("{}.{}", schema, table)
}

/// Split `schema.table`; a bare name defaults to the `public` schema.
pub fn split_table(name: &str) -> (&str, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => (DEFAULT_SCHEMA, name),
    }
}
