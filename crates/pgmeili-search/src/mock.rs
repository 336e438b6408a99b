use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use pgmeili_core::{Document, DocumentId};

use crate::client::{IndexInfo, SearchIndex, TaskInfo};
use crate::error::{IndexError, IndexResult};

/// A call made against the mock, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexCall {
    Add { index: String, docs: Vec<Document> },
    Merge { index: String, docs: Vec<Document> },
    Delete { index: String, id: DocumentId },
    CreateIndex { index: String, primary_key: String },
    UpdatePrimaryKey { index: String, primary_key: String },
}

/// An in-memory search index for testing.
///
/// Applies writes with the same replace/merge/delete semantics as the real
/// server so tests can assert on resulting document state.
#[derive(Clone, Default)]
pub struct MockIndex {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    indexes: HashMap<String, StoredIndex>,
    calls: Vec<IndexCall>,
    next_task: u64,
    /// If set, all operations will fail with this error.
    fail_with: Option<String>,
}

#[derive(Default)]
struct StoredIndex {
    primary_key: Option<String>,
    documents: BTreeMap<String, Document>,
}

impl MockState {
    fn check(&self) -> IndexResult<()> {
        match &self.fail_with {
            Some(error) => Err(IndexError::Network(error.clone())),
            None => Ok(()),
        }
    }

    fn task(&mut self, index: &str) -> TaskInfo {
        self.next_task += 1;
        TaskInfo {
            task_uid: self.next_task,
            index_uid: Some(index.to_string()),
            status: "enqueued".into(),
        }
    }

    fn write(
        &mut self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
        merge: bool,
    ) -> IndexResult<TaskInfo> {
        self.check()?;

        let stored = self.indexes.entry(index.to_string()).or_default();
        let key = stored
            .primary_key
            .get_or_insert_with(|| primary_key.to_string())
            .clone();
        for doc in docs {
            let id = doc.get(&key).map(|v| v.to_string()).ok_or_else(|| IndexError::Api {
                status: 400,
                code: Some("missing_document_id".into()),
                message: format!("document has no '{}' field", key),
            })?;
            if merge {
                if let Some(existing) = stored.documents.get_mut(&id) {
                    existing.extend(doc.clone());
                    continue;
                }
            }
            stored.documents.insert(id, doc.clone());
        }

        let call = if merge {
            IndexCall::Merge {
                index: index.to_string(),
                docs: docs.to_vec(),
            }
        } else {
            IndexCall::Add {
                index: index.to_string(),
                docs: docs.to_vec(),
            }
        };
        self.calls.push(call);
        Ok(self.task(index))
    }
}

impl MockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock index that simulates failures.
    pub fn failing(error_message: impl Into<String>) -> Self {
        let index = Self::new();
        index.state().fail_with = Some(error_message.into());
        index
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<IndexCall> {
        self.state().calls.clone()
    }

    /// Current document state of an index, keyed by rendered primary key.
    pub fn documents(&self, index: &str) -> BTreeMap<String, Document> {
        self.state()
            .indexes
            .get(index)
            .map(|stored| stored.documents.clone())
            .unwrap_or_default()
    }

    pub fn document_count(&self, index: &str) -> usize {
        self.state()
            .indexes
            .get(index)
            .map_or(0, |stored| stored.documents.len())
    }

    pub fn primary_key(&self, index: &str) -> Option<String> {
        self.state()
            .indexes
            .get(index)
            .and_then(|stored| stored.primary_key.clone())
    }

    /// Pre-create an index with no primary key.
    pub fn create_index_without_key(&self, index: impl Into<String>) {
        self.state().indexes.entry(index.into()).or_default();
    }

    /// Pre-load documents without recording a call.
    pub fn seed(&self, index: &str, primary_key: &str, docs: &[Document]) {
        let mut state = self.state();
        let fail_with = state.fail_with.take();
        if state.write(index, primary_key, docs, false).is_ok() {
            state.calls.pop();
        }
        state.fail_with = fail_with;
    }

    /// Clear all recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

impl SearchIndex for MockIndex {
    async fn add_documents(
        &self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
    ) -> IndexResult<TaskInfo> {
        self.state().write(index, primary_key, docs, false)
    }

    async fn merge_documents(
        &self,
        index: &str,
        primary_key: &str,
        docs: &[Document],
    ) -> IndexResult<TaskInfo> {
        self.state().write(index, primary_key, docs, true)
    }

    async fn delete_document(&self, index: &str, id: &DocumentId) -> IndexResult<TaskInfo> {
        let mut state = self.state();
        state.check()?;

        if let Some(stored) = state.indexes.get_mut(index) {
            stored.documents.remove(&id.to_json().to_string());
        }
        state.calls.push(IndexCall::Delete {
            index: index.to_string(),
            id: id.clone(),
        });
        Ok(state.task(index))
    }

    async fn get_index(&self, index: &str) -> IndexResult<Option<IndexInfo>> {
        let state = self.state();
        state.check()?;

        Ok(state.indexes.get(index).map(|stored| IndexInfo {
            uid: index.to_string(),
            primary_key: stored.primary_key.clone(),
        }))
    }

    async fn create_index(&self, index: &str, primary_key: &str) -> IndexResult<TaskInfo> {
        let mut state = self.state();
        state.check()?;

        state.indexes.entry(index.to_string()).or_default().primary_key =
            Some(primary_key.to_string());
        state.calls.push(IndexCall::CreateIndex {
            index: index.to_string(),
            primary_key: primary_key.to_string(),
        });
        Ok(state.task(index))
    }

    async fn update_primary_key(&self, index: &str, primary_key: &str) -> IndexResult<TaskInfo> {
        let mut state = self.state();
        state.check()?;

        let Some(stored) = state.indexes.get_mut(index) else {
            return Err(IndexError::Api {
                status: 404,
                code: Some("index_not_found".into()),
                message: format!("Index `{}` not found.", index),
            });
        };
        stored.primary_key = Some(primary_key.to_string());
        state.calls.push(IndexCall::UpdatePrimaryKey {
            index: index.to_string(),
            primary_key: primary_key.to_string(),
        });
        Ok(state.task(index))
    }

    async fn has_documents(&self, index: &str) -> IndexResult<bool> {
        let state = self.state();
        state.check()?;

        Ok(state
            .indexes
            .get(index)
            .is_some_and(|stored| !stored.documents.is_empty()))
    }
}
