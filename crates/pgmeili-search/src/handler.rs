use pgmeili_core::{format_lsn, Action, ChangeHandler, SyncTarget, WalChange};
use thiserror::Error;
use tracing::debug;

use crate::client::{SearchIndex, TaskInfo};
use crate::error::IndexError;

/// Why a change could not be applied to its index.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The change does not identify a document. Nothing was sent.
    #[error(transparent)]
    Plan(#[from] pgmeili_core::Error),

    #[error("index {index}: {source}")]
    Index {
        index: String,
        #[source]
        source: IndexError,
    },
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Plan(_) => false,
            SyncError::Index { source, .. } => source.is_retryable(),
        }
    }
}

/// Applies one table's changes to its search index.
///
/// Inserts replace the whole document, updates merge into it, deletes remove
/// it by primary key. Every call is keyed by primary key, so replaying a
/// change leaves the index unchanged.
pub struct SyncHandler<C> {
    target: SyncTarget,
    client: C,
}

impl<C: SearchIndex> SyncHandler<C> {
    pub fn new(target: SyncTarget, client: C) -> Self {
        Self { target, client }
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    /// Plan and send the index call for one change.
    pub async fn sync(&self, change: &WalChange) -> Result<TaskInfo, SyncError> {
        let action = self.target.plan(change)?;
        let index = self.target.index.as_str();
        let primary_key = self.target.primary_key.as_str();

        let result = match action {
            Action::Upsert { doc, .. } => self.client.add_documents(index, primary_key, &[doc]).await,
            Action::Merge { doc, .. } => {
                self.client
                    .merge_documents(index, primary_key, &[doc])
                    .await
            }
            Action::Delete { id } => self.client.delete_document(index, &id).await,
        };

        result.map_err(|source| SyncError::Index {
            index: index.to_string(),
            source,
        })
    }
}

impl<C: SearchIndex> ChangeHandler for SyncHandler<C> {
    type Error = SyncError;

    async fn apply(&self, change: &WalChange) -> Result<(), SyncError> {
        let task = self.sync(change).await.inspect_err(|e| {
            debug!(
                table = %self.target.table,
                index = %self.target.index,
                lsn = %format_lsn(change.lsn),
                retryable = e.is_retryable(),
                "Index call failed, dropping change"
            )
        })?;
        debug!(
            table = %self.target.table,
            index = %self.target.index,
            kind = %change.kind,
            lsn = %format_lsn(change.lsn),
            task = task.task_uid,
            "Synced change"
        );
        Ok(())
    }
}
