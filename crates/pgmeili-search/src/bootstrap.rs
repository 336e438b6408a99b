use tracing::info;

use crate::client::SearchIndex;
use crate::error::{IndexError, IndexResult};

/// What `ensure_index` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBootstrap {
    Created,
    PrimaryKeySet,
    Ready,
}

/// Make sure `index` exists with `primary_key` before anything is written to it.
///
/// Index creation is asynchronous on the server, but tasks for one index run
/// in the order they were enqueued, so later document writes land after it.
pub async fn ensure_index<C: SearchIndex>(
    client: &C,
    index: &str,
    primary_key: &str,
) -> IndexResult<IndexBootstrap> {
    match client.get_index(index).await? {
        None => {
            let task = client.create_index(index, primary_key).await?;
            info!(index, primary_key, task = task.task_uid, "Created index");
            Ok(IndexBootstrap::Created)
        }
        Some(info) => match info.primary_key.as_deref() {
            None => {
                let task = client.update_primary_key(index, primary_key).await?;
                info!(index, primary_key, task = task.task_uid, "Set index primary key");
                Ok(IndexBootstrap::PrimaryKeySet)
            }
            Some(existing) if existing == primary_key => Ok(IndexBootstrap::Ready),
            Some(existing) => Err(IndexError::PrimaryKeyMismatch {
                index: index.to_string(),
                expected: primary_key.to_string(),
                found: existing.to_string(),
            }),
        },
    }
}
