//! Meilisearch side of the pipeline: the HTTP client, an in-memory stand-in
//! for tests, and the per-table handler that applies changes to an index.

mod bootstrap;
mod client;
mod error;
mod handler;
mod mock;

pub use bootstrap::{ensure_index, IndexBootstrap};
pub use client::{IndexInfo, MeiliClient, MeiliConfig, SearchIndex, TaskInfo};
pub use error::{IndexError, IndexResult};
pub use handler::{SyncError, SyncHandler};
pub use mock::{IndexCall, MockIndex};
