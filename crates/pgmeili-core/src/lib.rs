pub mod action;
pub mod batcher;
pub mod error;
pub mod lsn;
pub mod record;
pub mod router;
pub mod target;
pub mod types;

pub use action::{Action, Document, DocumentId};
pub use batcher::{BatchConfig, DocumentBatcher};
pub use error::{Error, Result};
pub use lsn::{format_lsn, parse_lsn};
pub use record::{ChangeBatch, ChangeRecord, KeyRecord};
pub use router::{ChangeHandler, ChangeSink, RouteOutcome, WalRouter};
pub use target::{qualify_table, split_table, SyncTarget};
pub use types::{ChangeKind, OldKeys, Value, WalChange};
