use thiserror::Error;

/// Errors that can occur in pgmeili-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("delete on {table} carries no old-key identity")]
    MissingOldKeys { table: String },

    #[error("primary key '{key}' not found in old keys of {table}")]
    KeyNotInOldKeys { table: String, key: String },

    #[error("primary key '{key}' missing from {table} change")]
    MissingPrimaryKey { table: String, key: String },

    #[error("invalid document id in {table}.{key}: {reason}")]
    InvalidDocumentId {
        table: String,
        key: String,
        reason: String,
    },

    #[error("unknown change kind: {0}")]
    UnknownChangeKind(String),

    #[error("malformed change record: {0}")]
    InvalidRecord(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("table {0} is routed more than once")]
    DuplicateRoute(String),
}

pub type Result<T> = std::result::Result<T, Error>;
