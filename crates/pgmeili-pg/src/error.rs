use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error: {severity}: {message} (code: {code})")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("IDENTIFY_SYSTEM failed: {0}")]
    Identify(String),

    #[error("failed to create replication slot: {0}")]
    SlotCreationFailed(String),

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("pgoutput error: {0}")]
    PgOutput(String),

    #[error("relation {0} not found in cache")]
    RelationNotFound(u32),

    #[error("failed to decode change: {0}")]
    Decode(String),

    #[error("session is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: crate::replication::SessionState,
        actual: crate::replication::SessionState,
    },

    #[error("slot {0} has no exported snapshot")]
    NoSnapshot(String),

    #[error("replication stream ended by server")]
    StreamEnded,

    #[error("table {schema}.{table} does not exist")]
    TableNotFound { schema: String, table: String },

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PgError {
    /// Whether the replication session must stop.
    ///
    /// Only single-change decode errors are survivable: the frame is skipped
    /// and the stream goes on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PgError::Decode(_))
    }

    /// SQLSTATE of a server error, if this is one.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            PgError::Server {
                severity: db_err.severity().to_string(),
                code: db_err.code().code().to_string(),
                message: db_err.message().to_string(),
            }
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

impl From<pgmeili_core::Error> for PgError {
    fn from(e: pgmeili_core::Error) -> Self {
        match e {
            pgmeili_core::Error::InvalidLsn(lsn) => PgError::InvalidLsn(lsn),
            other => PgError::Decode(other.to_string()),
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_survivable() {
        assert!(!PgError::Decode("bad json".into()).is_fatal());
        assert!(PgError::RelationNotFound(16384).is_fatal());
        assert!(PgError::Protocol("unexpected tag".into()).is_fatal());
        assert!(PgError::StreamEnded.is_fatal());
    }

    #[test]
    fn test_core_errors_convert() {
        let err: PgError = pgmeili_core::Error::UnknownChangeKind("x".into()).into();
        assert!(matches!(err, PgError::Decode(_)));

        let err: PgError = pgmeili_core::Error::InvalidLsn("zz".into()).into();
        assert!(matches!(err, PgError::InvalidLsn(_)));
    }
}
