use thiserror::Error;

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("environment variable {name} is not set (referenced by {field})")]
    MissingEnvVar { name: String, field: String },

    #[error("unterminated ${{...}} in {field}")]
    UnterminatedVariable { field: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("no [[sync]] tables configured")]
    NoSyncTables,

    #[error("table {0} is configured more than once")]
    DuplicateTable(String),

    #[error("invalid {field} '{value}': {reason}")]
    InvalidName {
        field: String,
        value: String,
        reason: &'static str,
    },

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
