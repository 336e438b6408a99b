use thiserror::Error;

/// Errors from search index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (429)")]
    RateLimited,

    #[error("server error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("index {index} has primary key '{found}', expected '{expected}'")]
    PrimaryKeyMismatch {
        index: String,
        expected: String,
        found: String,
    },

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    /// Check if this error is retryable.
    ///
    /// Nothing retries today; the classification is reported with the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IndexError::Network(_)
                | IndexError::RateLimited
                | IndexError::Api {
                    status: 500..=599,
                    ..
                }
        )
    }

    /// Check if this error is permanent.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            IndexError::Api {
                status: 400..=428 | 430..=499,
                ..
            } | IndexError::PrimaryKeyMismatch { .. }
                | IndexError::InvalidConfig(_)
        )
    }

    /// HTTP status of an API error.
    pub fn status(&self) -> Option<u16> {
        match self {
            IndexError::Api { status, .. } => Some(*status),
            IndexError::RateLimited => Some(429),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for IndexError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => IndexError::Api {
                status: status.as_u16(),
                code: None,
                message: e.to_string(),
            },
            None => IndexError::Network(e.to_string()),
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> IndexError {
        IndexError::Api {
            status,
            code: None,
            message: "x".into(),
        }
    }

    #[test]
    fn test_classification() {
        assert!(IndexError::Network("reset".into()).is_retryable());
        assert!(IndexError::RateLimited.is_retryable());
        assert!(api(503).is_retryable());
        assert!(!api(400).is_retryable());

        assert!(api(404).is_permanent());
        assert!(!api(502).is_permanent());
        assert!(!IndexError::RateLimited.is_permanent());
    }
}
