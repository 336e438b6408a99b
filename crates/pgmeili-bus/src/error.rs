use thiserror::Error;

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("stream setup failed: {0}")]
    Setup(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("ack failed: {0}")]
    Ack(String),

    #[error(transparent)]
    Encode(#[from] pgmeili_core::Error),
}

pub type BusResult<T> = Result<T, BusError>;
