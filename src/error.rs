use crate::{channel, network};

/// Errors that abort an evaluation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A message could not be sent, received or framed.
    #[error("network error: {0}")]
    Network(#[from] network::Error),
    /// An atomic operation failed.
    #[error("operation failed: {0}")]
    Operation(Box<dyn std::error::Error + Send + Sync>),
    /// The evaluator configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// Wraps an error raised by an atomic operation.
    pub fn operation(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Operation(e.into())
    }
}

impl From<channel::Error> for Error {
    fn from(e: channel::Error) -> Self {
        Self::Network(network::Error::Channel(e))
    }
}
