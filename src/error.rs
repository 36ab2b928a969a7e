//! Error types for virta

use thiserror::Error;

/// Result type alias for virta operations
pub type Result<T> = std::result::Result<T, VirtaError>;

/// Main error type for virta
#[derive(Error, Debug)]
pub enum VirtaError {
    /// A value was constructed with parameters that can never work
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration could not be read from the environment
    #[error("configuration error: {0}")]
    Config(String),

    /// Metrics registration failed
    #[error("metrics error: {0}")]
    Metrics(String),

    /// The receiving task is gone
    #[error("shutdown requested")]
    Shutdown,
}

/// Failure of a single stream or sub-stream
///
/// Cloneable so it can travel as a stream element and be recorded by the
/// restart driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The provider answered with an error
    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    /// The provider answered with something that is not a stream handle
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// No reply arrived in time
    #[error("timed out after {millis}ms waiting for '{provider}'")]
    Timeout { provider: String, millis: u64 },

    /// The transport could not deliver the request
    #[error("transport error: {0}")]
    Transport(String),

    /// The restart budget ran out; carries the last failure
    #[error("gave up after {restarts} restarts: {last}")]
    RestartsExhausted { restarts: usize, last: Box<StreamError> },
}

impl StreamError {
    /// Whether the failure may go away on its own
    pub fn is_transient(&self) -> bool {
        !matches!(self, StreamError::RestartsExhausted { .. })
    }
}
