//! Cluster stream-request protocol
//!
//! ```text
//! consumer                                provider
//!    │ ── StreamRequest{burst, lower_bound} ──► │
//!    │ ◄──────── StreamReply::Handle ────────── │
//!    │ ◄──── Batch[e1..eN] ── Batch[..] ─────── │  (one message per burst)
//! ```

use crate::cursor::{EntityIdWithRevision, StreamCursor};
use crate::error::StreamError;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Header carrying the request's correlation id
pub const CORRELATION_ID_HEADER: &str = "correlation-id";

/// Request for one paginated stream, starting after `lower_bound`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Maximum elements per batch
    pub burst: u32,

    /// How long the provider keeps the stream open without demand
    pub idle_timeout: Duration,

    /// Last element already seen; the provider starts after it
    pub lower_bound: StreamCursor,

    /// Headers propagated to the provider
    pub headers: HashMap<String, String>,
}

impl StreamRequest {
    /// Create a request with a fresh correlation id
    pub fn new(burst: u32, idle_timeout: Duration, lower_bound: StreamCursor) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            CORRELATION_ID_HEADER.to_string(),
            ulid::Ulid::new().to_string(),
        );

        Self {
            burst,
            idle_timeout,
            lower_bound,
            headers,
        }
    }

    /// Add a header to the request
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID_HEADER).map(String::as_str)
    }
}

/// One page of a provider's stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Kind of entities in the batch (e.g. "thing")
    pub batch_type: String,

    /// Elements in provider order
    pub elements: Vec<EntityIdWithRevision>,
}

impl Batch {
    pub fn new(batch_type: impl Into<String>, elements: Vec<EntityIdWithRevision>) -> Self {
        Self {
            batch_type: batch_type.into(),
            elements,
        }
    }
}

/// A message travelling on a provider's stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    Batch(Batch),
    /// Anything else the provider interleaves (acks, heartbeats, ...)
    Other { message_type: String },
}

/// Remote sub-stream handed out by a provider
pub type BatchStream = BoxStream<'static, Result<StreamMessage, StreamError>>;

/// Answer to a [`StreamRequest`]
pub enum StreamReply {
    /// The provider accepted and streams batches
    Handle(BatchStream),
    /// The provider refused
    Error(String),
    /// Some other reply; describes what arrived instead
    Unexpected(String),
}

impl fmt::Debug for StreamReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamReply::Handle(_) => f.write_str("Handle(..)"),
            StreamReply::Error(message) => f.debug_tuple("Error").field(message).finish(),
            StreamReply::Unexpected(what) => f.debug_tuple("Unexpected").field(what).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_has_correlation_id() {
        let a = StreamRequest::new(10, Duration::from_secs(1), StreamCursor::empty());
        let b = StreamRequest::new(10, Duration::from_secs(1), StreamCursor::empty());

        assert!(a.correlation_id().is_some());
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[test]
    fn test_request_headers() {
        let request = StreamRequest::new(5, Duration::from_secs(1), StreamCursor::new("x", 1))
            .with_header("tenant", "acme");

        assert_eq!(request.headers.get("tenant"), Some(&"acme".to_string()));
        assert_eq!(request.lower_bound, StreamCursor::new("x", 1));
    }

    #[test]
    fn test_reply_debug_hides_stream() {
        let reply = StreamReply::Handle(Box::pin(futures::stream::empty()));
        assert_eq!(format!("{reply:?}"), "Handle(..)");
    }
}
