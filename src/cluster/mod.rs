//! Cluster streaming for virta
//!
//! Pulls one logical stream out of several remote providers:
//!
//! ```text
//!             ┌─► provider A ──► resumable sub-stream ──┐
//!  consumer ◄─┼─► provider B ──► resumable sub-stream ──┼── flattened, in provider order
//!             └─► provider C ──► resumable sub-stream ──┘
//! ```
//!
//! The transport is not implemented here. Hosting code plugs in its
//! request/reply substrate through [`ClusterTransport`].

pub mod protocol;
pub mod stream;

use crate::error::StreamError;
use async_trait::async_trait;
use protocol::{StreamReply, StreamRequest};
use std::fmt;

pub use protocol::{Batch, BatchStream, StreamMessage};
pub use stream::ResumableClusterStream;

/// Logical address of a stream-providing role, e.g. `/user/thingsRoot` on role `things`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderAddress {
    pub path: String,
    pub role: String,
}

impl ProviderAddress {
    pub fn new(path: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.role)
    }
}

/// Reliable request/async-reply substrate to reach providers
///
/// # Example
///
/// ```ignore
/// struct MyTransport { client: MyClusterClient }
///
/// #[async_trait]
/// impl ClusterTransport for MyTransport {
///     fn name(&self) -> &'static str { "my-cluster" }
///
///     async fn ask(&self, provider: &ProviderAddress, request: StreamRequest)
///         -> Result<StreamReply, StreamError>
///     {
///         self.client.send(provider, request).await.map_err(|e| StreamError::Transport(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Transport name for identification and logging
    fn name(&self) -> &'static str;

    /// Send `request` to `provider` and await exactly one reply
    ///
    /// Timeouts are applied by the caller.
    async fn ask(
        &self,
        provider: &ProviderAddress,
        request: StreamRequest,
    ) -> Result<StreamReply, StreamError>;
}
