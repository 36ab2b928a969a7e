//! VIRTA - resilient flow control for cluster streams
//!
//! Stream stages and resumption machinery for pulling one logical stream of
//! entity ids out of several remote providers without overrunning consumers
//! or hammering providers that are recovering.
//!
//! # Architecture
//!
//! ```text
//! Providers ──► ResumableSource (retry + backoff) ──► batch flattening ──► Consumer
//!                                                          │
//!                      stages: CreditGate, LazyZip, Multiplexer
//! ```
//!
//! Stage logic is a plain state machine; the `futures::Stream` adapters drive
//! it. Timers and remote requests run on tokio.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod cursor;
pub mod error;
pub mod metrics;
pub mod resume;
pub mod retry;
pub mod stage;

pub use backoff::{BackoffCoordinator, BackoffHandle, BackoffRunner};
pub use cluster::{ClusterTransport, ProviderAddress, ResumableClusterStream};
pub use config::StreamConfig;
pub use cursor::{EntityIdWithRevision, StreamCursor};
pub use error::{Result, StreamError, VirtaError};
pub use resume::{Resumable, ResumableSource, RestartSettings};
pub use retry::RetryTimeoutStrategy;
pub use stage::{CreditGate, LazyZip, Multiplexer};
