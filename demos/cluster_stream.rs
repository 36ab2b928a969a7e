//! Cluster stream demo
//!
//! Streams entity ids from three in-memory providers. One of them drops its
//! connection halfway and gets resumed, another one is down for good and is
//! skipped. The consumer hands out credit in small grants.
//!
//! ```bash
//! cargo run --example cluster_stream
//! RUST_LOG=virta=debug cargo run --example cluster_stream
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use virta::cluster::protocol::{StreamReply, StreamRequest};
use virta::cluster::{Batch, StreamMessage};
use virta::metrics::{self, Metrics};
use virta::stage::CreditGate;
use virta::{
    ClusterTransport, EntityIdWithRevision, ProviderAddress, ResumableClusterStream,
    StreamConfig, StreamCursor, StreamError,
};

const CREDIT_GRANT: u64 = 4;

/// Providers backed by fixed entity lists
struct InMemoryCluster {
    flaky_attempts: AtomicUsize,
}

impl InMemoryCluster {
    fn entities(prefix: &str) -> Vec<EntityIdWithRevision> {
        (0..10)
            .map(|i| EntityIdWithRevision::new(format!("{prefix}:{i:02}"), 1))
            .collect()
    }

    fn serve(
        elements: Vec<EntityIdWithRevision>,
        request: &StreamRequest,
        fail_after: Option<usize>,
    ) -> StreamReply {
        let mut remaining: Vec<_> = elements
            .into_iter()
            .filter(|e| StreamCursor::from(e) > request.lower_bound)
            .collect();
        if let Some(limit) = fail_after {
            remaining.truncate(limit);
        }

        let mut messages: Vec<Result<StreamMessage, StreamError>> = remaining
            .chunks(request.burst as usize)
            .map(|chunk| Ok(StreamMessage::Batch(Batch::new("thing", chunk.to_vec()))))
            .collect();
        if fail_after.is_some() {
            messages.push(Err(StreamError::Transport("connection reset by peer".into())));
        }

        StreamReply::Handle(stream::iter(messages).boxed())
    }
}

#[async_trait]
impl ClusterTransport for InMemoryCluster {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn ask(
        &self,
        provider: &ProviderAddress,
        request: StreamRequest,
    ) -> Result<StreamReply, StreamError> {
        tokio::time::sleep(Duration::from_millis(20)).await;

        match provider.path.as_str() {
            "/user/thingsRoot" => Ok(Self::serve(Self::entities("thing"), &request, None)),
            "/user/policiesRoot" => {
                let attempt = self.flaky_attempts.fetch_add(1, Ordering::SeqCst);
                let fail_after = (attempt == 0).then_some(5);
                Ok(Self::serve(Self::entities("policy"), &request, fail_after))
            }
            _ => Ok(StreamReply::Error(format!("{provider} is not started"))),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Metrics::init()?;

    let config = StreamConfig {
        min_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(1),
        max_restarts: 3,
        burst: 3,
        ..StreamConfig::from_env()?
    };

    let providers = vec![
        ProviderAddress::new("/user/thingsRoot", "things"),
        ProviderAddress::new("/user/connectionsRoot", "connectivity"),
        ProviderAddress::new("/user/policiesRoot", "policies"),
    ];

    let transport = Arc::new(InMemoryCluster {
        flaky_attempts: AtomicUsize::new(0),
    });
    let cluster = ResumableClusterStream::new(transport, providers, config)?
        .with_header("origin", "demo");

    let (credit_tx, credit_rx) = mpsc::unbounded_channel();
    credit_tx.send(CREDIT_GRANT)?;

    let mut ids = CreditGate::new(cluster.stream(), UnboundedReceiverStream::new(credit_rx));

    let mut received = 0u64;
    while let Some(id) = ids.next().await {
        received += 1;
        info!(%id, received, "received");

        if received % CREDIT_GRANT == 0 {
            credit_tx.send(CREDIT_GRANT)?;
        }
    }

    info!(received, "stream finished");
    println!("{}", metrics::gather());

    Ok(())
}
