//! Resumable cluster streaming
//!
//! For every provider a [`ResumableSource`] asks for a paginated stream,
//! flattens the batches into single elements and resumes from the last seen
//! element when the sub-stream fails. A provider that keeps failing past its
//! restart budget contributes nothing; the other providers are unaffected.

use super::protocol::{Batch, BatchStream, StreamMessage, StreamReply, StreamRequest};
use super::{ClusterTransport, ProviderAddress};
use crate::config::StreamConfig;
use crate::cursor::{EntityIdWithRevision, StreamCursor};
use crate::error::{Result, StreamError};
use crate::metrics;
use crate::resume::{Resumable, ResumableSource};
use crate::stage::{Multiplexer, Routed};
use futures::future;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One logical stream of entity ids over several providers
///
/// # Example
///
/// ```ignore
/// let stream = ResumableClusterStream::new(transport, providers, StreamConfig::default())?
///     .with_header("tenant", "acme");
///
/// let mut ids = stream.stream();
/// while let Some(id) = ids.next().await {
///     println!("{id}");
/// }
/// ```
pub struct ResumableClusterStream {
    transport: Arc<dyn ClusterTransport>,
    providers: Vec<ProviderAddress>,
    config: StreamConfig,
    headers: HashMap<String, String>,
}

impl ResumableClusterStream {
    /// Create a cluster stream over `providers`, visited in order
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        providers: Vec<ProviderAddress>,
        config: StreamConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            providers,
            config,
            headers: HashMap::new(),
        })
    }

    /// Add a header sent with every stream request
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn providers(&self) -> &[ProviderAddress] {
        &self.providers
    }

    /// Materialize the stream
    ///
    /// Nothing is requested until the stream is polled. With
    /// `provider_parallelism = 1` the next provider is asked only after the
    /// previous one's sub-stream is finished. Dropping the stream cancels any
    /// outstanding request and pending restart.
    pub fn stream(&self) -> BoxStream<'static, EntityIdWithRevision> {
        info!(
            providers = self.providers.len(),
            transport = self.transport.name(),
            parallelism = self.config.provider_parallelism,
            "starting cluster stream"
        );

        let sources: Vec<_> = self
            .providers
            .iter()
            .map(|provider| self.provider_source(provider.clone()))
            .collect();

        let parallelism = self.config.provider_parallelism;
        if parallelism <= 1 {
            stream::iter(sources).flatten().boxed()
        } else {
            stream::iter(sources).flatten_unordered(parallelism).boxed()
        }
    }

    /// Sub-stream of one provider that ends quietly when the provider is given up
    fn provider_source(&self, provider: ProviderAddress) -> BoxStream<'static, EntityIdWithRevision> {
        let label = provider.to_string();
        let resumable = ProviderStream {
            transport: Arc::clone(&self.transport),
            provider,
            burst: self.config.burst,
            idle_timeout: self.config.idle_timeout,
            request_timeout: self.config.stream_request_timeout,
            headers: self.headers.clone(),
        };

        let source = match ResumableSource::new(
            resumable,
            StreamCursor::empty(),
            self.config.restart_settings(),
        ) {
            Ok(source) => source.named(label.clone()),
            Err(e) => {
                warn!(provider = %label, error = %e, "cannot stream from provider");
                return stream::empty().boxed();
            }
        };

        source
            .into_stream()
            .scan((), move |_, item| {
                future::ready(match item {
                    Ok(element) => {
                        metrics::try_record_element(&label);
                        Some(element)
                    }
                    Err(error) => {
                        warn!(
                            provider = %label,
                            error = %error,
                            "provider unavailable, skipping its contribution"
                        );
                        metrics::try_record_provider_failure(&label);
                        None
                    }
                })
            })
            .boxed()
    }
}

/// Resumable paginated stream from a single provider
struct ProviderStream {
    transport: Arc<dyn ClusterTransport>,
    provider: ProviderAddress,
    burst: u32,
    idle_timeout: Duration,
    request_timeout: Duration,
    headers: HashMap<String, String>,
}

impl ProviderStream {
    fn request(&self, lower_bound: StreamCursor) -> StreamRequest {
        let mut request = StreamRequest::new(self.burst, self.idle_timeout, lower_bound);
        for (key, value) in &self.headers {
            request.headers.insert(key.clone(), value.clone());
        }
        request
    }
}

impl Resumable for ProviderStream {
    type Item = EntityIdWithRevision;
    type Seed = StreamCursor;

    fn resume(
        &self,
        seed: StreamCursor,
    ) -> BoxStream<'static, std::result::Result<EntityIdWithRevision, StreamError>> {
        let handle = open_stream(
            Arc::clone(&self.transport),
            self.provider.clone(),
            self.request(seed),
            self.request_timeout,
        );

        let messages = stream::once(handle).try_flatten().boxed();
        let (batches, others) = Multiplexer::split(messages, classify_message);

        let elements = batches.flat_map(|batch| match batch {
            Ok(batch) => stream::iter(batch.elements.into_iter().map(Ok)).left_stream(),
            Err(error) => stream::once(future::ready(Err(error))).right_stream(),
        });

        let provider = self.provider.clone();
        let ignored = others.filter_map(move |message| {
            debug!(provider = %provider, ?message, "ignoring non-batch message");
            future::ready(None::<std::result::Result<EntityIdWithRevision, StreamError>>)
        });

        stream::select(elements, ignored).boxed()
    }

    /// Resume after the most recently observed element
    fn next_seed(&self, last: &[EntityIdWithRevision]) -> StreamCursor {
        last.last().map(StreamCursor::from).unwrap_or_else(StreamCursor::empty)
    }
}

/// Ask `provider` for a stream handle, failing after `request_timeout`
async fn open_stream(
    transport: Arc<dyn ClusterTransport>,
    provider: ProviderAddress,
    request: StreamRequest,
    request_timeout: Duration,
) -> std::result::Result<BatchStream, StreamError> {
    debug!(
        provider = %provider,
        lower_bound = %request.lower_bound,
        correlation_id = request.correlation_id().unwrap_or_default(),
        "requesting stream"
    );

    let reply = tokio::time::timeout(request_timeout, transport.ask(&provider, request))
        .await
        .map_err(|_| StreamError::Timeout {
            provider: provider.to_string(),
            millis: request_timeout.as_millis() as u64,
        })??;

    match reply {
        StreamReply::Handle(batches) => Ok(batches),
        StreamReply::Error(message) => Err(StreamError::Provider {
            provider: provider.to_string(),
            message,
        }),
        StreamReply::Unexpected(what) => Err(StreamError::UnexpectedReply(format!(
            "expected a stream handle from '{provider}', got {what}"
        ))),
    }
}

/// Batches and failures flow on; anything else is split off
fn classify_message(
    message: std::result::Result<StreamMessage, StreamError>,
) -> Routed<std::result::Result<Batch, StreamError>, StreamMessage> {
    match message {
        Ok(StreamMessage::Batch(batch)) => Routed::Accepted(Ok(batch)),
        Ok(other) => Routed::Rejected(other),
        Err(error) => Routed::Accepted(Err(error)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn entity(id: &str, revision: u64) -> EntityIdWithRevision {
        EntityIdWithRevision::new(id, revision)
    }

    /// Replies with one prepared sub-stream per request
    struct OneShotTransport {
        replies: Mutex<Vec<StreamReply>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    #[async_trait]
    impl ClusterTransport for OneShotTransport {
        fn name(&self) -> &'static str {
            "one-shot"
        }

        async fn ask(
            &self,
            _provider: &ProviderAddress,
            request: StreamRequest,
        ) -> std::result::Result<StreamReply, StreamError> {
            self.requests.lock().push(request);
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(StreamError::Transport("no more replies".into()));
            }
            Ok(replies.remove(0))
        }
    }

    fn provider_stream(transport: Arc<OneShotTransport>) -> ProviderStream {
        ProviderStream {
            transport,
            provider: ProviderAddress::new("/user/things", "things"),
            burst: 2,
            idle_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(1),
            headers: HashMap::from([("tenant".to_string(), "acme".to_string())]),
        }
    }

    #[test]
    fn test_next_seed_uses_last_element() {
        let transport = Arc::new(OneShotTransport {
            replies: Mutex::new(vec![]),
            requests: Mutex::new(vec![]),
        });
        let stream = provider_stream(transport);

        assert_eq!(stream.next_seed(&[]), StreamCursor::empty());
        assert_eq!(
            stream.next_seed(&[entity("a", 1), entity("b", 4)]),
            StreamCursor::new("b", 4)
        );
    }

    #[tokio::test]
    async fn test_resume_flattens_batches_and_skips_other_messages() {
        let batches: Vec<std::result::Result<StreamMessage, StreamError>> = vec![
            Ok(StreamMessage::Batch(Batch::new("thing", vec![entity("a", 1), entity("b", 2)]))),
            Ok(StreamMessage::Other {
                message_type: "heartbeat".into(),
            }),
            Ok(StreamMessage::Batch(Batch::new("thing", vec![entity("c", 3)]))),
        ];
        let transport = Arc::new(OneShotTransport {
            replies: Mutex::new(vec![StreamReply::Handle(stream::iter(batches).boxed())]),
            requests: Mutex::new(vec![]),
        });
        let provider = provider_stream(Arc::clone(&transport));

        let elements: Vec<_> = provider
            .resume(StreamCursor::new("0", 0))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(elements, vec![entity("a", 1), entity("b", 2), entity("c", 3)]);

        let requests = transport.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].burst, 2);
        assert_eq!(requests[0].lower_bound, StreamCursor::new("0", 0));
        assert_eq!(requests[0].headers.get("tenant"), Some(&"acme".to_string()));
        assert!(requests[0].correlation_id().is_some());
    }

    #[tokio::test]
    async fn test_unexpected_reply_becomes_failure() {
        let transport = Arc::new(OneShotTransport {
            replies: Mutex::new(vec![StreamReply::Unexpected("Pong".into())]),
            requests: Mutex::new(vec![]),
        });
        let provider = provider_stream(transport);

        let result: std::result::Result<Vec<_>, _> =
            provider.resume(StreamCursor::empty()).try_collect().await;

        match result {
            Err(StreamError::UnexpectedReply(message)) => assert!(message.contains("Pong")),
            other => panic!("expected unexpected-reply failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_reply_becomes_provider_failure() {
        let transport = Arc::new(OneShotTransport {
            replies: Mutex::new(vec![StreamReply::Error("shard not ready".into())]),
            requests: Mutex::new(vec![]),
        });
        let provider = provider_stream(transport);

        let result: std::result::Result<Vec<_>, _> =
            provider.resume(StreamCursor::empty()).try_collect().await;

        assert!(matches!(result, Err(StreamError::Provider { .. })));
    }

    /// Never answers
    struct SilentTransport;

    #[async_trait]
    impl ClusterTransport for SilentTransport {
        fn name(&self) -> &'static str {
            "silent"
        }

        async fn ask(
            &self,
            _provider: &ProviderAddress,
            _request: StreamRequest,
        ) -> std::result::Result<StreamReply, StreamError> {
            future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let provider = ProviderStream {
            transport: Arc::new(SilentTransport),
            provider: ProviderAddress::new("/user/slow", "slow"),
            burst: 1,
            idle_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(250),
            headers: HashMap::new(),
        };

        let result: std::result::Result<Vec<_>, _> =
            provider.resume(StreamCursor::empty()).try_collect().await;

        assert_eq!(
            result,
            Err(StreamError::Timeout {
                provider: "/user/slow@slow".into(),
                millis: 250
            })
        );
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = StreamConfig {
            burst: 0,
            ..Default::default()
        };
        let result = ResumableClusterStream::new(Arc::new(SilentTransport), vec![], config);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_providers_is_empty() {
        let cluster =
            ResumableClusterStream::new(Arc::new(SilentTransport), vec![], StreamConfig::default())
                .unwrap();
        let elements: Vec<_> = cluster.stream().collect().await;
        assert!(elements.is_empty());
    }
}
