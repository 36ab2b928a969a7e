//! Single-slot backoff coordinator
//!
//! Delays delivery of at most one payload at a time. A new request replaces
//! the pending one and waits longer:
//!
//! ```text
//!  back_off(p1) ──► pending p1, deliver in t1
//!  back_off(p2) ──► p1 discarded, pending p2, deliver in t2 (t2 ≥ t1)
//!        t2     ──► p2 sent to its requester, idle
//!      2·t2     ──► no new request: growth curve starts over at min
//! ```
//!
//! # Example
//!
//! ```ignore
//! let backoff = BackoffCoordinator::new(Duration::from_secs(1), Duration::from_secs(60))?
//!     .spawn::<Reconnect>();
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! backoff.back_off_with_answer(Reconnect, tx).await?;
//! let reconnect = rx.recv().await;
//! ```

use crate::config::StreamConfig;
use crate::error::{Result, VirtaError};
use crate::metrics;
use crate::retry::RetryTimeoutStrategy;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info};

const MAILBOX_CAPACITY: usize = 64;

/// Deadline used when a delay does not fit into an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Messages understood by the coordinator
#[derive(Debug)]
pub enum BackoffMessage<T> {
    /// Deliver `payload` to `reply_to` after the next backoff delay
    BackOffWithAnswer {
        payload: T,
        reply_to: mpsc::UnboundedSender<T>,
    },
    /// Whether a payload is pending
    IsInBackOff(oneshot::Sender<bool>),
    Shutdown,
}

/// Builder for a backoff coordinator task
#[derive(Debug, Clone)]
pub struct BackoffCoordinator {
    strategy: RetryTimeoutStrategy,
}

impl BackoffCoordinator {
    /// Fails when `min_backoff > max_backoff`
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Result<Self> {
        Ok(Self {
            strategy: RetryTimeoutStrategy::new(min_backoff, max_backoff)?,
        })
    }

    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        Self::new(config.min_backoff, config.max_backoff)
    }

    /// Split into a handle and the runner that must be driven to completion
    pub fn build<T: Send + 'static>(self) -> (BackoffHandle<T>, BackoffRunner<T>) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);

        let handle = BackoffHandle { tx };
        let runner = BackoffRunner {
            rx,
            strategy: self.strategy,
            pending: None,
            quiet_deadline: None,
        };

        (handle, runner)
    }

    /// Build and run on the current tokio runtime
    pub fn spawn<T: Send + 'static>(self) -> BackoffHandle<T> {
        let (handle, runner) = self.build();
        tokio::spawn(runner.run());
        handle
    }
}

/// Cloneable access to a running coordinator
///
/// Superseded payloads are dropped without notice. Callers can rely on
/// delivery of their most recent request only.
pub struct BackoffHandle<T> {
    tx: mpsc::Sender<BackoffMessage<T>>,
}

impl<T> Clone for BackoffHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> BackoffHandle<T> {
    /// Deliver `payload` to `reply_to` once the backoff delay has elapsed
    pub async fn back_off_with_answer(
        &self,
        payload: T,
        reply_to: mpsc::UnboundedSender<T>,
    ) -> Result<()> {
        self.send(BackoffMessage::BackOffWithAnswer { payload, reply_to })
            .await
    }

    pub async fn is_in_back_off(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(BackoffMessage::IsInBackOff(tx)).await?;
        rx.await.map_err(|_| VirtaError::Shutdown)
    }

    /// Stop the coordinator, dropping any pending payload
    pub async fn shutdown(&self) -> Result<()> {
        self.send(BackoffMessage::Shutdown).await
    }

    async fn send(&self, message: BackoffMessage<T>) -> Result<()> {
        self.tx.send(message).await.map_err(|_| VirtaError::Shutdown)
    }
}

struct PendingBackoff<T> {
    payload: T,
    reply_to: mpsc::UnboundedSender<T>,
    deliver_at: Instant,
}

/// Coordinator loop; runs until shut down or every handle is dropped
pub struct BackoffRunner<T> {
    rx: mpsc::Receiver<BackoffMessage<T>>,
    strategy: RetryTimeoutStrategy,
    pending: Option<PendingBackoff<T>>,
    quiet_deadline: Option<Instant>,
}

impl<T: Send + 'static> BackoffRunner<T> {
    pub async fn run(mut self) {
        info!(
            min_backoff_ms = self.strategy.min_timeout().as_millis() as u64,
            max_backoff_ms = self.strategy.max_timeout().as_millis() as u64,
            "Backoff coordinator started"
        );

        loop {
            let deliver_at = self.pending.as_ref().map(|p| p.deliver_at);

            tokio::select! {
                biased;

                message = self.rx.recv() => match message {
                    Some(BackoffMessage::BackOffWithAnswer { payload, reply_to }) => {
                        self.back_off(payload, reply_to);
                    }
                    Some(BackoffMessage::IsInBackOff(reply)) => {
                        let _ = reply.send(self.pending.is_some());
                    }
                    Some(BackoffMessage::Shutdown) | None => break,
                },
                () = sleep_until(deliver_at) => self.deliver(),
                () = sleep_until(self.quiet_deadline) => self.quiet_period_elapsed(),
            }
        }

        if self.pending.is_some() {
            debug!("Dropping pending backoff on shutdown");
        }
        info!("Backoff coordinator stopped");
    }

    fn back_off(&mut self, payload: T, reply_to: mpsc::UnboundedSender<T>) {
        let delay = self.strategy.next();
        let now = Instant::now();

        let superseded = self
            .pending
            .replace(PendingBackoff {
                payload,
                reply_to,
                deliver_at: deadline(now, delay),
            })
            .is_some();
        if superseded {
            metrics::try_record_backoff("superseded");
        }
        self.quiet_deadline = Some(deadline(now, delay.saturating_mul(2)));

        metrics::try_record_backoff("scheduled");
        metrics::try_record_backoff_delay(delay.as_secs_f64());
        debug!(
            delay_ms = delay.as_millis() as u64,
            tries = self.strategy.tries_since_reset(),
            superseded,
            "Backoff scheduled"
        );
    }

    fn deliver(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if pending.reply_to.send(pending.payload).is_err() {
            debug!("Requester gone, backed-off payload dropped");
        } else {
            metrics::try_record_backoff("delivered");
        }
    }

    fn quiet_period_elapsed(&mut self) {
        self.quiet_deadline = None;
        self.strategy.reset();
        debug!("Quiet period elapsed, backoff reset");
    }
}

fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn coordinator() -> BackoffCoordinator {
        BackoffCoordinator::new(Duration::from_millis(100), Duration::from_secs(10)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_payload_is_delivered() {
        let handle = coordinator().spawn::<u32>();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let start = Instant::now();
        handle.back_off_with_answer(1, tx.clone()).await.unwrap();
        handle.back_off_with_answer(2, tx).await.unwrap();

        assert_eq!(rx.recv().await, Some(2));
        // Second request waits the grown delay
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "elapsed {elapsed:?}");

        // Both senders are gone: payload 1 was never delivered
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseding_keeps_growing() {
        let handle = coordinator().spawn::<&'static str>();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let start = Instant::now();
        for payload in ["a", "b", "c"] {
            handle.back_off_with_answer(payload, tx.clone()).await.unwrap();
        }

        assert_eq!(rx.recv().await, Some("c"));
        // 100ms, 200ms, then 400ms for the last one
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_resets_growth() {
        let handle = coordinator().spawn::<u32>();
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle.back_off_with_answer(1, tx.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));

        // Within the quiet period the curve continues
        let start = Instant::now();
        handle.back_off_with_answer(2, tx.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
        assert!(start.elapsed() >= Duration::from_millis(200));

        // Outlast 2 × 200ms
        tokio::time::sleep(Duration::from_millis(500)).await;

        let start = Instant::now();
        handle.back_off_with_answer(3, tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(3));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_in_back_off() {
        let handle = coordinator().spawn::<u32>();
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(!handle.is_in_back_off().await.unwrap());

        handle.back_off_with_answer(7, tx).await.unwrap();
        assert!(handle.is_in_back_off().await.unwrap());

        assert_eq!(rx.recv().await, Some(7));
        assert!(!handle.is_in_back_off().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_requester_is_ignored() {
        let handle = coordinator().spawn::<u32>();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        handle.back_off_with_answer(1, tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!handle.is_in_back_off().await.unwrap());
    }

    #[tokio::test]
    async fn test_runner_stops_when_handles_drop() {
        let (handle, runner) = coordinator().build::<u32>();
        let task = tokio::spawn(runner.run());

        let other = handle.clone();
        drop(handle);
        drop(other);

        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (handle, runner) = coordinator().build::<u32>();
        let task = tokio::spawn(runner.run());

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            handle.is_in_back_off().await,
            Err(VirtaError::Shutdown)
        ));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let result = BackoffCoordinator::new(Duration::from_secs(5), Duration::from_secs(1));
        assert!(matches!(result, Err(VirtaError::InvalidConfiguration(_))));
    }
}
