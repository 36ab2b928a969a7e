//! Resume failed streams from where they stopped
//!
//! A [`Resumable`] knows how to (re)open a stream from a seed and how to turn
//! the last few observed elements into the seed for the next attempt.
//! [`ResumableSource`] is the generic driver around it:
//!
//! ```text
//! resume(seed) ──► e1 e2 e3 ✗ ──► wait backoff ──► resume(next_seed([e3])) ──► e4 ...
//!                                      │
//!                        restarts > max_restarts ──► yield RestartsExhausted, end
//! ```
//!
//! A stream that completes normally completes the source; only transient
//! failures trigger a restart.

use crate::error::{Result, StreamError, VirtaError};
use crate::metrics;
use crate::retry::RetryTimeoutStrategy;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

/// A stream that can be reopened from a seed
pub trait Resumable: Send + Sync + 'static {
    /// Element type of the stream
    type Item: Clone + Send + 'static;

    /// Position to resume from
    type Seed: Clone + Send + 'static;

    /// Open the stream starting after `seed`
    fn resume(&self, seed: Self::Seed) -> BoxStream<'static, std::result::Result<Self::Item, StreamError>>;

    /// Seed for the next attempt, given the most recently observed elements
    ///
    /// `last` holds at most `lookback` elements, oldest first.
    fn next_seed(&self, last: &[Self::Item]) -> Self::Seed;
}

/// Backoff and budget for restarting a failed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartSettings {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Restarts before giving up; `0` never restarts
    pub max_restarts: usize,
    /// Elements remembered for [`Resumable::next_seed`]
    pub lookback: usize,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            max_restarts: 180,
            lookback: 1,
        }
    }
}

impl RestartSettings {
    fn strategy(&self) -> Result<RetryTimeoutStrategy> {
        if self.lookback == 0 {
            return Err(VirtaError::InvalidConfiguration(
                "lookback must be at least 1".to_string(),
            ));
        }
        RetryTimeoutStrategy::new(self.min_backoff, self.max_backoff)
    }
}

/// Stream driver restarting a [`Resumable`] with backoff
pub struct ResumableSource<R: Resumable> {
    name: String,
    resumable: R,
    seed: R::Seed,
    settings: RestartSettings,
    strategy: RetryTimeoutStrategy,
}

impl<R: Resumable> ResumableSource<R> {
    /// Create a driver starting from `initial_seed`
    ///
    /// Fails when the settings are inconsistent.
    pub fn new(resumable: R, initial_seed: R::Seed, settings: RestartSettings) -> Result<Self> {
        let strategy = settings.strategy()?;
        Ok(Self {
            name: "resumable".to_string(),
            resumable,
            seed: initial_seed,
            settings,
            strategy,
        })
    }

    /// Name used in logs and metrics
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Turn the driver into a stream
    ///
    /// Yields `Ok` elements across restarts. If the restart budget runs out the
    /// final item is `Err(StreamError::RestartsExhausted)` and the stream ends.
    pub fn into_stream(self) -> BoxStream<'static, std::result::Result<R::Item, StreamError>> {
        let driver = Driver {
            recent: VecDeque::with_capacity(self.settings.lookback),
            name: self.name,
            resumable: self.resumable,
            seed: self.seed,
            settings: self.settings,
            strategy: self.strategy,
            current: None,
            restarts: 0,
            backed_off: false,
            finished: false,
        };

        stream::unfold(driver, Driver::step).boxed()
    }
}

struct Driver<R: Resumable> {
    name: String,
    resumable: R,
    seed: R::Seed,
    settings: RestartSettings,
    strategy: RetryTimeoutStrategy,
    current: Option<BoxStream<'static, std::result::Result<R::Item, StreamError>>>,
    recent: VecDeque<R::Item>,
    restarts: usize,
    backed_off: bool,
    finished: bool,
}

impl<R: Resumable> Driver<R> {
    async fn step(mut self) -> Option<(std::result::Result<R::Item, StreamError>, Self)> {
        loop {
            if self.finished {
                return None;
            }

            if self.current.is_none() {
                debug!(source = %self.name, restarts = self.restarts, "opening stream");
                self.current = Some(self.resumable.resume(self.seed.clone()));
            }
            let Some(current) = self.current.as_mut() else {
                return None;
            };

            match current.next().await {
                Some(Ok(item)) => {
                    self.observe(&item);
                    return Some((Ok(item), self));
                }
                Some(Err(error)) => {
                    self.current = None;
                    if self.restarts >= self.settings.max_restarts || !error.is_transient() {
                        warn!(
                            source = %self.name,
                            restarts = self.restarts,
                            transient = error.is_transient(),
                            error = %error,
                            "giving up on stream"
                        );
                        self.finished = true;
                        let exhausted = StreamError::RestartsExhausted {
                            restarts: self.restarts,
                            last: Box::new(error),
                        };
                        return Some((Err(exhausted), self));
                    }

                    self.restarts += 1;
                    let delay = self.strategy.next();
                    self.backed_off = true;
                    if !self.recent.is_empty() {
                        self.seed = self.resumable.next_seed(self.recent.make_contiguous());
                    }

                    warn!(
                        source = %self.name,
                        restart = self.restarts,
                        max_restarts = self.settings.max_restarts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "stream failed, resuming after backoff"
                    );
                    metrics::try_record_restart(&self.name, delay.as_secs_f64());

                    tokio::time::sleep(delay).await;
                }
                None => {
                    debug!(source = %self.name, "stream completed");
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn observe(&mut self, item: &R::Item) {
        if self.recent.len() == self.settings.lookback {
            self.recent.pop_front();
        }
        self.recent.push_back(item.clone());

        // Progress after a restart: the next failure starts a fresh backoff curve
        if self.backed_off {
            self.backed_off = false;
            self.strategy.reset();
        }
    }
}
