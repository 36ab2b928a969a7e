//! Classification-based multiplexer
//!
//! Splits one input into an *accepted* and a *rejected* output. A classifier
//! runs exactly once per element and decides which side it goes to.
//!
//! ```text
//!                        ┌──► accepted (A)
//!   input (T) ──► classify
//!                        └──► rejected (R)
//! ```
//!
//! Input is pulled as soon as at least one open outlet wants an element. An
//! element routed to an outlet that is not asking yet waits there, holding
//! back further input until that outlet pulls. Elements routed to a dropped
//! outlet are discarded; when both outlets are dropped the input is released.

use super::InletState;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Result of classifying one element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed<A, R> {
    Accepted(A),
    Rejected(R),
}

impl<A, R> Routed<A, R> {
    pub fn outlet(&self) -> Outlet {
        match self {
            Routed::Accepted(_) => Outlet::Accepted,
            Routed::Rejected(_) => Outlet::Rejected,
        }
    }
}

/// One of the two multiplexer outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outlet {
    Accepted,
    Rejected,
}

impl Outlet {
    fn index(self) -> usize {
        match self {
            Outlet::Accepted => 0,
            Outlet::Rejected => 1,
        }
    }

    fn other(self) -> Outlet {
        match self {
            Outlet::Accepted => Outlet::Rejected,
            Outlet::Rejected => Outlet::Accepted,
        }
    }
}

/// Type alias for the classification function
pub type Classifier<T, A, R> = Box<dyn FnMut(T) -> Routed<A, R> + Send>;

/// Instructions from [`MultiplexerLogic`] to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCommand<A, R> {
    /// Request one element from the input
    Pull,
    /// Push a classified element to its outlet
    Emit(Routed<A, R>),
    /// Both outlets are finished
    Complete,
    /// Nobody is listening anymore; release the input
    CancelUpstream,
}

#[derive(Debug, Clone, Copy, Default)]
struct OutletState {
    demand: bool,
    cancelled: bool,
}

/// State machine behind [`Multiplexer`]
pub struct MultiplexerLogic<T, A, R> {
    classify: Classifier<T, A, R>,
    upstream: InletState,
    outlets: [OutletState; 2],
    waiting: Option<Routed<A, R>>,
    finished: bool,
    commands: VecDeque<MuxCommand<A, R>>,
}

impl<T, A, R> MultiplexerLogic<T, A, R> {
    pub fn new<F>(classify: F) -> Self
    where
        F: FnMut(T) -> Routed<A, R> + Send + 'static,
    {
        Self {
            classify: Box::new(classify),
            upstream: InletState::default(),
            outlets: [OutletState::default(); 2],
            waiting: None,
            finished: false,
            commands: VecDeque::new(),
        }
    }

    /// An outlet asks for one element
    pub fn on_output_demand(&mut self, outlet: Outlet) {
        let state = &mut self.outlets[outlet.index()];
        if !state.cancelled {
            state.demand = true;
        }
        self.evaluate();
    }

    /// An outlet will never pull again
    pub fn on_output_cancel(&mut self, outlet: Outlet) {
        let state = &mut self.outlets[outlet.index()];
        state.cancelled = true;
        state.demand = false;
        if self.waiting.as_ref().map(Routed::outlet) == Some(outlet) {
            self.waiting = None;
        }
        self.evaluate();
    }

    pub fn on_element(&mut self, element: T) {
        self.upstream.answered();
        let routed = (self.classify)(element);
        let outlet = routed.outlet();
        if self.outlets[outlet.index()].cancelled {
            tracing::trace!(?outlet, "dropping element for cancelled outlet");
        } else {
            self.waiting = Some(routed);
        }
        self.evaluate();
    }

    pub fn on_upstream_closed(&mut self) {
        self.upstream.close();
        self.evaluate();
    }

    pub fn next_command(&mut self) -> Option<MuxCommand<A, R>> {
        self.commands.pop_front()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn evaluate(&mut self) {
        if self.finished {
            return;
        }

        if let Some(outlet) = self.waiting.as_ref().map(Routed::outlet) {
            let state = &mut self.outlets[outlet.index()];
            if state.demand {
                state.demand = false;
                if let Some(routed) = self.waiting.take() {
                    self.commands.push_back(MuxCommand::Emit(routed));
                }
            }
        }

        if self.outlets.iter().all(|o| o.cancelled) {
            self.finished = true;
            self.waiting = None;
            self.commands.push_back(MuxCommand::CancelUpstream);
            return;
        }

        if self.waiting.is_none() && self.upstream.closed {
            self.finished = true;
            self.commands.push_back(MuxCommand::Complete);
            return;
        }

        let any_demand = self.outlets.iter().any(|o| o.demand && !o.cancelled);
        if self.waiting.is_none() && any_demand && self.upstream.can_pull() {
            self.upstream.pulled = true;
            self.commands.push_back(MuxCommand::Pull);
        }
    }
}

struct Shared<S, A, R>
where
    S: Stream,
{
    upstream: Option<S>,
    logic: MultiplexerLogic<S::Item, A, R>,
    pulled: bool,
    demanded: [bool; 2],
    accepted: Option<A>,
    rejected: Option<R>,
    done: bool,
    wakers: [Option<Waker>; 2],
}

impl<S: Stream, A, R> Shared<S, A, R> {
    fn run_commands(&mut self) {
        while let Some(command) = self.logic.next_command() {
            match command {
                MuxCommand::Pull => self.pulled = true,
                MuxCommand::Emit(Routed::Accepted(a)) => self.accepted = Some(a),
                MuxCommand::Emit(Routed::Rejected(r)) => self.rejected = Some(r),
                MuxCommand::Complete => self.done = true,
                MuxCommand::CancelUpstream => {
                    self.done = true;
                    self.pulled = false;
                    self.upstream = None;
                }
            }
        }
    }

    fn wake(&mut self, outlet: Outlet) {
        if let Some(waker) = self.wakers[outlet.index()].take() {
            waker.wake();
        }
    }

    fn cancel(&mut self, outlet: Outlet) {
        self.logic.on_output_cancel(outlet);
        self.run_commands();
        self.wake(outlet.other());
    }
}

impl<S, A, R> Shared<S, A, R>
where
    S: Stream + Unpin,
{
    /// Drive the shared state on behalf of `outlet` until it has an answer
    fn poll_outlet(&mut self, outlet: Outlet, cx: &mut Context<'_>) -> Poll<bool> {
        if !self.demanded[outlet.index()] {
            self.demanded[outlet.index()] = true;
            self.logic.on_output_demand(outlet);
        }

        loop {
            self.run_commands();

            let delivered = match outlet {
                Outlet::Accepted => self.accepted.is_some(),
                Outlet::Rejected => self.rejected.is_some(),
            };
            if delivered || self.done {
                if delivered {
                    self.demanded[outlet.index()] = false;
                }
                // A pull issued for the other outlet must be driven by someone
                self.wake(outlet.other());
                return Poll::Ready(delivered);
            }

            let polled = match (self.pulled, self.upstream.as_mut()) {
                (true, Some(upstream)) => upstream.poll_next_unpin(cx),
                _ => Poll::Pending,
            };
            match polled {
                Poll::Ready(Some(element)) => {
                    self.pulled = false;
                    self.logic.on_element(element);
                }
                Poll::Ready(None) => {
                    self.pulled = false;
                    self.logic.on_upstream_closed();
                }
                Poll::Pending => {
                    self.wakers[outlet.index()] = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
            // The other outlet may be parked on the upstream waker we just consumed
            self.wake(outlet.other());
        }
    }
}

/// Entry point for splitting a stream
pub struct Multiplexer;

impl Multiplexer {
    /// Split `input` into accepted and rejected streams using `classify`
    ///
    /// # Example
    ///
    /// ```
    /// use futures::{StreamExt, stream};
    /// use virta::stage::{Multiplexer, Routed};
    ///
    /// futures::executor::block_on(async {
    ///     let (evens, odds) = Multiplexer::split(stream::iter(1..=6), |n: i32| {
    ///         if n % 2 == 0 { Routed::Accepted(n) } else { Routed::Rejected(n) }
    ///     });
    ///     let (evens, odds): (Vec<_>, Vec<_>) = futures::join!(evens.collect(), odds.collect());
    ///     assert_eq!(evens, vec![2, 4, 6]);
    ///     assert_eq!(odds, vec![1, 3, 5]);
    /// });
    /// ```
    pub fn split<S, A, R, F>(input: S, classify: F) -> (Accepted<S, A, R>, Rejected<S, A, R>)
    where
        S: Stream + Unpin,
        F: FnMut(S::Item) -> Routed<A, R> + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            upstream: Some(input),
            logic: MultiplexerLogic::new(classify),
            pulled: false,
            demanded: [false; 2],
            accepted: None,
            rejected: None,
            done: false,
            wakers: [None, None],
        }));

        (
            Accepted {
                shared: Arc::clone(&shared),
            },
            Rejected { shared },
        )
    }
}

/// Accepted side of a [`Multiplexer`]
pub struct Accepted<S: Stream, A, R> {
    shared: Arc<Mutex<Shared<S, A, R>>>,
}

/// Rejected side of a [`Multiplexer`]
pub struct Rejected<S: Stream, A, R> {
    shared: Arc<Mutex<Shared<S, A, R>>>,
}

impl<S, A, R> Stream for Accepted<S, A, R>
where
    S: Stream + Unpin,
{
    type Item = A;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<A>> {
        let mut shared = self.shared.lock();
        match shared.poll_outlet(Outlet::Accepted, cx) {
            Poll::Ready(true) => Poll::Ready(shared.accepted.take()),
            Poll::Ready(false) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S, A, R> Stream for Rejected<S, A, R>
where
    S: Stream + Unpin,
{
    type Item = R;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<R>> {
        let mut shared = self.shared.lock();
        match shared.poll_outlet(Outlet::Rejected, cx) {
            Poll::Ready(true) => Poll::Ready(shared.rejected.take()),
            Poll::Ready(false) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: Stream, A, R> Drop for Accepted<S, A, R> {
    fn drop(&mut self) {
        self.shared.lock().cancel(Outlet::Accepted);
    }
}

impl<S: Stream, A, R> Drop for Rejected<S, A, R> {
    fn drop(&mut self) {
        self.shared.lock().cancel(Outlet::Rejected);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn parity(n: u32) -> Routed<u32, u32> {
        if n % 2 == 0 {
            Routed::Accepted(n)
        } else {
            Routed::Rejected(n)
        }
    }

    fn drain<T, A, R>(logic: &mut MultiplexerLogic<T, A, R>) -> Vec<MuxCommand<A, R>> {
        std::iter::from_fn(|| logic.next_command()).collect()
    }

    #[test]
    fn test_pulls_when_one_outlet_asks() {
        let mut logic = MultiplexerLogic::new(parity);
        logic.on_output_demand(Outlet::Rejected);
        assert_eq!(drain(&mut logic), vec![MuxCommand::Pull]);
    }

    #[test]
    fn test_element_waits_for_its_outlet() {
        let mut logic = MultiplexerLogic::new(parity);
        logic.on_output_demand(Outlet::Rejected);
        drain(&mut logic);

        // Even number goes to the accepted side, which has not asked
        logic.on_element(4);
        assert!(drain(&mut logic).is_empty());

        logic.on_output_demand(Outlet::Accepted);
        assert_eq!(
            drain(&mut logic),
            vec![MuxCommand::Emit(Routed::Accepted(4)), MuxCommand::Pull]
        );
    }

    #[test]
    fn test_classifier_runs_once_per_element() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&calls);
        let mut logic = MultiplexerLogic::new(move |n: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            parity(n)
        });

        logic.on_output_demand(Outlet::Accepted);
        logic.on_element(1);
        logic.on_output_demand(Outlet::Rejected);
        logic.on_output_demand(Outlet::Rejected);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_outlet_elements_dropped() {
        let mut logic = MultiplexerLogic::new(parity);
        logic.on_output_cancel(Outlet::Rejected);
        logic.on_output_demand(Outlet::Accepted);
        drain(&mut logic);

        logic.on_element(3);
        assert_eq!(drain(&mut logic), vec![MuxCommand::Pull]);

        logic.on_element(8);
        assert_eq!(
            drain(&mut logic),
            vec![MuxCommand::Emit(Routed::Accepted(8))]
        );
    }

    #[test]
    fn test_both_cancelled_releases_upstream() {
        let mut logic = MultiplexerLogic::new(parity);
        logic.on_output_cancel(Outlet::Rejected);
        logic.on_output_cancel(Outlet::Accepted);
        assert_eq!(drain(&mut logic), vec![MuxCommand::CancelUpstream]);
        assert!(logic.is_finished());
    }

    #[test]
    fn test_upstream_close_completes_after_waiting_element() {
        let mut logic = MultiplexerLogic::new(parity);
        logic.on_output_demand(Outlet::Accepted);
        logic.on_element(5);
        logic.on_upstream_closed();
        drain(&mut logic);
        assert!(!logic.is_finished());

        logic.on_output_demand(Outlet::Rejected);
        assert_eq!(
            drain(&mut logic),
            vec![MuxCommand::Emit(Routed::Rejected(5)), MuxCommand::Complete]
        );
    }

    #[tokio::test]
    async fn test_split_routes_both_sides() {
        let (accepted, rejected) = Multiplexer::split(stream::iter(0..10u32), parity);

        let (evens, odds): (Vec<u32>, Vec<u32>) =
            tokio::join!(accepted.collect(), rejected.collect());

        assert_eq!(evens, vec![0, 2, 4, 6, 8]);
        assert_eq!(odds, vec![1, 3, 5, 7, 9]);
    }

    #[tokio::test]
    async fn test_split_with_dropped_side() {
        let (accepted, rejected) = Multiplexer::split(stream::iter(0..10u32), parity);
        drop(rejected);

        let evens: Vec<u32> = accepted.collect().await;
        assert_eq!(evens, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn test_split_across_tasks() {
        let (accepted, rejected) = Multiplexer::split(stream::iter(0..100u32), parity);

        let evens = tokio::spawn(accepted.collect::<Vec<_>>());
        let odds = tokio::spawn(rejected.collect::<Vec<_>>());

        assert_eq!(evens.await.unwrap().len(), 50);
        assert_eq!(odds.await.unwrap().len(), 50);
    }
}
