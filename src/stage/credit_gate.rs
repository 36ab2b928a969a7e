//! Credit-regulated flow control
//!
//! A [`CreditGate`] sits between a fast producer and a slow consumer. The
//! consumer (or anything else) grants credit on a side channel; the gate
//! admits one element per credit unit, and only while downstream is asking.
//!
//! ```text
//!   elements ──► ┌────────────┐
//!                │ CreditGate │ ──► out
//!   credits  ──► └────────────┘
//! ```
//!
//! A credit value *replaces* the previous allowance; it is not added to it.
//! When the allowance hits zero the gate asks for the next credit value.

use super::InletState;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Instructions from [`CreditGateLogic`] to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCommand<T> {
    /// Request one element from the element inlet
    PullElement,
    /// Request the next credit value
    PullCredit,
    /// Push an element downstream
    Emit(T),
    /// Downstream is done, no more elements will follow
    Complete,
}

/// State machine behind [`CreditGate`]
///
/// Invariants:
/// - an element is requested only when `credit > 0`, `demand > 0`, the
///   in-flight queue is empty and no element request is outstanding
/// - hence at most one element is ever in flight
#[derive(Debug)]
pub struct CreditGateLogic<T> {
    credit: u64,
    demand: u64,
    in_flight: VecDeque<T>,
    elements: InletState,
    credits: InletState,
    completed: bool,
    commands: VecDeque<GateCommand<T>>,
}

impl<T> CreditGateLogic<T> {
    pub fn new() -> Self {
        Self {
            credit: 0,
            demand: 0,
            in_flight: VecDeque::with_capacity(1),
            elements: InletState::default(),
            credits: InletState::default(),
            completed: false,
            commands: VecDeque::new(),
        }
    }

    /// Stage started: ask for the first allowance
    pub fn on_start(&mut self) {
        self.evaluate();
    }

    /// A credit value arrived; it replaces the current allowance
    pub fn on_credit(&mut self, credit: u64) {
        self.credits.answered();
        self.credit = credit;
        self.evaluate();
    }

    /// An element arrived from upstream
    pub fn on_element(&mut self, element: T) {
        self.elements.answered();
        self.in_flight.push_back(element);
        self.evaluate();
    }

    /// Downstream wants one more element
    pub fn on_output_demand(&mut self) {
        self.demand = self.demand.saturating_add(1);
        self.evaluate();
    }

    /// The element inlet finished
    pub fn on_elements_closed(&mut self) {
        self.elements.close();
        self.evaluate();
    }

    /// The credit inlet finished; the remaining allowance is still honoured
    pub fn on_credits_closed(&mut self) {
        self.credits.close();
        self.evaluate();
    }

    /// Take the next queued command
    pub fn next_command(&mut self) -> Option<GateCommand<T>> {
        self.commands.pop_front()
    }

    pub fn credit(&self) -> u64 {
        self.credit
    }

    pub fn demand(&self) -> u64 {
        self.demand
    }

    /// Elements received but not yet delivered
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn evaluate(&mut self) {
        if self.completed {
            return;
        }

        while self.demand > 0 {
            let Some(element) = self.in_flight.pop_front() else {
                break;
            };
            self.demand -= 1;
            self.commands.push_back(GateCommand::Emit(element));
        }

        if self.should_complete() {
            self.completed = true;
            self.commands.push_back(GateCommand::Complete);
            return;
        }

        if self.credit > 0 && self.demand > 0 && self.in_flight.is_empty() && self.elements.can_pull()
        {
            self.credit -= 1;
            self.elements.pulled = true;
            self.commands.push_back(GateCommand::PullElement);
        }

        if self.credit == 0 && self.credits.can_pull() {
            self.credits.pulled = true;
            self.commands.push_back(GateCommand::PullCredit);
        }
    }

    fn should_complete(&self) -> bool {
        if !self.in_flight.is_empty() || self.elements.pulled {
            return false;
        }
        // Without credit and without a credit source nothing can be admitted again
        self.elements.closed || (self.credits.closed && self.credit == 0)
    }
}

impl<T> Default for CreditGateLogic<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream that admits elements from `elements` as allowed by `credits`
///
/// Every `poll_next` counts as one unit of downstream demand.
///
/// # Example
///
/// ```
/// use futures::{StreamExt, stream};
/// use virta::stage::CreditGate;
///
/// futures::executor::block_on(async {
///     let elements = stream::iter(1..=10);
///     let credits = stream::iter(vec![3u64]);
///     let admitted: Vec<_> = CreditGate::new(elements, credits).collect().await;
///     assert_eq!(admitted, vec![1, 2, 3]);
/// });
/// ```
pub struct CreditGate<S, C>
where
    S: Stream,
{
    elements: S,
    credits: C,
    logic: CreditGateLogic<S::Item>,
    started: bool,
    demanded: bool,
    element_pulled: bool,
    credit_pulled: bool,
    done: bool,
}

impl<S, C> CreditGate<S, C>
where
    S: Stream + Unpin,
    C: Stream<Item = u64> + Unpin,
{
    pub fn new(elements: S, credits: C) -> Self {
        Self {
            elements,
            credits,
            logic: CreditGateLogic::new(),
            started: false,
            demanded: false,
            element_pulled: false,
            credit_pulled: false,
            done: false,
        }
    }

    /// Current allowance left
    pub fn credit(&self) -> u64 {
        self.logic.credit()
    }
}

// Fields are never pinned; buffered items need not be `Unpin`
impl<S: Stream, C> Unpin for CreditGate<S, C> {}

impl<S, C> Stream for CreditGate<S, C>
where
    S: Stream + Unpin,
    C: Stream<Item = u64> + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if !this.started {
            this.started = true;
            this.logic.on_start();
        }
        if !this.demanded {
            this.demanded = true;
            this.logic.on_output_demand();
        }

        loop {
            while let Some(command) = this.logic.next_command() {
                match command {
                    GateCommand::PullElement => this.element_pulled = true,
                    GateCommand::PullCredit => this.credit_pulled = true,
                    GateCommand::Emit(element) => {
                        this.demanded = false;
                        return Poll::Ready(Some(element));
                    }
                    GateCommand::Complete => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                }
            }

            let mut progressed = false;

            if this.credit_pulled {
                match this.credits.poll_next_unpin(cx) {
                    Poll::Ready(Some(credit)) => {
                        this.credit_pulled = false;
                        tracing::trace!(credit, "credit granted");
                        this.logic.on_credit(credit);
                        progressed = true;
                    }
                    Poll::Ready(None) => {
                        this.credit_pulled = false;
                        this.logic.on_credits_closed();
                        progressed = true;
                    }
                    Poll::Pending => {}
                }
            }

            if this.element_pulled {
                match this.elements.poll_next_unpin(cx) {
                    Poll::Ready(Some(element)) => {
                        this.element_pulled = false;
                        this.logic.on_element(element);
                        progressed = true;
                    }
                    Poll::Ready(None) => {
                        this.element_pulled = false;
                        this.logic.on_elements_closed();
                        progressed = true;
                    }
                    Poll::Pending => {}
                }
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    }
}
