//! Lazy zip of two inputs
//!
//! Unlike an eager zip, [`LazyZip`] asks the `lazy` input for work only once
//! the `strict` input has produced the element it will be paired with. Useful
//! when the lazy side is expensive (a lookup, a remote call) and should never
//! run speculatively.
//!
//! ```text
//! demand ──► pull strict ──► a ──► pull lazy ──► b ──► emit (a, b)
//! ```

use super::InletState;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Instructions from [`LazyZipLogic`] to its host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZipCommand<A, B> {
    PullStrict,
    PullLazy,
    Emit((A, B)),
    Complete,
}

/// State machine behind [`LazyZip`]
#[derive(Debug)]
pub struct LazyZipLogic<A, B> {
    demand: u64,
    strict: InletState,
    lazy: InletState,
    waiting: Option<A>,
    completed: bool,
    commands: VecDeque<ZipCommand<A, B>>,
}

impl<A, B> LazyZipLogic<A, B> {
    pub fn new() -> Self {
        Self {
            demand: 0,
            strict: InletState::default(),
            lazy: InletState::default(),
            waiting: None,
            completed: false,
            commands: VecDeque::new(),
        }
    }

    pub fn on_output_demand(&mut self) {
        self.demand = self.demand.saturating_add(1);
        self.evaluate();
    }

    pub fn on_strict(&mut self, element: A) {
        self.strict.answered();
        self.waiting = Some(element);
        self.evaluate();
    }

    pub fn on_lazy(&mut self, element: B) {
        self.lazy.answered();
        // Lazy is only pulled while a strict element waits
        if let Some(strict) = self.waiting.take() {
            self.demand = self.demand.saturating_sub(1);
            self.commands.push_back(ZipCommand::Emit((strict, element)));
        }
        self.evaluate();
    }

    pub fn on_strict_closed(&mut self) {
        self.strict.close();
        self.evaluate();
    }

    pub fn on_lazy_closed(&mut self) {
        self.lazy.close();
        self.evaluate();
    }

    pub fn next_command(&mut self) -> Option<ZipCommand<A, B>> {
        self.commands.pop_front()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn evaluate(&mut self) {
        if self.completed {
            return;
        }

        let strict_exhausted = self.strict.closed && self.waiting.is_none();
        let lazy_exhausted = self.lazy.closed;
        if strict_exhausted || lazy_exhausted {
            self.waiting = None;
            self.completed = true;
            self.commands.push_back(ZipCommand::Complete);
            return;
        }

        if self.waiting.is_some() {
            if self.lazy.can_pull() {
                self.lazy.pulled = true;
                self.commands.push_back(ZipCommand::PullLazy);
            }
        } else if self.demand > 0 && self.strict.can_pull() {
            self.strict.pulled = true;
            self.commands.push_back(ZipCommand::PullStrict);
        }
    }
}

impl<A, B> Default for LazyZipLogic<A, B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of `(strict, lazy)` pairs, pulling `lazy` only when a partner is ready
pub struct LazyZip<S, L>
where
    S: Stream,
    L: Stream,
{
    strict: S,
    lazy: L,
    logic: LazyZipLogic<S::Item, L::Item>,
    demanded: bool,
    strict_pulled: bool,
    lazy_pulled: bool,
    done: bool,
}

impl<S, L> LazyZip<S, L>
where
    S: Stream + Unpin,
    L: Stream + Unpin,
{
    pub fn new(strict: S, lazy: L) -> Self {
        Self {
            strict,
            lazy,
            logic: LazyZipLogic::new(),
            demanded: false,
            strict_pulled: false,
            lazy_pulled: false,
            done: false,
        }
    }
}

// Fields are never pinned; buffered items need not be `Unpin`
impl<S: Stream, L: Stream> Unpin for LazyZip<S, L> {}

impl<S, L> Stream for LazyZip<S, L>
where
    S: Stream + Unpin,
    L: Stream + Unpin,
{
    type Item = (S::Item, L::Item);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if !this.demanded {
            this.demanded = true;
            this.logic.on_output_demand();
        }

        loop {
            while let Some(command) = this.logic.next_command() {
                match command {
                    ZipCommand::PullStrict => this.strict_pulled = true,
                    ZipCommand::PullLazy => this.lazy_pulled = true,
                    ZipCommand::Emit(pair) => {
                        this.demanded = false;
                        return Poll::Ready(Some(pair));
                    }
                    ZipCommand::Complete => {
                        this.done = true;
                        return Poll::Ready(None);
                    }
                }
            }

            if this.strict_pulled {
                match this.strict.poll_next_unpin(cx) {
                    Poll::Ready(Some(element)) => {
                        this.strict_pulled = false;
                        this.logic.on_strict(element);
                    }
                    Poll::Ready(None) => {
                        this.strict_pulled = false;
                        this.logic.on_strict_closed();
                    }
                    Poll::Pending => return Poll::Pending,
                }
            } else if this.lazy_pulled {
                match this.lazy.poll_next_unpin(cx) {
                    Poll::Ready(Some(element)) => {
                        this.lazy_pulled = false;
                        this.logic.on_lazy(element);
                    }
                    Poll::Ready(None) => {
                        this.lazy_pulled = false;
                        this.logic.on_lazy_closed();
                    }
                    Poll::Pending => return Poll::Pending,
                }
            } else {
                return Poll::Pending;
            }
        }
    }
}
