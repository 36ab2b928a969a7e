//! Stream stages for virta
//!
//! Each stage is split in two halves:
//!
//! - a **logic** struct: an explicit state machine that reacts to port events
//!   (`on_output_demand`, `on_element`, `on_*_closed`, ...) and queues
//!   commands (`Pull*`, `Emit`, `Complete`) for its host
//! - a **host** adapter implementing [`futures::Stream`] that executes those
//!   commands against real input streams
//!
//! ```text
//!            ┌──────────── host (Stream::poll_next) ────────────┐
//!  inlets ──►│ poll inlet ──► logic.on_element() ──► commands ──┼──► outlet
//!            │        ▲                                 │       │
//!            │        └──────────── Pull ───────────────┘       │
//!            └──────────────────────────────────────────────────┘
//! ```
//!
//! The host processes one event to completion before the next, so the logic
//! needs no locking and can be driven directly in tests.

pub mod credit_gate;
pub mod lazy_zip;
pub mod multiplexer;

pub use credit_gate::{CreditGate, CreditGateLogic, GateCommand};
pub use lazy_zip::{LazyZip, LazyZipLogic, ZipCommand};
pub use multiplexer::{Accepted, Multiplexer, MultiplexerLogic, Outlet, Rejected, Routed};

/// Bookkeeping for one input port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InletState {
    /// A pull has been issued and not yet answered
    pub pulled: bool,
    /// Upstream finished
    pub closed: bool,
}

impl InletState {
    /// Whether a new pull may be issued
    pub fn can_pull(&self) -> bool {
        !self.pulled && !self.closed
    }

    /// Record an element (or completion) answering the outstanding pull
    pub fn answered(&mut self) {
        self.pulled = false;
    }

    pub fn close(&mut self) {
        self.pulled = false;
        self.closed = true;
    }
}
