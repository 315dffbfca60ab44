//! Fan-in of a known number of completions into one

use std::fmt::{self, Debug, Display};
use std::ops::Deref;

use crate::executor::DispatcherRef;
use crate::monitor::{boxed_handler, DefaultHandler, Handler, OnCompleted, RequestMonitor};

/// A monitor that completes after a declared number of `done()` calls.
///
/// Hand the same counting monitor (or a child of it) to each sub-operation, then
/// declare how many there were with [`set_done_count`](Self::set_done_count). The
/// declaration may come before, between or after the sub-operations finish. Every
/// non-OK status passed to `set_status` is merged into a multi-status, so the
/// parent sees every failure.
#[derive(Clone)]
pub struct CountingRequestMonitor {
    base: RequestMonitor,
}

impl CountingRequestMonitor {
    /// Counting monitor that reports to `parent` when complete
    pub fn new(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>) -> Self {
        Self::with_handler(dispatcher, parent, DefaultHandler)
    }

    /// Counting monitor with a custom completion handler
    pub fn with_handler<H: Handler<RequestMonitor>>(
        dispatcher: &DispatcherRef,
        parent: Option<&RequestMonitor>,
        handler: H,
    ) -> Self {
        Self {
            base: RequestMonitor::build(dispatcher.clone(), parent, boxed_handler(handler), true),
        }
    }

    /// Create a counting monitor whose `handle_completed` is `f`
    pub fn on_completed<F>(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>, f: F) -> Self
    where
        F: FnMut(&RequestMonitor) + Send + 'static,
    {
        Self::with_handler(dispatcher, parent, OnCompleted(f))
    }

    /// Declare how many `done()` calls complete this monitor.
    ///
    /// # Panics
    ///
    /// If called more than once, or if more `done()` calls than `count` have
    /// already arrived.
    pub fn set_done_count(&self, count: usize) {
        self.base.declare_done_count(count);
    }

    /// `done()` calls still expected; negative until the count is declared
    pub fn remaining(&self) -> i64 {
        self.base.remaining().unwrap_or_default()
    }

    /// The monitor to hand to each sub-operation
    pub fn monitor(&self) -> &RequestMonitor {
        &self.base
    }
}

impl Deref for CountingRequestMonitor {
    type Target = RequestMonitor;

    fn deref(&self) -> &RequestMonitor {
        &self.base
    }
}

impl AsRef<RequestMonitor> for CountingRequestMonitor {
    fn as_ref(&self) -> &RequestMonitor {
        &self.base
    }
}

impl Display for CountingRequestMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountingRequestMonitor({}, remaining {})", self.base.id(), self.remaining())
    }
}

impl Debug for CountingRequestMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingRequestMonitor")
            .field("monitor", &self.base)
            .field("remaining", &self.remaining())
            .finish()
    }
}
