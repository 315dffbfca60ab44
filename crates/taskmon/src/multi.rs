//! Fan-in that keeps the child monitors around for inspection

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::data::DataRequestMonitor;
use crate::executor::DispatcherRef;
use crate::monitor::{DefaultHandler, Handler, OnCompleted, RequestMonitor};
use crate::status::{codes, Status};

struct MultiState<M> {
    /// Children in insertion order, tagged with whether they finished
    children: Vec<(M, bool)>,
    pending: usize,
    requires_done_adding: bool,
    done_adding: bool,
    completed: bool,
    status: Status,
}

impl<M> MultiState<M> {
    fn ready(&self) -> bool {
        !self.completed && self.pending == 0 && (!self.requires_done_adding || self.done_adding)
    }
}

/// A monitor that completes once every registered child monitor is done.
///
/// Children are registered with [`add`](Self::add) and report back through
/// [`request_monitor_done`](Self::request_monitor_done), usually from their own
/// completion handler. [`new_child`](MultiRequestMonitor::new_child) wires both
/// steps up for plain monitors.
///
/// When children may finish on another thread while more are still being added,
/// call [`require_done_adding`](Self::require_done_adding) first and
/// [`done_adding`](Self::done_adding) after the last `add`; the monitor then does
/// not complete in between.
///
/// Adding after `done_adding()`, adding the same child twice and adding after
/// the monitor completed are contract violations and panic.
pub struct MultiRequestMonitor<M> {
    base: RequestMonitor,
    state: Arc<Mutex<MultiState<M>>>,
}

impl<M> MultiRequestMonitor<M>
where
    M: AsRef<RequestMonitor> + Clone + Send + 'static,
{
    /// Multi monitor that reports to `parent` when complete
    pub fn new(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>) -> Self {
        Self::with_handler(dispatcher, parent, DefaultHandler)
    }

    /// Multi monitor with a custom completion handler
    pub fn with_handler<H: Handler<RequestMonitor>>(
        dispatcher: &DispatcherRef,
        parent: Option<&RequestMonitor>,
        handler: H,
    ) -> Self {
        let base = RequestMonitor::with_handler(dispatcher, parent, handler);
        let state = Arc::new(Mutex::new(MultiState {
            children: Vec::new(),
            pending: 0,
            requires_done_adding: false,
            done_adding: false,
            completed: false,
            status: Status::multi(codes::OK, "Collective status for set of sub-operations."),
        }));

        // Canceling the aggregate cancels every child registered so far.
        let weak: Weak<Mutex<MultiState<M>>> = Arc::downgrade(&state);
        base.add_cancel_listener(move |_| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let children: Vec<M> = state
                .lock()
                .children
                .iter()
                .filter(|(_, done)| !done)
                .map(|(child, _)| child.clone())
                .collect();
            for child in children {
                child.as_ref().cancel();
            }
        });

        Self { base, state }
    }

    /// Create a multi monitor whose `handle_completed` is `f`
    pub fn on_completed<F>(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>, f: F) -> Self
    where
        F: FnMut(&RequestMonitor) + Send + 'static,
    {
        Self::with_handler(dispatcher, parent, OnCompleted(f))
    }

    /// Register `child` and return it.
    ///
    /// # Panics
    ///
    /// If `done_adding()` was already called, the child is already registered,
    /// or the multi monitor has completed.
    pub fn add(&self, child: M) -> M {
        let mut state = self.state.lock();
        assert!(
            !state.done_adding,
            "MultiRequestMonitor {}: add() called after done_adding()",
            self.base.id()
        );
        assert!(
            !state.completed,
            "MultiRequestMonitor {}: add() called after completion",
            self.base.id()
        );
        assert!(
            !state.children.iter().any(|(existing, _)| existing.as_ref() == child.as_ref()),
            "MultiRequestMonitor {}: {} added twice",
            self.base.id(),
            child.as_ref()
        );
        state.children.push((child.clone(), false));
        state.pending += 1;
        child
    }

    /// Hold completion back until [`done_adding`](Self::done_adding) is called
    pub fn require_done_adding(&self) {
        self.state.lock().requires_done_adding = true;
    }

    /// Declare that no more children will be added
    pub fn done_adding(&self) {
        let finished = {
            let mut state = self.state.lock();
            state.done_adding = true;
            state.requires_done_adding = true;
            state.ready()
        };
        if finished {
            self.finish();
        }
    }

    /// Record that `child` is done, merging its status.
    ///
    /// # Panics
    ///
    /// If `child` was never added, or was already reported done.
    pub fn request_monitor_done(&self, child: &M) {
        let canceled_on_its_own = child.as_ref().is_canceled() && !self.base.is_canceled();
        let finished = {
            let mut state = self.state.lock();
            let Some(entry) = state
                .children
                .iter_mut()
                .find(|(existing, _)| existing.as_ref() == child.as_ref())
            else {
                panic!(
                    "MultiRequestMonitor {}: {} is not a registered child",
                    self.base.id(),
                    child.as_ref()
                );
            };
            assert!(
                !entry.1,
                "MultiRequestMonitor {}: {} reported done twice",
                self.base.id(),
                child.as_ref()
            );
            entry.1 = true;
            state.pending -= 1;

            let status = child.as_ref().status();
            if canceled_on_its_own && status.is_cancel() {
                state.status.add(Status::error(
                    codes::INTERNAL_ERROR,
                    format!("Sub-request {} was canceled and not handled.", child.as_ref()),
                ));
            } else if !status.is_ok() {
                state.status.merge(status);
            }
            state.ready()
        };

        if finished {
            self.finish();
        }
    }

    /// Every child added so far, in insertion order
    pub fn request_monitors(&self) -> Vec<M> {
        self.state.lock().children.iter().map(|(child, _)| child.clone()).collect()
    }

    /// Whether `child` has been reported done; `false` for unknown children
    pub fn is_request_monitor_done(&self, child: &M) -> bool {
        self.state
            .lock()
            .children
            .iter()
            .find(|(existing, _)| existing.as_ref() == child.as_ref())
            .map(|(_, done)| *done)
            .unwrap_or(false)
    }

    /// Number of children not reported done yet
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// The underlying monitor, completed once every child is done
    pub fn monitor(&self) -> &RequestMonitor {
        &self.base
    }

    fn finish(&self) {
        let status = {
            let mut state = self.state.lock();
            if state.completed {
                return;
            }
            state.completed = true;
            state.status.clone()
        };
        debug!(monitor = %self.base.id(), status = %status.severity(), "All sub-requests done");
        if !status.is_ok() {
            self.base.set_status(status);
        }
        self.base.done();
    }
}

impl MultiRequestMonitor<RequestMonitor> {
    /// Create, register and return a child that reports back when done
    pub fn new_child(&self) -> RequestMonitor {
        let multi = self.clone();
        let child = RequestMonitor::on_completed(self.base.dispatcher(), None, move |rm| {
            multi.request_monitor_done(rm)
        });
        self.add(child)
    }
}

impl<V: Send + 'static> MultiRequestMonitor<DataRequestMonitor<V>> {
    /// Create, register and return a data child that reports back when done
    pub fn new_data_child(&self) -> DataRequestMonitor<V> {
        let multi = self.clone();
        let child = DataRequestMonitor::on_completed(self.base.dispatcher(), None, move |rm| {
            multi.request_monitor_done(rm)
        });
        self.add(child)
    }
}

impl<M> Clone for MultiRequestMonitor<M> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            state: self.state.clone(),
        }
    }
}

impl<M> Deref for MultiRequestMonitor<M> {
    type Target = RequestMonitor;

    fn deref(&self) -> &RequestMonitor {
        &self.base
    }
}

impl<M> AsRef<RequestMonitor> for MultiRequestMonitor<M> {
    fn as_ref(&self) -> &RequestMonitor {
        &self.base
    }
}

impl<M> Debug for MultiRequestMonitor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MultiRequestMonitor")
            .field("monitor", &self.base)
            .field("children", &state.children.len())
            .field("pending", &state.pending)
            .field("done_adding", &state.done_adding)
            .finish()
    }
}
