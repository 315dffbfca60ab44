//! Completion tokens ("request monitors") and their default handler chain
//!
//! A [`RequestMonitor`] is created by the caller of an asynchronous operation and
//! handed to the operation, which calls [`RequestMonitor::done`] exactly once when
//! it finishes. `done()` schedules the monitor's [`Handler`] on the monitor's
//! dispatcher. The default handlers forward the outcome to the parent monitor, so
//! chains of derived requests report back without boilerplate:
//!
//! ```text
//! handle_completed
//!   ├─ success ──────────────> handle_success ──> parent.done()
//!   └─ handle_failure
//!        ├─ canceled ────────> handle_cancel  ──> parent.set_status(..); parent.done()
//!        ├─ error or worse ──> handle_error   ──> parent.set_status(..); parent.done()  (or log)
//!        └─ warning ─────────> handle_warning ──> parent.set_status(..); parent.done()  (or log)
//! ```

use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::executor::{DispatcherRef, ImmediateExecutor};
use crate::status::{codes, Status};

/// Unique identifier for a request monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorId(pub Uuid);

impl MonitorId {
    /// Generate a new unique monitor ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MonitorId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registration handle returned by [`RequestMonitor::add_cancel_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Callback invoked when a monitor is canceled before it is done
pub type CancelListener = Arc<dyn Fn(&RequestMonitor) + Send + Sync>;

/// Completion callbacks of a monitor.
///
/// Every hook has a default; override only the ones that matter. The `forward_*`
/// methods on [`RequestMonitor`] are the default behaviors, so an override can
/// still fall back to them.
pub trait Handler<M: AsRef<RequestMonitor> = RequestMonitor>: Send + 'static {
    /// Called on the dispatcher once the monitor is done
    fn handle_completed(&mut self, rm: &M) {
        if rm.as_ref().is_success() {
            self.handle_success(rm);
        } else {
            self.handle_failure(rm);
        }
    }

    fn handle_success(&mut self, rm: &M) {
        rm.as_ref().forward_success();
    }

    fn handle_failure(&mut self, rm: &M) {
        let monitor = rm.as_ref();
        if monitor.is_canceled() {
            self.handle_cancel(rm);
        } else if monitor.status().is_error() {
            self.handle_error(rm);
        } else {
            self.handle_warning(rm);
        }
    }

    fn handle_error(&mut self, rm: &M) {
        rm.as_ref().forward_failure();
    }

    fn handle_warning(&mut self, rm: &M) {
        rm.as_ref().forward_failure();
    }

    fn handle_cancel(&mut self, rm: &M) {
        rm.as_ref().forward_cancel();
    }

    /// Called instead of `handle_completed`, on the thread that called `done()`,
    /// when the dispatcher refused the completion job
    fn handle_rejected_execution(&mut self, rm: &M) {
        rm.as_ref().forward_rejected();
    }
}

/// Handler that keeps every default
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl<M: AsRef<RequestMonitor>> Handler<M> for DefaultHandler {}

/// Handler replacing `handle_completed` with a closure
pub struct OnCompleted<F>(pub F);

impl<M, F> Handler<M> for OnCompleted<F>
where
    M: AsRef<RequestMonitor>,
    F: FnMut(&M) + Send + 'static,
{
    fn handle_completed(&mut self, rm: &M) {
        (self.0)(rm)
    }
}

/// Handler replacing `handle_success` with a closure; failures keep forwarding
/// to the parent
pub struct OnSuccess<F>(pub F);

impl<M, F> Handler<M> for OnSuccess<F>
where
    M: AsRef<RequestMonitor>,
    F: FnMut(&M) + Send + 'static,
{
    fn handle_success(&mut self, rm: &M) {
        (self.0)(rm)
    }
}

/// Type-erased completion stored inside the monitor until `done()` runs it
pub(crate) trait Completion: Send {
    fn completed(self: Box<Self>, rm: &RequestMonitor);
    fn rejected(self: Box<Self>, rm: &RequestMonitor);
}

struct HandlerCompletion<H>(H);

impl<H: Handler<RequestMonitor>> Completion for HandlerCompletion<H> {
    fn completed(mut self: Box<Self>, rm: &RequestMonitor) {
        self.0.handle_completed(rm);
    }

    fn rejected(mut self: Box<Self>, rm: &RequestMonitor) {
        self.0.handle_rejected_execution(rm);
    }
}

pub(crate) fn boxed_handler<H: Handler<RequestMonitor>>(handler: H) -> Box<dyn Completion> {
    Box::new(HandlerCompletion(handler))
}

#[derive(Debug, Default)]
struct FanIn {
    remaining: i64,
    count_set: bool,
}

struct State {
    status: Status,
    canceled: bool,
    done: bool,
    /// `None` once the monitor is done
    listeners: Option<Vec<(ListenerId, CancelListener)>>,
    next_listener: u64,
    /// Our cancel listener registered on the parent
    parent_registration: Option<ListenerId>,
}

struct Inner {
    id: MonitorId,
    dispatcher: DispatcherRef,
    parent: Mutex<Option<RequestMonitor>>,
    state: Mutex<State>,
    completion: Mutex<Option<Box<dyn Completion>>>,
    fan_in: Option<Mutex<FanIn>>,
}

/// A one-shot, cancellable completion token.
///
/// Cloning yields another handle to the same token.
#[derive(Clone)]
pub struct RequestMonitor {
    inner: Arc<Inner>,
}

impl RequestMonitor {
    /// Create a monitor with the default handlers, completing on `dispatcher`
    pub fn new(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>) -> Self {
        Self::with_handler(dispatcher, parent, DefaultHandler)
    }

    /// Create a monitor with custom handlers
    pub fn with_handler<H: Handler<RequestMonitor>>(
        dispatcher: &DispatcherRef,
        parent: Option<&RequestMonitor>,
        handler: H,
    ) -> Self {
        Self::build(dispatcher.clone(), parent, boxed_handler(handler), false)
    }

    /// Create a monitor whose `handle_completed` is `f`
    pub fn on_completed<F>(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>, f: F) -> Self
    where
        F: FnMut(&RequestMonitor) + Send + 'static,
    {
        Self::with_handler(dispatcher, parent, OnCompleted(f))
    }

    /// Create a monitor whose `handle_success` is `f`
    pub fn on_success<F>(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>, f: F) -> Self
    where
        F: FnMut(&RequestMonitor) + Send + 'static,
    {
        Self::with_handler(dispatcher, parent, OnSuccess(f))
    }

    /// Create a monitor whose handlers run inline on the thread calling `done()`
    pub fn immediate(parent: Option<&RequestMonitor>) -> Self {
        Self::new(&ImmediateExecutor::shared(), parent)
    }

    pub(crate) fn build(
        dispatcher: DispatcherRef,
        parent: Option<&RequestMonitor>,
        completion: Box<dyn Completion>,
        counting: bool,
    ) -> Self {
        let (status, fan_in) = if counting {
            (
                Status::multi(codes::OK, "Collective status for set of sub-operations."),
                Some(Mutex::new(FanIn::default())),
            )
        } else {
            (Status::ok(), None)
        };

        let monitor = Self {
            inner: Arc::new(Inner {
                id: MonitorId::new(),
                dispatcher,
                parent: Mutex::new(parent.cloned()),
                state: Mutex::new(State {
                    status,
                    canceled: false,
                    done: false,
                    listeners: Some(Vec::new()),
                    next_listener: 0,
                    parent_registration: None,
                }),
                completion: Mutex::new(Some(completion)),
                fan_in,
            }),
        };

        if let Some(parent) = parent {
            // Weak so that a child that never completes does not keep itself alive
            // through its parent.
            let child: Weak<Inner> = Arc::downgrade(&monitor.inner);
            let registration = parent.add_cancel_listener(move |_| {
                if let Some(inner) = child.upgrade() {
                    RequestMonitor { inner }.cancel();
                }
            });
            monitor.inner.state.lock().parent_registration = Some(registration);
        }

        monitor
    }

    /// Unique id, used in log records
    pub fn id(&self) -> MonitorId {
        self.inner.id
    }

    /// The dispatcher the completion handlers run on
    pub fn dispatcher(&self) -> &DispatcherRef {
        &self.inner.dispatcher
    }

    /// The parent monitor; `None` once the completion handlers have returned
    pub fn parent(&self) -> Option<RequestMonitor> {
        self.inner.parent.lock().clone()
    }

    /// Current status; final once `done()` was called
    pub fn status(&self) -> Status {
        self.inner.state.lock().status.clone()
    }

    /// Replace the status, or merge into it for a counting monitor.
    ///
    /// Precondition: a cancel-severity status is only set on a monitor that is
    /// already canceled. This is checked in debug builds only.
    pub fn set_status(&self, status: Status) {
        debug_assert!(
            !status.is_cancel() || self.is_canceled(),
            "cancel status set on monitor {} that was not canceled",
            self.id()
        );
        let mut state = self.inner.state.lock();
        if self.inner.fan_in.is_some() {
            if !status.is_ok() {
                state.status.merge(status);
            }
        } else {
            state.status = status;
        }
    }

    /// `true` if this monitor or any ancestor was canceled
    pub fn is_canceled(&self) -> bool {
        if self.inner.state.lock().canceled {
            return true;
        }
        match self.parent() {
            Some(parent) => parent.is_canceled(),
            None => false,
        }
    }

    /// Not canceled and the status is at most informational
    pub fn is_success(&self) -> bool {
        !self.is_canceled() && self.status().is_success()
    }

    /// Whether `done()` was called
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// Request cancellation.
    ///
    /// Flips the canceled flag and synchronously runs the cancel listeners, outside
    /// of the monitor's lock. Repeated calls, and calls after `done()`, do nothing.
    /// The operation owning the monitor still has to call `done()`.
    pub fn cancel(&self) {
        let listeners: Vec<CancelListener> = {
            let mut state = self.inner.state.lock();
            if state.canceled || state.done {
                return;
            }
            state.canceled = true;
            state
                .listeners
                .as_ref()
                .map(|listeners| listeners.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        debug!(monitor = %self.id(), listeners = listeners.len(), "Request monitor canceled");
        for listener in listeners {
            listener(self);
        }
    }

    /// Register `listener` to run if the monitor is canceled before it is done
    pub fn add_cancel_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RequestMonitor) + Send + Sync + 'static,
    {
        let mut state = self.inner.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        if let Some(listeners) = state.listeners.as_mut() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Unregister a listener added with `add_cancel_listener`
    pub fn remove_cancel_listener(&self, id: ListenerId) {
        if let Some(listeners) = self.inner.state.lock().listeners.as_mut() {
            listeners.retain(|(existing, _)| *existing != id);
        }
    }

    /// Mark the request complete and schedule the completion handlers.
    ///
    /// # Panics
    ///
    /// Calling `done()` a second time is a broken caller contract and panics. On a
    /// counting monitor, `done()` counts one sub-operation instead and panics if
    /// more completions arrive than were declared.
    pub fn done(&self) {
        if let Some(fan_in) = &self.inner.fan_in {
            let finished = {
                let mut fan_in = fan_in.lock();
                fan_in.remaining -= 1;
                assert!(
                    !(fan_in.count_set && fan_in.remaining < 0),
                    "CountingRequestMonitor {}: more done() calls than the declared count",
                    self.id()
                );
                fan_in.count_set && fan_in.remaining == 0
            };
            if finished {
                self.complete();
            }
            return;
        }
        self.complete();
    }

    /// Declare how many `done()` calls finish a counting monitor
    pub(crate) fn declare_done_count(&self, count: usize) {
        let Some(fan_in) = &self.inner.fan_in else {
            panic!("RequestMonitor {}: not a counting monitor", self.id());
        };
        let finished = {
            let mut fan_in = fan_in.lock();
            assert!(
                !fan_in.count_set,
                "CountingRequestMonitor {}: set_done_count() called more than once",
                self.id()
            );
            fan_in.count_set = true;
            fan_in.remaining += count as i64;
            assert!(
                fan_in.remaining >= 0,
                "CountingRequestMonitor {}: more done() calls than the declared count",
                self.id()
            );
            fan_in.remaining == 0
        };
        if finished {
            self.complete();
        }
    }

    /// Outstanding `done()` calls of a counting monitor
    pub(crate) fn remaining(&self) -> Option<i64> {
        self.inner
            .fan_in
            .as_ref()
            .map(|fan_in| fan_in.lock().remaining)
    }

    fn complete(&self) {
        let registration = {
            let mut state = self.inner.state.lock();
            assert!(
                !state.done,
                "RequestMonitor {}: done() called more than once",
                self.id()
            );
            state.done = true;
            state.listeners = None;
            state.parent_registration.take()
        };

        if let (Some(parent), Some(registration)) = (self.parent(), registration) {
            parent.remove_cancel_listener(registration);
        }

        let monitor = self.clone();
        let submitted = self
            .inner
            .dispatcher
            .execute(Box::new(move || monitor.run_completion()));
        if submitted.is_err() {
            self.run_rejection();
        }
    }

    fn run_completion(&self) {
        let completion = self.inner.completion.lock().take();
        if let Some(completion) = completion {
            completion.completed(self);
        }
        // Release the parent link now that nothing can forward to it any more.
        self.inner.parent.lock().take();
    }

    fn run_rejection(&self) {
        let completion = self.inner.completion.lock().take();
        if let Some(completion) = completion {
            completion.rejected(self);
        }
        self.inner.parent.lock().take();
    }

    /// Default success behavior: complete the parent
    pub fn forward_success(&self) {
        if let Some(parent) = self.parent() {
            parent.done();
        }
    }

    /// Default error and warning behavior: pass the status to the parent and
    /// complete it, or log when there is no parent
    pub fn forward_failure(&self) {
        let status = self.status();
        match self.parent() {
            Some(parent) => {
                parent.set_status(status);
                parent.done();
            }
            None if status.is_error() => {
                error!(monitor = %self.id(), status = %status, "Request failed with no parent to report to");
            }
            None => {
                warn!(monitor = %self.id(), status = %status, "Request completed with a warning and no parent");
            }
        }
    }

    /// Default cancel behavior
    pub fn forward_cancel(&self) {
        let Some(parent) = self.parent() else {
            debug!(monitor = %self.id(), "Request canceled");
            return;
        };
        let status = self.status();
        if status.is_cancel() && !parent.is_canceled() {
            parent.set_status(Status::error(
                codes::INTERNAL_ERROR,
                format!("Sub-request {} was canceled and not handled.", self),
            ));
        } else {
            parent.set_status(status);
        }
        parent.done();
    }

    /// Default behavior when the dispatcher refused the completion
    pub fn forward_rejected(&self) {
        let mut status = Status::multi(
            codes::INTERNAL_ERROR,
            format!("Request for monitor {} resulted in a rejected execution.", self),
        );
        status.add(Status::error(codes::INTERNAL_ERROR, "Dispatcher rejected the completion."));
        let own = self.status();
        if !own.is_ok() {
            status.merge(own);
        }

        match self.parent() {
            Some(parent) => {
                parent.set_status(status);
                parent.done();
            }
            None => error!(monitor = %self.id(), status = %status, "Completion rejected by the dispatcher"),
        }
    }
}

impl AsRef<RequestMonitor> for RequestMonitor {
    fn as_ref(&self) -> &RequestMonitor {
        self
    }
}

impl PartialEq for RequestMonitor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RequestMonitor {}

impl Hash for RequestMonitor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Display for RequestMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestMonitor({})", self.inner.id)
    }
}

impl Debug for RequestMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestMonitor")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("canceled", &state.canceled)
            .field("done", &state.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Dispatcher;
    use crate::status::Severity;
    use crate::test_support::{dispatcher, drain, WAIT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_monitor_id_generation() {
        assert_ne!(MonitorId::new(), MonitorId::new());
    }

    #[test]
    fn test_completion_runs_on_dispatcher() {
        let (raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();

        let observer = raw.clone();
        let rm = RequestMonitor::on_completed(&d, None, move |rm| {
            tx.send((rm.is_success(), observer.is_in_dispatch_thread())).unwrap();
        });
        rm.done();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (true, true));
    }

    #[test]
    #[should_panic(expected = "done() called more than once")]
    fn test_double_done_panics() {
        let rm = RequestMonitor::immediate(None);
        rm.done();
        rm.done();
    }

    #[test]
    fn test_success_forwards_to_parent() {
        let (_raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();

        let parent = RequestMonitor::on_completed(&d, None, move |rm| tx.send(rm.status()).unwrap());
        let child = RequestMonitor::new(&d, Some(&parent));
        let grandchild = RequestMonitor::new(&d, Some(&child));
        grandchild.done();

        assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
        assert!(child.is_done());
    }

    #[test]
    fn test_error_forwards_status_to_parent() {
        let (_raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();

        let parent = RequestMonitor::on_completed(&d, None, move |rm| tx.send(rm.status()).unwrap());
        let child = RequestMonitor::on_success(&d, Some(&parent), |_| panic!("not a success"));
        child.set_status(Status::error(codes::TARGET_ERROR, "target gone"));
        child.done();

        let status = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(status.severity(), Severity::Error);
        assert_eq!(status.code(), codes::TARGET_ERROR);
    }

    #[test]
    fn test_warning_reaches_warning_handler() {
        struct Recorder(mpsc::Sender<&'static str>);
        impl Handler for Recorder {
            fn handle_warning(&mut self, _rm: &RequestMonitor) {
                self.0.send("warning").unwrap();
            }
            fn handle_error(&mut self, _rm: &RequestMonitor) {
                self.0.send("error").unwrap();
            }
        }

        let (_raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        let rm = RequestMonitor::with_handler(&d, None, Recorder(tx.clone()));
        rm.set_status(Status::warning(codes::REQUEST_FAILED, "partial"));
        rm.done();
        let rm = RequestMonitor::with_handler(&d, None, Recorder(tx));
        rm.set_status(Status::error(codes::REQUEST_FAILED, "failed"));
        rm.done();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "warning");
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), "error");
    }

    #[test]
    fn test_cancel_runs_listeners_once() {
        let rm = RequestMonitor::immediate(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rm.add_cancel_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rm.cancel();
        rm.cancel();
        assert!(rm.is_canceled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_after_done_is_noop() {
        let (_raw, d) = dispatcher();
        let rm = RequestMonitor::new(&d, None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        rm.add_cancel_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        rm.done();
        rm.cancel();
        drain(&d);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!rm.is_canceled());
    }

    #[test]
    fn test_removed_listener_not_called() {
        let rm = RequestMonitor::immediate(None);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = rm.add_cancel_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        rm.remove_cancel_listener(id);
        rm.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parent_cancel_propagates_to_child_listeners() {
        let (_raw, d) = dispatcher();
        let parent = RequestMonitor::new(&d, None);
        let child = RequestMonitor::new(&d, Some(&parent));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        child.add_cancel_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!child.is_canceled());
        parent.cancel();
        assert!(child.is_canceled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_done_detaches_from_parent() {
        let (_raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        let parent = RequestMonitor::on_completed(&d, None, move |_| tx.send(()).unwrap());
        let child = RequestMonitor::on_completed(&d, Some(&parent), |_| {});
        child.done();
        drain(&d);

        // The child's registration is gone and the parent link released.
        assert!(child.parent().is_none());
        parent.cancel();
        assert!(!child.is_canceled());
        parent.done();
        rx.recv_timeout(WAIT).unwrap();
    }

    #[test]
    fn test_canceled_child_reports_to_parent() {
        let (_raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        let parent = RequestMonitor::on_completed(&d, None, move |rm| {
            tx.send((rm.is_canceled(), rm.status())).unwrap()
        });
        let child = RequestMonitor::new(&d, Some(&parent));
        child.cancel();
        child.set_status(Status::cancel("stopped"));
        child.done();

        let (canceled, status) = rx.recv_timeout(WAIT).unwrap();
        assert!(!canceled);
        assert_eq!(status.code(), codes::INTERNAL_ERROR);
    }

    #[test]
    fn test_rejected_execution_notifies_parent() {
        let (raw, d) = dispatcher();
        let (tx, rx) = mpsc::channel();
        let parent = RequestMonitor::with_handler(
            &ImmediateExecutor::shared(),
            None,
            OnCompleted(move |rm: &RequestMonitor| tx.send(rm.status()).unwrap()),
        );
        let child = RequestMonitor::new(&d, Some(&parent));
        raw.shutdown();
        child.done();

        let status = rx.recv_timeout(WAIT).unwrap();
        assert!(status.is_error());
        assert_eq!(status.code(), codes::INTERNAL_ERROR);
    }
}
