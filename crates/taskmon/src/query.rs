//! Blocking access to results computed on the dispatcher
//!
//! A [`Query`] wraps work that has to run on the dispatcher thread and lets any
//! other thread wait for its result with ordinary blocking calls.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::data::DataRequestMonitor;
use crate::error::{DispatchResult, QueryError, QueryResult};
use crate::executor::{DispatcherRef, ImmediateExecutor};
use crate::status::{codes, Status};

enum FutureState<V> {
    Pending,
    Done(Result<V, Status>),
    Cancelled,
}

/// One-shot result slot shared between the dispatcher and blocked waiters
pub(crate) struct FutureSync<V> {
    state: Mutex<FutureState<V>>,
    ready: Condvar,
}

impl<V: Clone> FutureSync<V> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FutureState::Pending),
            ready: Condvar::new(),
        }
    }

    /// Store the result; `false` if the slot was already completed or cancelled
    pub(crate) fn complete(&self, result: Result<V, Status>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, FutureState::Pending) {
            return false;
        }
        *state = FutureState::Done(result);
        self.ready.notify_all();
        true
    }

    /// Cancel a pending slot; `false` if a result was already stored
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            FutureState::Pending => {
                *state = FutureState::Cancelled;
                self.ready.notify_all();
                true
            }
            FutureState::Cancelled => true,
            FutureState::Done(_) => false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), FutureState::Pending)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(*self.state.lock(), FutureState::Cancelled)
    }

    /// Block until the slot is filled, or until `timeout` elapses
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> QueryResult<V> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock();
        loop {
            match &*state {
                FutureState::Done(Ok(value)) => return Ok(value.clone()),
                FutureState::Done(Err(status)) => return Err(QueryError::from_status(status.clone())),
                FutureState::Cancelled => return Err(QueryError::Cancelled),
                FutureState::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out()
                        && matches!(*state, FutureState::Pending)
                    {
                        return Err(QueryError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }
}

type Execute<V> = Box<dyn FnOnce(DataRequestMonitor<V>) + Send>;

struct QueryInner<V> {
    execute: Mutex<Option<Execute<V>>>,
    started: AtomicBool,
    future: FutureSync<V>,
    monitor: Mutex<Option<DataRequestMonitor<V>>>,
    dispatcher: Mutex<Option<DispatcherRef>>,
}

/// A computation run once on the dispatcher, awaited from any thread.
///
/// ```no_run
/// use taskmon::{DefaultDispatcher, DispatcherRef, Query};
///
/// let dispatcher: DispatcherRef = DefaultDispatcher::with_defaults().unwrap();
/// let query = Query::new(|rm| rm.done_with(42));
/// query.submit(&dispatcher).unwrap();
/// assert_eq!(query.get().unwrap(), 42);
/// ```
pub struct Query<V> {
    inner: Arc<QueryInner<V>>,
}

impl<V> Clone for Query<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Query<V>
where
    V: Clone + Send + 'static,
{
    /// Create a query; `execute` must complete the monitor it is given, with a
    /// value on success
    pub fn new<F>(execute: F) -> Self
    where
        F: FnOnce(DataRequestMonitor<V>) + Send + 'static,
    {
        Self {
            inner: Arc::new(QueryInner {
                execute: Mutex::new(Some(Box::new(execute))),
                started: AtomicBool::new(false),
                future: FutureSync::new(),
                monitor: Mutex::new(None),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Run the computation. Meant to run on the dispatcher.
    ///
    /// Only the first call does anything; a query cancelled before it ran never
    /// calls `execute`.
    pub fn run(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(execute) = self.inner.execute.lock().take() else {
            return;
        };
        if self.inner.future.is_cancelled() {
            debug!("Query cancelled before it ran");
            return;
        }

        let inner = self.inner.clone();
        let rm = DataRequestMonitor::on_completed(
            &ImmediateExecutor::shared(),
            None,
            move |rm: &DataRequestMonitor<V>| {
                let result = if rm.is_canceled() {
                    Err(Status::cancel("Query was cancelled."))
                } else if rm.is_success() {
                    rm.take_data().ok_or_else(|| {
                        Status::error(codes::REQUEST_FAILED, "Query completed without a result.")
                    })
                } else {
                    Err(rm.status())
                };
                if !inner.future.complete(result) {
                    debug!(monitor = %rm.id(), "Discarding query result that arrived after cancel");
                }
            },
        );
        *self.inner.monitor.lock() = Some(rm.clone());
        execute(rm);
    }

    /// Queue [`run`](Self::run) on `dispatcher`
    pub fn submit(&self, dispatcher: &DispatcherRef) -> DispatchResult<()> {
        *self.inner.dispatcher.lock() = Some(dispatcher.clone());
        let query = self.clone();
        dispatcher.submit(move || query.run())
    }

    /// Block until the result is available
    pub fn get(&self) -> QueryResult<V> {
        self.check_not_dispatcher()?;
        self.inner.future.wait(None)
    }

    /// Block until the result is available or `timeout` elapses
    pub fn get_timeout(&self, timeout: Duration) -> QueryResult<V> {
        self.check_not_dispatcher()?;
        self.inner.future.wait(Some(timeout))
    }

    /// Cancel the query. Returns `false` if the result was already there.
    ///
    /// Cancels the monitor handed to `execute` when the query is running.
    pub fn cancel(&self) -> bool {
        if !self.inner.future.cancel() {
            return false;
        }
        let running = self.inner.monitor.lock().clone();
        if let Some(rm) = running {
            rm.cancel();
        }
        true
    }

    /// Completed, failed or cancelled
    pub fn is_done(&self) -> bool {
        self.inner.future.is_done()
    }

    /// Whether the query ended through `cancel`
    pub fn is_cancelled(&self) -> bool {
        self.inner.future.is_cancelled()
    }

    fn check_not_dispatcher(&self) -> QueryResult<()> {
        if self.inner.future.is_done() {
            return Ok(());
        }
        let on_dispatcher = self
            .inner
            .dispatcher
            .lock()
            .as_ref()
            .map(|dispatcher| dispatcher.is_in_dispatch_thread())
            .unwrap_or(false);
        if on_dispatcher {
            return Err(QueryError::WouldDeadlock);
        }
        Ok(())
    }
}

impl<V> Debug for Query<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.future.state.lock() {
            FutureState::Pending => "pending",
            FutureState::Done(Ok(_)) => "done",
            FutureState::Done(Err(_)) => "failed",
            FutureState::Cancelled => "cancelled",
        };
        f.debug_struct("Query")
            .field("started", &self.inner.started.load(Ordering::Acquire))
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dispatcher, on_dispatcher, WAIT};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_result_returned_to_other_thread() {
        let (_raw, d) = dispatcher();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let query = Query::new(move |rm: DataRequestMonitor<i32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            rm.done_with(42);
        });
        query.submit(&d).unwrap();
        query.submit(&d).unwrap();

        let waiter = query.clone();
        let first = thread::spawn(move || waiter.get_timeout(WAIT)).join().unwrap();
        assert_eq!(first, Ok(42));
        assert_eq!(query.get(), Ok(42));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(query.is_done());
    }

    #[test]
    fn test_failure_status_surfaces() {
        let (_raw, d) = dispatcher();
        let query = Query::<String>::new(|rm| {
            rm.set_status(Status::error(codes::NOT_SUPPORTED, "no memory service"));
            rm.done();
        });
        query.submit(&d).unwrap();

        let error = query.get_timeout(WAIT).unwrap_err();
        assert_eq!(error.status().map(Status::code), Some(codes::NOT_SUPPORTED));
    }

    #[test]
    fn test_cancel_before_run_skips_execute() {
        let (_raw, d) = dispatcher();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let query = Query::<u8>::new(move |rm| {
            flag.store(true, Ordering::SeqCst);
            rm.done_with(1);
        });

        assert!(query.cancel());
        query.submit(&d).unwrap();
        let observer = query.clone();
        on_dispatcher(&d, move || observer.is_cancelled());

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(query.get(), Err(QueryError::Cancelled));
    }

    #[test]
    fn test_cancel_running_query_cancels_monitor() {
        let (_raw, d) = dispatcher();
        let parked = Arc::new(Mutex::new(None));
        let slot = parked.clone();
        let query = Query::<u8>::new(move |rm| *slot.lock() = Some(rm));
        query.submit(&d).unwrap();
        let observer = query.clone();
        on_dispatcher(&d, move || observer.is_done());

        assert!(query.cancel());
        let rm = parked.lock().clone().unwrap();
        assert!(rm.is_canceled());
        rm.done_with(5);
        assert_eq!(query.get(), Err(QueryError::Cancelled));
        assert!(query.cancel());
    }

    #[test]
    fn test_cancel_after_result_is_refused() {
        let query = Query::<u8>::new(|rm| rm.done_with(3));
        query.run();
        assert!(!query.cancel());
        assert_eq!(query.get(), Ok(3));
    }

    #[test]
    fn test_get_on_dispatcher_would_deadlock() {
        let (_raw, d) = dispatcher();
        let query = Query::<u8>::new(|_rm| {});
        *query.inner.dispatcher.lock() = Some(d.clone());

        let observer = query.clone();
        assert_eq!(on_dispatcher(&d, move || observer.get()), Err(QueryError::WouldDeadlock));
    }

    #[test]
    fn test_timeout() {
        let query = Query::<u8>::new(|_rm| {});
        query.run();
        let error = query.get_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(error.is_timeout());
    }
}
