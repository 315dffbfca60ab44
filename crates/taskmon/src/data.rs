//! Completion token carrying a typed result

use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::{DispatcherRef, ImmediateExecutor};
use crate::monitor::{Completion, DefaultHandler, Handler, OnCompleted, OnSuccess, RequestMonitor};

/// A [`RequestMonitor`] plus an optional payload of type `V`.
///
/// The payload may be set any number of times before `done()` and is read by the
/// completion handlers afterwards. Dereferences to the underlying monitor, so
/// `done()`, `set_status()`, `cancel()` and friends are available directly.
pub struct DataRequestMonitor<V> {
    base: RequestMonitor,
    data: Arc<Mutex<Option<V>>>,
}

struct DataCompletion<V, H> {
    handler: H,
    data: Arc<Mutex<Option<V>>>,
}

impl<V, H> Completion for DataCompletion<V, H>
where
    V: Send + 'static,
    H: Handler<DataRequestMonitor<V>>,
{
    fn completed(self: Box<Self>, rm: &RequestMonitor) {
        let DataCompletion { mut handler, data } = *self;
        handler.handle_completed(&DataRequestMonitor { base: rm.clone(), data });
    }

    fn rejected(self: Box<Self>, rm: &RequestMonitor) {
        let DataCompletion { mut handler, data } = *self;
        handler.handle_rejected_execution(&DataRequestMonitor { base: rm.clone(), data });
    }
}

impl<V: Send + 'static> DataRequestMonitor<V> {
    /// Create a data monitor with the default handlers
    pub fn new(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>) -> Self {
        Self::with_handler(dispatcher, parent, DefaultHandler)
    }

    /// Create a data monitor with custom handlers
    pub fn with_handler<H: Handler<DataRequestMonitor<V>>>(
        dispatcher: &DispatcherRef,
        parent: Option<&RequestMonitor>,
        handler: H,
    ) -> Self {
        let data = Arc::new(Mutex::new(None));
        let completion = Box::new(DataCompletion {
            handler,
            data: data.clone(),
        });
        Self {
            base: RequestMonitor::build(dispatcher.clone(), parent, completion, false),
            data,
        }
    }

    /// Create a data monitor whose `handle_completed` is `f`
    pub fn on_completed<F>(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>, f: F) -> Self
    where
        F: FnMut(&DataRequestMonitor<V>) + Send + 'static,
    {
        Self::with_handler(dispatcher, parent, OnCompleted(f))
    }

    /// Create a data monitor whose `handle_success` is `f`
    pub fn on_success<F>(dispatcher: &DispatcherRef, parent: Option<&RequestMonitor>, f: F) -> Self
    where
        F: FnMut(&DataRequestMonitor<V>) + Send + 'static,
    {
        Self::with_handler(dispatcher, parent, OnSuccess(f))
    }

    /// Create a data monitor whose handlers run inline on the thread calling `done()`
    pub fn immediate(parent: Option<&RequestMonitor>) -> Self {
        Self::new(&ImmediateExecutor::shared(), parent)
    }

    /// Store the result without completing the monitor
    pub fn set_data(&self, data: V) {
        *self.data.lock() = Some(data);
    }

    /// Clear any payload set so far
    pub fn clear_data(&self) {
        *self.data.lock() = None;
    }

    /// Take the payload out, leaving `None`
    pub fn take_data(&self) -> Option<V> {
        self.data.lock().take()
    }

    /// Borrow the payload for the duration of `f`
    pub fn with_data<R>(&self, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.data.lock().as_ref())
    }

    /// Set the payload and complete the request
    pub fn done_with(&self, data: V) {
        self.set_data(data);
        self.base.done();
    }

    /// The underlying monitor, e.g. to pass as a parent
    pub fn monitor(&self) -> &RequestMonitor {
        &self.base
    }
}

impl<V: Clone> DataRequestMonitor<V> {
    /// A copy of the stored result
    pub fn data(&self) -> Option<V> {
        self.data.lock().clone()
    }
}

impl<V> Clone for DataRequestMonitor<V> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            data: self.data.clone(),
        }
    }
}

impl<V> Deref for DataRequestMonitor<V> {
    type Target = RequestMonitor;

    fn deref(&self) -> &RequestMonitor {
        &self.base
    }
}

impl<V> AsRef<RequestMonitor> for DataRequestMonitor<V> {
    fn as_ref(&self) -> &RequestMonitor {
        &self.base
    }
}

impl<V> PartialEq for DataRequestMonitor<V> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

impl<V> Eq for DataRequestMonitor<V> {}

impl<V: Debug> Debug for DataRequestMonitor<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRequestMonitor")
            .field("monitor", &self.base)
            .field("data", &*self.data.lock())
            .finish()
    }
}
