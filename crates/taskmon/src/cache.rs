//! Single-flight asynchronous value cache
//!
//! A cache starts out invalid. The first request while invalid starts exactly one
//! fetch through the retriever; every further request joins the waiter set of that
//! fetch. When the fetch completes, the cache becomes valid and all waiters see the
//! same data and status. Canceling one waiter completes it with a cancel status;
//! once every waiter is canceled, the fetch itself is canceled.

use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::data::DataRequestMonitor;
use crate::executor::{DispatcherRef, ImmediateInDispatcher};
use crate::monitor::RequestMonitor;
use crate::status::{codes, Status};

/// Anything a transaction can wait on
pub trait Validatable: Send + Sync {
    fn is_valid(&self) -> bool;

    /// The status of the last fetch (possibly stale while invalid)
    fn status(&self) -> Status;

    /// Complete `rm` once the cache is valid, starting a fetch if none is in
    /// flight. A failed fetch is reported through `rm`'s status.
    fn wait(&self, rm: RequestMonitor);
}

/// A validatable cache holding one value of type `V`
pub trait Cache<V>: Validatable {
    /// The cached value; meaningful only while valid
    fn data(&self) -> Option<V>;

    /// Complete `rm` with the cached value and status, fetching first if needed
    fn request(&self, rm: DataRequestMonitor<V>);
}

/// Fetch function of a [`RequestCache`]. It must complete the monitor exactly
/// once; it may observe cancellation of the monitor.
pub type Retriever<V> = Arc<dyn Fn(DataRequestMonitor<V>) + Send + Sync>;

struct CacheState<V> {
    valid: bool,
    disabled: bool,
    data: Option<V>,
    status: Status,
    waiters: Vec<RequestMonitor>,
    in_flight: Option<DataRequestMonitor<V>>,
}

struct CacheInner<V> {
    name: String,
    dispatcher: DispatcherRef,
    retriever: Retriever<V>,
    state: Mutex<CacheState<V>>,
}

/// Single-slot cache filled by a retriever.
///
/// All methods except the read-only accessors must be called on the dispatcher
/// thread. Cloning yields another handle to the same cache.
pub struct RequestCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for RequestCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> RequestCache<V>
where
    V: Clone + Send + 'static,
{
    /// Create an unnamed cache fetching through `retriever`
    pub fn new<F>(dispatcher: &DispatcherRef, retriever: F) -> Self
    where
        F: Fn(DataRequestMonitor<V>) + Send + Sync + 'static,
    {
        Self::named("cache", dispatcher, retriever)
    }

    /// Create a cache with a name used in log records
    pub fn named<S, F>(name: S, dispatcher: &DispatcherRef, retriever: F) -> Self
    where
        S: Into<String>,
        F: Fn(DataRequestMonitor<V>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                dispatcher: dispatcher.clone(),
                retriever: Arc::new(retriever),
                state: Mutex::new(CacheState {
                    valid: false,
                    disabled: false,
                    data: None,
                    status: Status::ok(),
                    waiters: Vec::new(),
                    in_flight: None,
                }),
            }),
        }
    }

    /// Name used in log records
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The dispatcher fetches and waiter completions run on
    pub fn dispatcher(&self) -> &DispatcherRef {
        &self.inner.dispatcher
    }

    /// Whether a fetch is in progress
    pub fn is_fetching(&self) -> bool {
        self.inner.state.lock().in_flight.is_some()
    }

    /// Whether the cache was frozen with [`disable`](Self::disable)
    pub fn is_disabled(&self) -> bool {
        self.inner.state.lock().disabled
    }

    /// Number of monitors waiting on the current fetch
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Make the cache valid with `data` and `status`, completing every waiter.
    ///
    /// An in-flight fetch is canceled and its result discarded. Ignored while the
    /// cache is disabled.
    pub fn set(&self, data: Option<V>, status: Status) {
        self.assert_dispatch();
        if self.inner.state.lock().disabled {
            debug!(cache = %self.inner.name, "Ignoring set() on a disabled cache");
            return;
        }
        self.complete_with(data, status, false);
    }

    /// Invalidate the cache, dropping the data and any in-flight fetch
    pub fn reset(&self) {
        self.reset_to(None, Status::ok());
    }

    /// Invalidate the cache but keep `data` and `status` as the stale values.
    ///
    /// Also lifts a [`disable`](Self::disable). Monitors still waiting trigger a
    /// fresh fetch.
    pub fn reset_to(&self, data: Option<V>, status: Status) {
        self.assert_dispatch();
        let (stale, restart) = {
            let mut state = self.inner.state.lock();
            state.valid = false;
            state.disabled = false;
            state.data = data;
            state.status = status;
            (state.in_flight.take(), !state.waiters.is_empty())
        };
        if let Some(fetch) = stale {
            fetch.cancel();
        }
        if restart {
            self.start_fetch();
        }
    }

    /// Freeze the cache at a terminal value.
    ///
    /// Every request is answered immediately with `status` and no data, without
    /// fetching, until [`reset`](Self::reset) is called.
    pub fn disable(&self, status: Status) {
        self.assert_dispatch();
        self.complete_with(None, status, true);
    }

    fn assert_dispatch(&self) {
        debug_assert!(
            self.inner.dispatcher.is_in_dispatch_thread(),
            "cache {} used off the dispatcher thread",
            self.inner.name
        );
    }

    fn complete_with(&self, data: Option<V>, status: Status, disable: bool) {
        let (waiters, stale) = {
            let mut state = self.inner.state.lock();
            state.valid = true;
            state.disabled = disable;
            state.data = data;
            state.status = status.clone();
            (std::mem::take(&mut state.waiters), state.in_flight.take())
        };
        if let Some(fetch) = stale {
            fetch.cancel();
        }
        for waiter in waiters {
            Self::complete_waiter(&waiter, &status);
        }
    }

    fn complete_waiter(waiter: &RequestMonitor, status: &Status) {
        if !status.is_ok() {
            waiter.set_status(status.clone());
        }
        waiter.done();
    }

    fn start_fetch(&self) {
        let cache = self.clone();
        let fetch = DataRequestMonitor::on_completed(
            &ImmediateInDispatcher::wrap(self.inner.dispatcher.clone()),
            None,
            move |rm: &DataRequestMonitor<V>| cache.fetch_done(rm),
        );
        self.inner.state.lock().in_flight = Some(fetch.clone());
        debug!(cache = %self.inner.name, "Fetching");
        (self.inner.retriever)(fetch);
    }

    fn fetch_done(&self, fetch: &DataRequestMonitor<V>) {
        let (waiters, status) = {
            let mut state = self.inner.state.lock();
            if state.in_flight.as_ref() != Some(fetch) {
                // Superseded by set(), reset() or disable().
                return;
            }
            state.in_flight = None;

            if fetch.is_canceled() {
                debug!(cache = %self.inner.name, "Fetch canceled, cache stays invalid");
                let status = Status::error(codes::REQUEST_FAILED, "Cache fetch was canceled.");
                (std::mem::take(&mut state.waiters), status)
            } else {
                state.valid = true;
                state.data = fetch.data();
                state.status = fetch.status();
                (std::mem::take(&mut state.waiters), state.status.clone())
            }
        };

        for waiter in waiters {
            Self::complete_waiter(&waiter, &status);
        }
    }

    /// A waiter was canceled: complete every canceled waiter and cancel the
    /// fetch once nobody is left waiting for it.
    fn waiters_canceled(&self) {
        let (canceled, fetch) = {
            let mut state = self.inner.state.lock();
            let (canceled, remaining): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.waiters).into_iter().partition(|rm| rm.is_canceled());
            state.waiters = remaining;
            let fetch = if state.waiters.is_empty() && !canceled.is_empty() {
                state.in_flight.clone()
            } else {
                None
            };
            (canceled, fetch)
        };

        for waiter in canceled {
            waiter.set_status(Status::cancel("Waiting for the cache was canceled."));
            waiter.done();
        }
        if let Some(fetch) = fetch {
            debug!(cache = %self.inner.name, "Every waiter canceled, canceling fetch");
            fetch.cancel();
        }
    }
}

impl<V> Validatable for RequestCache<V>
where
    V: Clone + Send + 'static,
{
    fn is_valid(&self) -> bool {
        self.inner.state.lock().valid
    }

    fn status(&self) -> Status {
        self.inner.state.lock().status.clone()
    }

    fn wait(&self, rm: RequestMonitor) {
        self.assert_dispatch();
        let start = {
            let mut state = self.inner.state.lock();
            if state.valid {
                let status = state.status.clone();
                drop(state);
                Self::complete_waiter(&rm, &status);
                return;
            }
            state.waiters.push(rm.clone());
            // A fetch canceled by its last waiter is not joined by new waiters.
            match &state.in_flight {
                Some(fetch) => fetch.is_canceled(),
                None => true,
            }
        };

        let cache = self.clone();
        let canceled_already = rm.is_canceled();
        rm.add_cancel_listener(move |_| {
            let dispatcher = cache.inner.dispatcher.clone();
            let cache = cache.clone();
            // The listener may fire on any thread; the waiter set is only
            // touched on the dispatcher.
            if dispatcher.submit(move || cache.waiters_canceled()).is_err() {
                debug!("Dispatcher gone, dropping waiter cancellation");
            }
        });

        if canceled_already {
            self.waiters_canceled();
        } else if start {
            self.start_fetch();
        }
    }
}

impl<V> Cache<V> for RequestCache<V>
where
    V: Clone + Send + 'static,
{
    fn data(&self) -> Option<V> {
        self.inner.state.lock().data.clone()
    }

    fn request(&self, rm: DataRequestMonitor<V>) {
        let cache = self.clone();
        let target = rm.clone();
        let waiter = RequestMonitor::on_completed(
            &ImmediateInDispatcher::wrap(self.inner.dispatcher.clone()),
            Some(rm.monitor()),
            move |waiter| {
                if !waiter.is_canceled() {
                    if let Some(data) = cache.data() {
                        target.set_data(data);
                    }
                }
                let status = waiter.status();
                if !status.is_ok() {
                    target.set_status(status);
                }
                target.done();
            },
        );
        self.wait(waiter);
    }
}

impl<V: Debug> Debug for RequestCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestCache")
            .field("name", &self.inner.name)
            .field("valid", &state.valid)
            .field("disabled", &state.disabled)
            .field("data", &state.data)
            .field("status", &state.status)
            .field("waiters", &state.waiters.len())
            .field("fetching", &state.in_flight.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{dispatcher, drain, on_dispatcher, WAIT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    /// Cache whose retriever parks the fetch monitor so the test decides when it
    /// completes
    fn parked_cache(d: &DispatcherRef) -> (RequestCache<i32>, Arc<Mutex<Vec<DataRequestMonitor<i32>>>>) {
        let parked = Arc::new(Mutex::new(Vec::new()));
        let sink = parked.clone();
        let cache = RequestCache::named("parked", d, move |rm| sink.lock().push(rm));
        (cache, parked)
    }

    fn request_into(
        d: &DispatcherRef,
        cache: &RequestCache<i32>,
        tx: mpsc::Sender<(Option<i32>, Status)>,
    ) -> DataRequestMonitor<i32> {
        let rm = DataRequestMonitor::on_completed(d, None, move |rm: &DataRequestMonitor<i32>| {
            tx.send((rm.data(), rm.status())).unwrap()
        });
        cache.request(rm.clone());
        rm
    }

    #[test]
    fn test_concurrent_requests_share_one_fetch() {
        let (_raw, d) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let retrieve_on = d.clone();
        let cache = RequestCache::new(&d, move |rm: DataRequestMonitor<i32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            // Complete asynchronously, after every request has joined.
            retrieve_on.submit(move || rm.done_with(42)).unwrap();
        });
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            for _ in 0..5 {
                request_into(&requester, &shared, tx.clone());
            }
        });

        for _ in 0..5 {
            let (data, status) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(data, Some(42));
            assert!(status.is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_valid());

        // Valid now: served without a new fetch.
        let (tx, rx) = mpsc::channel();
        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            request_into(&requester, &shared, tx);
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_fetch_reaches_every_waiter() {
        let (_raw, d) = dispatcher();
        let cache = RequestCache::new(&d, |rm: DataRequestMonitor<i32>| {
            rm.set_status(Status::error(codes::TARGET_ERROR, "no target"));
            rm.done();
        });
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            request_into(&requester, &shared, tx.clone());
            request_into(&requester, &shared, tx);
        });

        for _ in 0..2 {
            let (data, status) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(data, None);
            assert_eq!(status.code(), codes::TARGET_ERROR);
        }
        assert!(cache.is_valid());
        assert_eq!(cache.status().code(), codes::TARGET_ERROR);
    }

    #[test]
    fn test_cancel_one_waiter_keeps_fetch() {
        let (_raw, d) = dispatcher();
        let (cache, parked) = parked_cache(&d);
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        let (first, _second) = on_dispatcher(&d, move || {
            (
                request_into(&requester, &shared, tx.clone()),
                request_into(&requester, &shared, tx),
            )
        });

        first.cancel();
        let (_, status) = rx.recv_timeout(WAIT).unwrap();
        assert!(status.is_cancel());
        assert!(!parked.lock()[0].is_canceled());

        let fetch = parked.lock()[0].clone();
        d.submit(move || fetch.done_with(7)).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, Some(7));
    }

    #[test]
    fn test_cancel_all_waiters_cancels_fetch() {
        let (_raw, d) = dispatcher();
        let (cache, parked) = parked_cache(&d);
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        let (first, second) = on_dispatcher(&d, move || {
            (
                request_into(&requester, &shared, tx.clone()),
                request_into(&requester, &shared, tx),
            )
        });
        first.cancel();
        second.cancel();
        for _ in 0..2 {
            assert!(rx.recv_timeout(WAIT).unwrap().1.is_cancel());
        }
        drain(&d);

        let fetch = parked.lock()[0].clone();
        assert!(fetch.is_canceled());
        on_dispatcher(&d, move || {
            fetch.set_status(Status::cancel("stopped"));
            fetch.done();
        });
        assert!(!cache.is_valid());

        // The next request starts a fresh fetch.
        let (tx, _rx) = mpsc::channel();
        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            request_into(&requester, &shared, tx);
        });
        assert_eq!(parked.lock().len(), 2);
    }

    #[test]
    fn test_set_completes_waiters_and_discards_fetch() {
        let (_raw, d) = dispatcher();
        let (cache, parked) = parked_cache(&d);
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            request_into(&requester, &shared, tx);
            shared.set(Some(3), Status::ok());
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, Some(3));

        let fetch = parked.lock()[0].clone();
        assert!(fetch.is_canceled());
        on_dispatcher(&d, move || fetch.done_with(99));
        assert_eq!(cache.data(), Some(3));
    }

    #[test]
    fn test_reset_refetches() {
        let (_raw, d) = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = RequestCache::new(&d, move |rm: DataRequestMonitor<usize>| {
            rm.done_with(counter.fetch_add(1, Ordering::SeqCst));
        });

        let shared = cache.clone();
        let (tx, rx) = mpsc::channel();
        let requester = d.clone();
        on_dispatcher(&d, move || {
            let tx2 = tx.clone();
            shared.request(DataRequestMonitor::on_success(&requester, None, move |rm: &DataRequestMonitor<usize>| {
                tx.send(rm.data()).unwrap()
            }));
            shared.reset();
            assert!(!shared.is_valid());
            shared.request(DataRequestMonitor::on_success(&requester, None, move |rm: &DataRequestMonitor<usize>| {
                tx2.send(rm.data()).unwrap()
            }));
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(0));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_to_keeps_stale_value_and_refetches_for_waiters() {
        let (_raw, d) = dispatcher();
        let (cache, parked) = parked_cache(&d);
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            request_into(&requester, &shared, tx);
            shared.reset_to(Some(5), Status::warning(codes::REQUEST_FAILED, "stale"));
        });

        assert_eq!(parked.lock().len(), 2);
        assert!(!cache.is_valid());
        assert!(cache.is_fetching());
        assert_eq!(cache.data(), Some(5));
        assert_eq!(cache.status().code(), codes::REQUEST_FAILED);

        let (first, second) = {
            let parked = parked.lock();
            (parked[0].clone(), parked[1].clone())
        };
        assert!(first.is_canceled());
        assert!(!second.is_canceled());

        on_dispatcher(&d, move || first.done_with(1));
        assert!(rx.try_recv().is_err());
        assert!(!cache.is_valid());

        on_dispatcher(&d, move || second.done_with(9));
        let (data, status) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data, Some(9));
        assert!(status.is_ok());
        assert_eq!(parked.lock().len(), 2);
    }

    #[test]
    fn test_reset_to_lifts_disable() {
        let (_raw, d) = dispatcher();
        let (cache, parked) = parked_cache(&d);
        let (tx, _rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            shared.disable(Status::error(codes::INVALID_STATE, "target running"));
            shared.reset_to(Some(2), Status::ok());
            assert!(!shared.is_disabled());
            assert!(!shared.is_fetching());
            request_into(&requester, &shared, tx);
        });

        assert_eq!(parked.lock().len(), 1);
        assert_eq!(cache.data(), Some(2));
    }

    #[test]
    fn test_disabled_cache_answers_without_fetching() {
        let (_raw, d) = dispatcher();
        let (cache, parked) = parked_cache(&d);
        let (tx, rx) = mpsc::channel();

        let (requester, shared) = (d.clone(), cache.clone());
        on_dispatcher(&d, move || {
            shared.disable(Status::error(codes::INVALID_STATE, "target running"));
            shared.set(Some(1), Status::ok());
            request_into(&requester, &shared, tx);
        });

        let (data, status) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data, None);
        assert_eq!(status.code(), codes::INVALID_STATE);
        assert!(cache.is_disabled());
        assert!(parked.lock().is_empty());

        let shared = cache.clone();
        on_dispatcher(&d, move || shared.reset());
        assert!(!cache.is_disabled());
    }
}
