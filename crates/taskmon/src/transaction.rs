//! Straight-line reads over several asynchronous caches
//!
//! A [`Transaction`] reads caches as if they were plain values. Before reading, it
//! calls [`TxContext::validate`]; if any cache is not valid yet, `validate` starts
//! the missing fetches and returns [`TxError::Retry`], which the transaction
//! propagates with `?`. Once every fetch completed, `process` runs again from the
//! top. `process` must therefore be free of side effects until it returns a value.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{Cache, Validatable};
use crate::counting::CountingRequestMonitor;
use crate::data::DataRequestMonitor;
use crate::executor::DispatcherRef;
use crate::monitor::RequestMonitor;
use crate::status::{codes, Status};

/// Why a transaction attempt did not produce a value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    /// Some cache is not valid yet; the attempt is re-run once it is
    Retry,

    /// A cache holds a failed status; the transaction completes with it
    Failed(Status),
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Retry => f.write_str("retry once the caches are valid"),
            TxError::Failed(status) => write!(f, "transaction failed: {}", status),
        }
    }
}

impl From<Status> for TxError {
    fn from(status: Status) -> Self {
        TxError::Failed(status)
    }
}

/// Result of one transaction attempt
pub type TxResult<V> = Result<V, TxError>;

/// Logic run by [`request`], possibly several times
pub trait Transaction<V>: Send + 'static {
    fn process(&mut self, tx: &mut TxContext) -> TxResult<V>;
}

impl<V, F> Transaction<V> for F
where
    F: FnMut(&mut TxContext) -> TxResult<V> + Send + 'static,
{
    fn process(&mut self, tx: &mut TxContext) -> TxResult<V> {
        self(tx)
    }
}

/// Caches the current attempt is waiting for
struct PendingWaits {
    fan_in: CountingRequestMonitor,
    count: usize,
}

type Resume = Arc<dyn Fn() + Send + Sync>;

/// Handed to [`Transaction::process`] on every attempt
pub struct TxContext {
    dispatcher: DispatcherRef,
    monitor: RequestMonitor,
    resume: Resume,
    pending: Option<PendingWaits>,
    attempt: usize,
}

impl TxContext {
    /// Zero-based number of the current attempt
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Check that every cache is valid and successful.
    ///
    /// Invalid caches all start fetching at once, and the transaction is retried
    /// only after all of them completed. A valid cache holding a non-OK status
    /// fails the transaction with that status.
    pub fn validate(&mut self, caches: &[&dyn Validatable]) -> TxResult<()> {
        let mut invalid = Vec::new();
        for cache in caches {
            if !cache.is_valid() {
                invalid.push(*cache);
                continue;
            }
            let status = cache.status();
            if !status.is_ok() {
                return Err(TxError::Failed(status));
            }
        }

        if invalid.is_empty() {
            return Ok(());
        }

        // Child of the transaction's monitor, so canceling the transaction
        // cancels the waits.
        let (dispatcher, monitor, resume) = (&self.dispatcher, &self.monitor, &self.resume);
        let pending = self.pending.get_or_insert_with(|| {
            let resume = resume.clone();
            PendingWaits {
                fan_in: CountingRequestMonitor::on_completed(dispatcher, Some(monitor), move |_| resume()),
                count: 0,
            }
        });
        for cache in invalid {
            pending.count += 1;
            cache.wait(RequestMonitor::new(dispatcher, Some(pending.fan_in.monitor())));
        }
        Err(TxError::Retry)
    }

    /// Validate a single cache and return its data
    pub fn read<V, C>(&mut self, cache: &C) -> TxResult<Option<V>>
    where
        C: Cache<V>,
    {
        self.validate(&[cache])?;
        Ok(cache.data())
    }
}

struct Driver<V, T> {
    dispatcher: DispatcherRef,
    rm: DataRequestMonitor<V>,
    transaction: Mutex<T>,
    attempts: AtomicUsize,
}

/// Run `transaction` until it produces a value or fails, completing `rm`.
///
/// Must be called on the dispatcher thread. Retries are posted to the
/// dispatcher, never run re-entrantly.
pub fn request<V, T>(dispatcher: &DispatcherRef, transaction: T, rm: DataRequestMonitor<V>)
where
    V: Send + 'static,
    T: Transaction<V>,
{
    debug_assert!(
        dispatcher.is_in_dispatch_thread(),
        "transaction started off the dispatcher thread"
    );
    attempt(Arc::new(Driver {
        dispatcher: dispatcher.clone(),
        rm,
        transaction: Mutex::new(transaction),
        attempts: AtomicUsize::new(0),
    }));
}

fn attempt<V, T>(driver: Arc<Driver<V, T>>)
where
    V: Send + 'static,
    T: Transaction<V>,
{
    let rm = &driver.rm;
    if rm.is_canceled() {
        rm.set_status(Status::cancel("Transaction canceled."));
        rm.done();
        return;
    }

    let retry = driver.clone();
    let mut tx = TxContext {
        dispatcher: driver.dispatcher.clone(),
        monitor: rm.monitor().clone(),
        resume: Arc::new(move || attempt(retry.clone())),
        pending: None,
        attempt: driver.attempts.fetch_add(1, Ordering::Relaxed),
    };
    let result = driver.transaction.lock().process(&mut tx);

    match result {
        Ok(value) => rm.done_with(value),
        Err(TxError::Failed(status)) => {
            debug!(monitor = %rm.id(), attempt = tx.attempt, status = %status, "Transaction failed");
            rm.set_status(status);
            rm.done();
        }
        Err(TxError::Retry) => match tx.pending.take() {
            Some(pending) => {
                debug!(monitor = %rm.id(), attempt = tx.attempt, waits = pending.count, "Transaction waiting on caches");
                pending.fan_in.set_done_count(pending.count);
            }
            None => {
                rm.set_status(Status::error(
                    codes::INTERNAL_ERROR,
                    "Transaction asked for a retry without waiting on any cache.",
                ));
                rm.done();
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RequestCache;
    use crate::test_support::{dispatcher, on_dispatcher, WAIT};
    use std::sync::mpsc;

    /// Cache completing its fetch in a later dispatcher job, counting fetches
    fn counted_cache(d: &DispatcherRef, value: i64) -> (RequestCache<i64>, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        let counter = fetches.clone();
        let later = d.clone();
        let cache = RequestCache::new(d, move |rm: DataRequestMonitor<i64>| {
            counter.fetch_add(1, Ordering::SeqCst);
            later.submit(move || rm.done_with(value)).unwrap();
        });
        (cache, fetches)
    }

    fn result_monitor(d: &DispatcherRef) -> (DataRequestMonitor<i64>, mpsc::Receiver<(Option<i64>, Status)>) {
        let (tx, rx) = mpsc::channel();
        let rm = DataRequestMonitor::on_completed(d, None, move |rm: &DataRequestMonitor<i64>| {
            tx.send((rm.data(), rm.status())).unwrap()
        });
        (rm, rx)
    }

    #[test]
    fn test_batched_validate_retries_once() {
        let (_raw, d) = dispatcher();
        let (left, left_fetches) = counted_cache(&d, 40);
        let (right, right_fetches) = counted_cache(&d, 2);
        let (rm, rx) = result_monitor(&d);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = attempts.clone();
        let driver = d.clone();
        on_dispatcher(&d, move || {
            request(&driver, move |tx: &mut TxContext| -> TxResult<i64> {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.validate(&[&left, &right])?;
                Ok(left.data().unwrap_or_default() + right.data().unwrap_or_default())
            }, rm);
        });

        let (data, status) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data, Some(42));
        assert!(status.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(left_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(right_fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_valid_caches_need_no_retry() {
        let (_raw, d) = dispatcher();
        let (cache, fetches) = counted_cache(&d, 5);
        let (rm, rx) = result_monitor(&d);

        let driver = d.clone();
        on_dispatcher(&d, move || {
            cache.set(Some(9), Status::ok());
            request(&driver, move |tx: &mut TxContext| -> TxResult<i64> {
                assert_eq!(tx.attempt(), 0);
                Ok(tx.read(&cache)?.unwrap_or_default())
            }, rm);
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, Some(9));
        assert_eq!(fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_cache_fails_transaction() {
        let (_raw, d) = dispatcher();
        let (good, _) = counted_cache(&d, 1);
        let bad = RequestCache::<i64>::new(&d, |rm| {
            rm.set_status(Status::error(codes::TARGET_ERROR, "registers unavailable"));
            rm.done();
        });
        let (rm, rx) = result_monitor(&d);

        let driver = d.clone();
        on_dispatcher(&d, move || {
            request(&driver, move |tx: &mut TxContext| -> TxResult<i64> {
                tx.validate(&[&good, &bad])?;
                Ok(0)
            }, rm);
        });

        let (data, status) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(data, None);
        assert_eq!(status.code(), codes::TARGET_ERROR);
    }

    #[test]
    fn test_cancel_while_waiting() {
        let (_raw, d) = dispatcher();
        let parked = Arc::new(Mutex::new(Vec::new()));
        let sink = parked.clone();
        let cache = RequestCache::<i64>::new(&d, move |rm| sink.lock().push(rm));
        let (rm, rx) = result_monitor(&d);

        let (driver, handle) = (d.clone(), rm.clone());
        on_dispatcher(&d, move || {
            request(&driver, move |tx: &mut TxContext| -> TxResult<i64> {
                Ok(tx.read(&cache)?.unwrap_or_default())
            }, rm);
        });
        handle.cancel();

        let (_, status) = rx.recv_timeout(WAIT).unwrap();
        assert!(status.is_cancel());
        let fetch = parked.lock()[0].clone();
        assert!(fetch.is_canceled());
    }

    #[test]
    fn test_retry_without_wait_is_an_error() {
        let (_raw, d) = dispatcher();
        let (rm, rx) = result_monitor(&d);

        let driver = d.clone();
        on_dispatcher(&d, move || {
            request(&driver, |_: &mut TxContext| -> TxResult<i64> { Err(TxError::Retry) }, rm);
        });

        assert_eq!(rx.recv_timeout(WAIT).unwrap().1.code(), codes::INTERNAL_ERROR);
    }
}
