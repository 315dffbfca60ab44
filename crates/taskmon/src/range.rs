//! Cache for contiguous sub-ranges of a sequence
//!
//! The range cache keeps an ordered set of non-overlapping intervals, each backed by
//! its own [`RequestCache`]. A request for `(offset, count)` only fetches the parts
//! of the range no interval covers yet; the result is stitched together from the
//! contributing intervals.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{Cache, RequestCache, Validatable};
use crate::data::DataRequestMonitor;
use crate::executor::DispatcherRef;
use crate::status::{codes, Status};
use crate::transaction::{self, TxContext, TxError, TxResult};

/// Fetch function of a [`RangeCache`]: `(offset, count, rm)`. It must complete
/// `rm` with the elements of that range.
pub type RangeRetriever<V> = Arc<dyn Fn(usize, usize, DataRequestMonitor<Vec<V>>) + Send + Sync>;

struct Interval<V> {
    count: usize,
    cache: RequestCache<Vec<V>>,
}

struct RangeInner<V> {
    name: String,
    dispatcher: DispatcherRef,
    retriever: RangeRetriever<V>,
    /// Keyed by offset; intervals never overlap
    intervals: Mutex<BTreeMap<usize, Interval<V>>>,
}

/// One interval contributing to a requested range
struct Piece<V> {
    offset: usize,
    count: usize,
    cache: RequestCache<Vec<V>>,
}

/// Range cache over a sequence of `V`.
///
/// Must be used on the dispatcher thread. Cloning yields another handle to the
/// same cache.
pub struct RangeCache<V> {
    inner: Arc<RangeInner<V>>,
}

impl<V> Clone for RangeCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> RangeCache<V>
where
    V: Clone + Send + 'static,
{
    /// Create an unnamed range cache fetching gaps through `retriever`
    pub fn new<F>(dispatcher: &DispatcherRef, retriever: F) -> Self
    where
        F: Fn(usize, usize, DataRequestMonitor<Vec<V>>) + Send + Sync + 'static,
    {
        Self::named("range", dispatcher, retriever)
    }

    /// Create a range cache whose log records carry `name`
    pub fn named<S, F>(name: S, dispatcher: &DispatcherRef, retriever: F) -> Self
    where
        S: Into<String>,
        F: Fn(usize, usize, DataRequestMonitor<Vec<V>>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(RangeInner {
                name: name.into(),
                dispatcher: dispatcher.clone(),
                retriever: Arc::new(retriever),
                intervals: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// A cache-like handle for the elements `offset..offset + count`.
    ///
    /// Requesting the handle fetches the uncovered parts of the range, at most one
    /// fetch per gap, and completes with the stitched sequence. The handle holds
    /// its result once valid; later resets of the range cache do not affect it.
    pub fn get_range(&self, offset: usize, count: usize) -> RequestCache<Vec<V>> {
        self.assert_dispatch();
        let range = self.clone();
        let dispatcher = self.inner.dispatcher.clone();
        RequestCache::named(
            format!("{}[{}..{}]", self.inner.name, offset, offset + count),
            &self.inner.dispatcher,
            move |rm: DataRequestMonitor<Vec<V>>| {
                let range = range.clone();
                transaction::request(
                    &dispatcher,
                    move |tx: &mut TxContext| -> TxResult<Vec<V>> { range.assemble(tx, offset, count) },
                    rm,
                );
            },
        )
    }

    /// Replace every interval with a single one covering `offset..offset + count`.
    ///
    /// Intervals still fetching are then completed with an empty OK result, so
    /// nobody is left waiting on them. Their waiters retry against the new
    /// interval.
    pub fn set(&self, offset: usize, count: usize, data: Vec<V>, status: Status) {
        self.assert_dispatch();
        let cache = self.interval_cache(offset, count);
        cache.set(Some(data), status);
        let previous = {
            let mut intervals = self.inner.intervals.lock();
            let previous = std::mem::take(&mut *intervals);
            intervals.insert(offset, Interval { count, cache });
            previous
        };
        debug!(range = %self.inner.name, offset, count, "Range cache replaced");

        // Completing an interval may re-run a waiting transaction right here on
        // an inline dispatcher, so the map must already hold the new interval.
        for interval in previous.into_values() {
            if !interval.cache.is_valid() {
                interval.cache.set(Some(Vec::new()), Status::ok());
            }
        }
    }

    /// Drop every interval that is not currently fetching
    pub fn reset(&self) {
        self.assert_dispatch();
        self.inner
            .intervals
            .lock()
            .retain(|_, interval| interval.cache.is_fetching());
    }

    /// The cached intervals as `(offset, count)`, in order
    pub fn intervals(&self) -> Vec<(usize, usize)> {
        self.inner
            .intervals
            .lock()
            .iter()
            .map(|(offset, interval)| (*offset, interval.count))
            .collect()
    }

    fn assert_dispatch(&self) {
        debug_assert!(
            self.inner.dispatcher.is_in_dispatch_thread(),
            "range cache {} used off the dispatcher thread",
            self.inner.name
        );
    }

    fn interval_cache(&self, offset: usize, count: usize) -> RequestCache<Vec<V>> {
        let retriever = self.inner.retriever.clone();
        RequestCache::named(
            format!("{}@{}+{}", self.inner.name, offset, count),
            &self.inner.dispatcher,
            move |rm| retriever(offset, count, rm),
        )
    }

    /// Intervals covering `offset..offset + count`, creating one for every gap
    fn covering(&self, offset: usize, count: usize) -> Vec<Piece<V>> {
        let end = offset + count;
        let mut intervals = self.inner.intervals.lock();
        let mut pieces = Vec::new();
        let mut gaps = Vec::new();
        let mut position = offset;

        for (&start, interval) in intervals.range(..end) {
            let interval_end = start + interval.count;
            if interval_end <= offset {
                continue;
            }
            if start > position {
                gaps.push((position, start - position));
            }
            pieces.push(Piece {
                offset: start,
                count: interval.count,
                cache: interval.cache.clone(),
            });
            position = position.max(interval_end);
        }
        if position < end {
            gaps.push((position, end - position));
        }

        for (start, len) in gaps {
            let cache = self.interval_cache(start, len);
            intervals.insert(start, Interval { count: len, cache: cache.clone() });
            pieces.push(Piece {
                offset: start,
                count: len,
                cache,
            });
        }
        pieces.sort_by_key(|piece| piece.offset);
        pieces
    }

    fn assemble(&self, tx: &mut TxContext, offset: usize, count: usize) -> TxResult<Vec<V>> {
        let pieces = self.covering(offset, count);
        let caches: Vec<&dyn Validatable> = pieces.iter().map(|piece| &piece.cache as &dyn Validatable).collect();
        tx.validate(&caches)?;

        let end = offset + count;
        let mut elements = Vec::with_capacity(count);
        for piece in &pieces {
            let from = offset.max(piece.offset);
            let to = end.min(piece.offset + piece.count);
            let data = piece.cache.data().unwrap_or_default();
            let wanted = (from - piece.offset)..(to - piece.offset);
            let Some(slice) = data.get(wanted) else {
                return Err(TxError::Failed(Status::error(
                    codes::REQUEST_FAILED,
                    format!(
                        "Range {}..{} returned {} elements, {} needed.",
                        piece.offset,
                        piece.offset + piece.count,
                        data.len(),
                        to - piece.offset
                    ),
                )));
            };
            elements.extend_from_slice(slice);
        }
        Ok(elements)
    }
}

impl<V> Debug for RangeCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let intervals = self.inner.intervals.lock();
        f.debug_struct("RangeCache")
            .field("name", &self.inner.name)
            .field(
                "intervals",
                &intervals.iter().map(|(offset, i)| (*offset, i.count)).collect::<Vec<_>>(),
            )
            .finish()
    }
}
