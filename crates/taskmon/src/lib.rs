//! Taskmon - Asynchronous request coordination on a serializing dispatcher
//!
//! Building blocks for services that talk to slow back ends, such as a debugger
//! talking to a target, without blocking and without locks in the service logic.
//!
//! # Overview
//!
//! Every state-mutating callback runs on a single-threaded [`Dispatcher`]:
//! - A [`RequestMonitor`] is the completion token of one asynchronous operation;
//!   it carries a [`Status`], a cancel flag and an optional parent
//! - [`DataRequestMonitor`] adds a result value, [`CountingRequestMonitor`] and
//!   [`MultiRequestMonitor`] fan several sub-operations into one
//! - [`RequestCache`] and [`RangeCache`] fetch a value once and serve every waiter
//! - [`transaction::request`] reads several caches in straight-line code, retrying
//!   once the missing values arrived
//! - [`Sequence`] runs steps in order and rolls them back on failure or cancel
//! - [`Query`] lets any other thread block on a result computed on the dispatcher
//!
//! # Example
//!
//! ```rust,no_run
//! use taskmon::{Cache, DataRequestMonitor, DefaultDispatcher, DispatcherRef, Query, RequestCache};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher: DispatcherRef = DefaultDispatcher::with_defaults()?;
//!
//!     let registers = RequestCache::new(&dispatcher, |rm: DataRequestMonitor<Vec<u64>>| {
//!         rm.done_with(vec![0x1000, 0x2000]);
//!     });
//!
//!     let query = Query::new(move |rm: DataRequestMonitor<Vec<u64>>| registers.request(rm));
//!     query.submit(&dispatcher)?;
//!     println!("registers: {:x?}", query.get()?);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod counting;
pub mod data;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod multi;
pub mod query;
pub mod range;
pub mod reporter;
pub mod sequence;
pub mod status;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod test_support;

pub use cache::{Cache, RequestCache, Retriever, Validatable};
pub use catalog::StepCatalog;
pub use counting::CountingRequestMonitor;
pub use data::DataRequestMonitor;
pub use error::{
    ConfigError, DispatchError, DispatchResult, QueryError, QueryResult, SequenceError, TaskmonError,
    TaskmonResult,
};
pub use executor::{
    DefaultDispatcher, Dispatcher, DispatcherRef, ImmediateExecutor, ImmediateInDispatcher, Job,
    ScheduledJob,
};
pub use monitor::{DefaultHandler, Handler, ListenerId, MonitorId, OnCompleted, OnSuccess, RequestMonitor};
pub use multi::MultiRequestMonitor;
pub use query::Query;
pub use range::{RangeCache, RangeRetriever};
pub use reporter::{MultiReporter, NoOpReporter, SequenceEvent, SequenceReporter, TracingReporter};
pub use sequence::{FnStep, Sequence, SequenceHandle, SequenceState, Step, StepContext};
pub use status::{codes, Severity, Status};
pub use transaction::{Transaction, TxContext, TxError, TxResult};
pub use types::{DispatcherConfig, DispatcherStats};
