//! Helpers shared by the unit tests

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::executor::{DefaultDispatcher, DispatcherRef};
use crate::types::DispatcherConfig;

pub const WAIT: Duration = Duration::from_secs(5);

/// Start a fresh dispatcher for one test
pub fn dispatcher() -> (Arc<DefaultDispatcher>, DispatcherRef) {
    let dispatcher = DefaultDispatcher::new(DispatcherConfig::for_testing()).unwrap();
    let shared: DispatcherRef = dispatcher.clone();
    (dispatcher, shared)
}

/// Run `f` on the dispatcher thread and wait for its result
pub fn on_dispatcher<R, F>(dispatcher: &DispatcherRef, f: F) -> R
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    dispatcher
        .submit(move || {
            let _ = tx.send(f());
        })
        .unwrap();
    rx.recv_timeout(WAIT).unwrap()
}

/// Wait until every job queued so far has run
pub fn drain(dispatcher: &DispatcherRef) {
    on_dispatcher(dispatcher, || ());
}
