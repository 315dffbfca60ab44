//! Single-thread dispatchers that serialize every state-mutating callback

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{DispatchError, DispatchResult, TaskmonResult};
use crate::types::{DispatcherConfig, DispatcherStats};

/// A unit of work submitted to a dispatcher
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to any dispatcher
pub type DispatcherRef = Arc<dyn Dispatcher>;

/// A serializing executor.
///
/// Implementations run submitted jobs strictly one at a time and in submission
/// order. All state owned by monitors, caches, transactions and sequences is only
/// mutated from jobs running on the dispatcher.
pub trait Dispatcher: Send + Sync + 'static {
    /// Queue `job` to run on the dispatcher
    fn execute(&self, job: Job) -> DispatchResult<()>;

    /// Queue `job` to run on the dispatcher once `delay` has elapsed
    fn schedule(&self, job: Job, delay: Duration) -> DispatchResult<ScheduledJob>;

    /// Whether the calling thread is the one running this dispatcher's jobs
    fn is_in_dispatch_thread(&self) -> bool;

    /// Name used in log records
    fn name(&self) -> &str {
        "dispatcher"
    }
}

impl dyn Dispatcher {
    /// Submit a closure without boxing it at the call site
    pub fn submit<F>(&self, f: F) -> DispatchResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Box::new(f))
    }
}

/// Handle to a delayed job
#[derive(Debug, Clone, Default)]
pub struct ScheduledJob {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledJob {
    /// Prevent the job from running if its delay has not elapsed yet
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether `cancel` was called before the job ran
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum Command {
    Execute(Job),
    Schedule {
        job: Job,
        delay: Duration,
        handle: ScheduledJob,
    },
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    scheduled: AtomicU64,
    executed: AtomicU64,
    rejected: AtomicU64,
    panicked: AtomicU64,
    slow: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            submitted_jobs: self.submitted.load(Ordering::Relaxed),
            scheduled_jobs: self.scheduled.load(Ordering::Relaxed),
            executed_jobs: self.executed.load(Ordering::Relaxed),
            rejected_jobs: self.rejected.load(Ordering::Relaxed),
            panicked_jobs: self.panicked.load(Ordering::Relaxed),
            slow_jobs: self.slow.load(Ordering::Relaxed),
        }
    }
}

/// State shared with the dispatcher thread
struct RunContext {
    name: String,
    slow_job_threshold: Option<Duration>,
    catch_panics: bool,
    counters: Arc<Counters>,
}

impl RunContext {
    fn run(&self, job: Job) {
        let started = Instant::now();
        let outcome = if self.catch_panics {
            panic::catch_unwind(AssertUnwindSafe(job))
        } else {
            job();
            Ok(())
        };
        self.counters.executed.fetch_add(1, Ordering::Relaxed);

        if let Err(payload) = outcome {
            self.counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(
                dispatcher = %self.name,
                panic = %panic_message(payload.as_ref()),
                "Job panicked on the dispatcher thread"
            );
        }

        if let Some(threshold) = self.slow_job_threshold {
            let elapsed = started.elapsed();
            if elapsed > threshold {
                self.counters.slow.fetch_add(1, Ordering::Relaxed);
                warn!(
                    dispatcher = %self.name,
                    elapsed = ?elapsed,
                    threshold = ?threshold,
                    "Slow job blocked the dispatcher"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Dispatcher backed by one dedicated OS thread.
///
/// The thread drives a tokio current-thread runtime: queued jobs arrive over an
/// unbounded channel and delayed jobs are timers on the same runtime, so every
/// job is serialized with every other one.
pub struct DefaultDispatcher {
    config: DispatcherConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    thread_id: ThreadId,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for DefaultDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultDispatcher")
            .field("name", &self.config.thread_name)
            .field("running", &self.is_running())
            .finish()
    }
}

impl DefaultDispatcher {
    /// Start a dispatcher with the given configuration
    pub fn new(config: DispatcherConfig) -> TaskmonResult<Arc<Self>> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| DispatchError::spawn_failed(e.to_string()))?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();
        let counters = Arc::new(Counters::default());
        let context = Arc::new(RunContext {
            name: config.thread_name.clone(),
            slow_job_threshold: config.slow_job_threshold,
            catch_panics: config.catch_panics,
            counters: counters.clone(),
        });

        let join_handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(command) = receiver.recv().await {
                        match command {
                            Command::Execute(job) => context.run(job),
                            Command::Schedule { job, delay, handle } => {
                                let context = context.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    if handle.is_cancelled() {
                                        // Counted so that pending_jobs() drains.
                                        context.counters.executed.fetch_add(1, Ordering::Relaxed);
                                    } else {
                                        context.run(job);
                                    }
                                });
                            }
                        }
                    }
                    debug!(dispatcher = %context.name, "Dispatcher queue closed");
                });
            })
            .map_err(|e| DispatchError::spawn_failed(e.to_string()))?;

        debug!(dispatcher = %config.thread_name, "Started dispatcher thread");

        Ok(Arc::new(Self {
            thread_id: join_handle.thread().id(),
            config,
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
            counters,
        }))
    }

    /// Start a dispatcher with the default configuration
    pub fn with_defaults() -> TaskmonResult<Arc<Self>> {
        Self::new(DispatcherConfig::default())
    }

    /// Get the current configuration
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Snapshot of the job counters
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }

    /// `false` once `shutdown` was called
    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Close the queue and wait (bounded by the shutdown timeout) for the queued
    /// jobs to drain. Jobs submitted afterwards are rejected.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        debug!(dispatcher = %self.config.thread_name, "Shutting down dispatcher");

        if self.is_in_dispatch_thread() {
            return;
        }
        let Some(handle) = self.join_handle.lock().take() else {
            return;
        };

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!(
                dispatcher = %self.config.thread_name,
                timeout = ?self.config.shutdown_timeout,
                "Dispatcher did not drain before the shutdown timeout"
            );
        }
    }

    fn send(&self, command: Command) -> DispatchResult<()> {
        let sender = self.sender.lock();
        let sent = match sender.as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(dispatcher = %self.config.thread_name, "Rejected job after shutdown");
            Err(DispatchError::rejected(self.config.thread_name.clone()))
        }
    }
}

impl Dispatcher for DefaultDispatcher {
    fn execute(&self, job: Job) -> DispatchResult<()> {
        self.send(Command::Execute(job))?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn schedule(&self, job: Job, delay: Duration) -> DispatchResult<ScheduledJob> {
        let handle = ScheduledJob::default();
        self.send(Command::Schedule {
            job,
            delay,
            handle: handle.clone(),
        })?;
        self.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn is_in_dispatch_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn name(&self) -> &str {
        &self.config.thread_name
    }
}

impl Drop for DefaultDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs every job inline on the calling thread.
///
/// Monitors built on this executor complete on whichever thread calls `done()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateExecutor;

static IMMEDIATE: Lazy<DispatcherRef> = Lazy::new(|| Arc::new(ImmediateExecutor));

impl ImmediateExecutor {
    /// The process-wide instance
    pub fn shared() -> DispatcherRef {
        IMMEDIATE.clone()
    }
}

impl Dispatcher for ImmediateExecutor {
    fn execute(&self, job: Job) -> DispatchResult<()> {
        job();
        Ok(())
    }

    fn schedule(&self, job: Job, delay: Duration) -> DispatchResult<ScheduledJob> {
        let handle = ScheduledJob::default();
        let timer = handle.clone();
        thread::Builder::new()
            .name("taskmon-immediate-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if !timer.is_cancelled() {
                    job();
                }
            })
            .map_err(|e| DispatchError::spawn_failed(e.to_string()))?;
        Ok(handle)
    }

    fn is_in_dispatch_thread(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "immediate"
    }
}

/// Runs jobs inline when already on the wrapped dispatcher's thread and
/// re-submits them otherwise.
#[derive(Clone)]
pub struct ImmediateInDispatcher {
    inner: DispatcherRef,
}

impl ImmediateInDispatcher {
    /// Run jobs inline on `inner`'s thread
    pub fn new(inner: DispatcherRef) -> Self {
        Self { inner }
    }

    /// Wrap `inner` and return it as a shared handle
    pub fn wrap(inner: DispatcherRef) -> DispatcherRef {
        Arc::new(Self::new(inner))
    }

    /// The wrapped dispatcher
    pub fn inner(&self) -> &DispatcherRef {
        &self.inner
    }
}

impl Dispatcher for ImmediateInDispatcher {
    fn execute(&self, job: Job) -> DispatchResult<()> {
        if self.inner.is_in_dispatch_thread() {
            job();
            Ok(())
        } else {
            self.inner.execute(job)
        }
    }

    fn schedule(&self, job: Job, delay: Duration) -> DispatchResult<ScheduledJob> {
        self.inner.schedule(job, delay)
    }

    fn is_in_dispatch_thread(&self) -> bool {
        self.inner.is_in_dispatch_thread()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    fn dispatcher() -> Arc<DefaultDispatcher> {
        DefaultDispatcher::new(DispatcherConfig::for_testing()).unwrap()
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_jobs_run_in_submission_order() {
        let dispatcher = dispatcher();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..50 {
            let tx = tx.clone();
            dispatcher.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }

        let received: Vec<i32> = (0..50).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_dispatch_thread_identity() {
        let dispatcher = dispatcher();
        assert!(!dispatcher.is_in_dispatch_thread());

        let (tx, rx) = std_mpsc::channel();
        let observer = dispatcher.clone();
        dispatcher
            .execute(Box::new(move || tx.send(observer.is_in_dispatch_thread()).unwrap()))
            .unwrap();
        assert!(rx.recv_timeout(WAIT).unwrap());
    }

    #[test]
    fn test_schedule_runs_after_delay() {
        let dispatcher = dispatcher();
        let (tx, rx) = std_mpsc::channel();
        let start = Instant::now();

        dispatcher
            .schedule(Box::new(move || tx.send(Instant::now()).unwrap()), Duration::from_millis(30))
            .unwrap();

        let ran_at = rx.recv_timeout(WAIT).unwrap();
        assert!(ran_at.duration_since(start) >= Duration::from_millis(25));
    }

    #[test]
    fn test_cancelled_schedule_does_not_run() {
        let dispatcher = dispatcher();
        let (tx, rx) = std_mpsc::channel::<()>();

        let handle = dispatcher
            .schedule(Box::new(move || tx.send(()).unwrap()), Duration::from_millis(50))
            .unwrap();
        handle.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_rejected_after_shutdown() {
        let dispatcher = dispatcher();
        dispatcher.shutdown();
        assert!(!dispatcher.is_running());

        let result = dispatcher.execute(Box::new(|| {}));
        assert!(matches!(result, Err(DispatchError::Rejected { .. })));
        assert_eq!(dispatcher.stats().rejected_jobs, 1);
    }

    #[test]
    fn test_panicking_job_does_not_stop_dispatcher() {
        let dispatcher = dispatcher();
        let (tx, rx) = std_mpsc::channel();

        dispatcher.execute(Box::new(|| panic!("job failure"))).unwrap();
        dispatcher.execute(Box::new(move || tx.send(7).unwrap())).unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 7);
        dispatcher.shutdown();
        let stats = dispatcher.stats();
        assert_eq!(stats.panicked_jobs, 1);
        assert_eq!(stats.executed_jobs, 2);
        assert_eq!(stats.pending_jobs(), 0);
    }

    #[test]
    fn test_immediate_in_dispatcher_runs_inline_on_thread() {
        let dispatcher = dispatcher();
        let immediate = ImmediateInDispatcher::wrap(dispatcher.clone());
        let (tx, rx) = std_mpsc::channel();

        let inner = immediate.clone();
        dispatcher
            .execute(Box::new(move || {
                let order = Arc::new(Mutex::new(Vec::new()));
                let inline = order.clone();
                inner.submit(move || inline.lock().push("inline")).unwrap();
                order.lock().push("after");
                tx.send(order.lock().clone()).unwrap();
            }))
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec!["inline", "after"]);
    }

    #[test]
    fn test_immediate_executor_runs_inline() {
        let executor = ImmediateExecutor::shared();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        executor.submit(move || flag.store(true, Ordering::SeqCst)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert!(executor.is_in_dispatch_thread());
    }
}
