//! Ordered asynchronous steps with rollback
//!
//! A [`Sequence`] runs its steps one after the other on the dispatcher. Each step
//! completes the monitor it is handed. If a step fails, the steps that already ran
//! are rolled back in reverse order; a failing step is assumed not to need undoing.
//! A cancel request is observed before every step, and a step whose monitor ends
//! up canceled is rolled back along with the earlier ones.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DispatchResult, QueryError, QueryResult};
use crate::executor::DispatcherRef;
use crate::monitor::RequestMonitor;
use crate::query::FutureSync;
use crate::reporter::{NoOpReporter, SequenceEvent, SequenceReporter};
use crate::status::Status;

/// One asynchronous unit of a [`Sequence`]
pub trait Step: Send + 'static {
    /// Do the work and complete `rm`
    fn execute(&mut self, ctx: &StepContext, rm: RequestMonitor);

    /// Undo the work of a successful `execute` and complete `rm`
    fn roll_back(&mut self, ctx: &StepContext, rm: RequestMonitor) {
        let _ = ctx;
        rm.done();
    }

    /// Share of the sequence's progress this step accounts for
    fn ticks(&self) -> u64 {
        1
    }

    /// Name used in events and log records
    fn name(&self) -> &str {
        "step"
    }
}

type StepFn = Box<dyn FnMut(&StepContext, RequestMonitor) + Send>;

/// A [`Step`] built from closures
pub struct FnStep {
    name: String,
    execute: StepFn,
    roll_back: Option<StepFn>,
    ticks: u64,
}

impl FnStep {
    /// Step named `name` running `execute`; its rollback does nothing
    pub fn new<S, F>(name: S, execute: F) -> Self
    where
        S: Into<String>,
        F: FnMut(&StepContext, RequestMonitor) + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Box::new(execute),
            roll_back: None,
            ticks: 1,
        }
    }

    /// Closure undoing a successful `execute`
    pub fn with_roll_back<F>(mut self, roll_back: F) -> Self
    where
        F: FnMut(&StepContext, RequestMonitor) + Send + 'static,
    {
        self.roll_back = Some(Box::new(roll_back));
        self
    }

    /// Progress share of the step (default 1)
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    /// Box the step for [`Sequence::new`]
    pub fn boxed(self) -> Box<dyn Step> {
        Box::new(self)
    }
}

impl Step for FnStep {
    fn execute(&mut self, ctx: &StepContext, rm: RequestMonitor) {
        (self.execute)(ctx, rm)
    }

    fn roll_back(&mut self, ctx: &StepContext, rm: RequestMonitor) {
        match self.roll_back.as_mut() {
            Some(roll_back) => roll_back(ctx, rm),
            None => rm.done(),
        }
    }

    fn ticks(&self) -> u64 {
        self.ticks
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Lifecycle of a sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceState {
    Idle,
    Running,
    Finished,
    Aborting,
    Aborted,
    Cancelling,
    Cancelled,
}

impl Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SequenceState::Idle => "idle",
            SequenceState::Running => "running",
            SequenceState::Finished => "finished",
            SequenceState::Aborting => "aborting",
            SequenceState::Aborted => "aborted",
            SequenceState::Cancelling => "cancelling",
            SequenceState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Passed to every step call
pub struct StepContext {
    runner: Arc<Runner>,
    index: usize,
}

impl StepContext {
    /// Dispatcher the sequence runs on
    pub fn dispatcher(&self) -> &DispatcherRef {
        &self.runner.dispatcher
    }

    /// Name of the running sequence
    pub fn task_name(&self) -> &str {
        &self.runner.task_name
    }

    /// Position of the step in the sequence
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether cancellation of the sequence was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.runner.is_cancel_requested()
    }

    /// Report `ticks` of progress from inside a long-running step.
    ///
    /// Ticks reported this way count against the step's own budget; the rest
    /// is added when the step completes.
    pub fn advance(&self, ticks: u64) {
        let budget = self.runner.step_ticks[self.index];
        let (done_ticks, total_ticks) = {
            let mut run = self.runner.run.lock();
            let granted = ticks.min(budget.saturating_sub(run.step_progress));
            run.step_progress += granted;
            run.done_ticks += granted;
            (run.done_ticks, run.total_ticks)
        };
        self.runner.report(SequenceEvent::Progress {
            task_name: self.runner.task_name.clone(),
            done_ticks,
            total_ticks,
        });
    }
}

struct RunState {
    state: SequenceState,
    /// Last step whose `execute` was called
    current: Option<usize>,
    status: Status,
    rolled_back: bool,
    done_ticks: u64,
    total_ticks: u64,
    step_progress: u64,
    started: Instant,
    step_started: Instant,
}

enum StepCall {
    Execute(RequestMonitor),
    RollBack(RequestMonitor),
}

struct Runner {
    dispatcher: DispatcherRef,
    task_name: String,
    rollback_on_failure: bool,
    /// A slot is empty while one of the step's own calls is on the stack
    steps: Vec<Mutex<Option<Box<dyn Step>>>>,
    /// Calls that arrived while their step was busy
    deferred: Mutex<Vec<(usize, StepCall)>>,
    step_names: Vec<String>,
    step_ticks: Vec<u64>,
    reporter: Mutex<Box<dyn SequenceReporter>>,
    run: Mutex<RunState>,
    cancel_requested: AtomicBool,
    /// Parent of every step monitor; completed when the sequence finishes
    monitor: RequestMonitor,
    result: Arc<FutureSync<Status>>,
}

/// An ordered list of [`Step`]s run on a dispatcher.
///
/// ```no_run
/// use taskmon::{DefaultDispatcher, DispatcherRef, FnStep, Sequence};
///
/// let dispatcher: DispatcherRef = DefaultDispatcher::with_defaults().unwrap();
/// let handle = Sequence::new(&dispatcher, vec![
///     FnStep::new("connect", |_, rm| rm.done()).boxed(),
///     FnStep::new("attach", |_, rm| rm.done()).boxed(),
/// ])
/// .with_task_name("launch")
/// .start()
/// .unwrap();
/// assert!(handle.get().unwrap().is_ok());
/// ```
pub struct Sequence {
    dispatcher: DispatcherRef,
    steps: Vec<Box<dyn Step>>,
    task_name: String,
    completion: Option<RequestMonitor>,
    reporter: Box<dyn SequenceReporter>,
    rollback_on_failure: bool,
}

impl Sequence {
    /// Sequence running `steps` on `dispatcher`, named `"sequence"` until renamed
    pub fn new(dispatcher: &DispatcherRef, steps: Vec<Box<dyn Step>>) -> Self {
        Self {
            dispatcher: dispatcher.clone(),
            steps,
            task_name: "sequence".to_string(),
            completion: None,
            reporter: Box::new(NoOpReporter),
            rollback_on_failure: true,
        }
    }

    /// Name used in progress events and log records
    pub fn with_task_name<S: Into<String>>(mut self, name: S) -> Self {
        self.task_name = name.into();
        self
    }

    /// Monitor completed with the final status. Canceling it cancels the
    /// sequence.
    pub fn with_completion(mut self, rm: RequestMonitor) -> Self {
        self.completion = Some(rm);
        self
    }

    /// Reporter receiving the lifecycle events. Its context is set to the task name.
    pub fn with_reporter<R: SequenceReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Whether a failed step triggers rollback of the earlier steps (default
    /// `true`). Cancellation always rolls back.
    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    /// Queue the sequence on its dispatcher
    pub fn start(self) -> DispatchResult<SequenceHandle> {
        let dispatcher = self.dispatcher.clone();
        let runner = self.into_runner();
        let start = runner.clone();
        dispatcher.submit(move || Runner::begin(&start))?;
        Ok(SequenceHandle { runner })
    }

    /// Start executing right away. Must be called on the dispatcher thread.
    pub fn run(self) -> SequenceHandle {
        debug_assert!(
            self.dispatcher.is_in_dispatch_thread(),
            "sequence {} run off the dispatcher thread",
            self.task_name
        );
        let runner = self.into_runner();
        Runner::begin(&runner);
        SequenceHandle { runner }
    }

    fn into_runner(self) -> Arc<Runner> {
        let step_names = self.steps.iter().map(|step| step.name().to_string()).collect();
        let step_ticks: Vec<u64> = self.steps.iter().map(|step| step.ticks()).collect();
        let total_ticks = step_ticks.iter().sum();

        let mut reporter = self.reporter;
        reporter.set_context(self.task_name.clone());

        let result = Arc::new(FutureSync::new());
        let published = result.clone();
        let monitor = RequestMonitor::on_completed(&self.dispatcher, self.completion.as_ref(), move |rm| {
            publish(&published, rm)
        });

        Arc::new(Runner {
            dispatcher: self.dispatcher,
            task_name: self.task_name,
            rollback_on_failure: self.rollback_on_failure,
            steps: self.steps.into_iter().map(|step| Mutex::new(Some(step))).collect(),
            deferred: Mutex::new(Vec::new()),
            step_names,
            step_ticks,
            reporter: Mutex::new(reporter),
            run: Mutex::new(RunState {
                state: SequenceState::Idle,
                current: None,
                status: Status::ok(),
                rolled_back: false,
                done_ticks: 0,
                total_ticks,
                step_progress: 0,
                started: Instant::now(),
                step_started: Instant::now(),
            }),
            cancel_requested: AtomicBool::new(false),
            monitor,
            result,
        })
    }
}

impl Runner {
    fn begin(self: &Arc<Self>) {
        let total_ticks = {
            let mut run = self.run.lock();
            if run.state != SequenceState::Idle {
                return;
            }
            run.state = SequenceState::Running;
            run.started = Instant::now();
            run.total_ticks
        };
        debug!(task = %self.task_name, steps = self.steps.len(), "Starting sequence");
        self.report(SequenceEvent::SequenceStarted {
            task_name: self.task_name.clone(),
            total_steps: self.steps.len(),
            total_ticks,
        });
        self.execute_step(0);
    }

    fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire) || self.monitor.is_canceled()
    }

    fn report(&self, event: SequenceEvent) {
        self.reporter.lock().report_event(event);
    }

    fn context(self: &Arc<Self>, index: usize) -> StepContext {
        StepContext {
            runner: self.clone(),
            index,
        }
    }

    fn execute_step(self: &Arc<Self>, index: usize) {
        if self.is_cancel_requested() {
            self.cancel_execution();
            return;
        }
        if index >= self.steps.len() {
            self.finish(SequenceState::Finished);
            return;
        }

        {
            let mut run = self.run.lock();
            run.current = Some(index);
            run.step_progress = 0;
            run.step_started = Instant::now();
        }
        debug!(task = %self.task_name, index, step = %self.step_names[index], "Executing step");
        self.report(SequenceEvent::StepStarted {
            task_name: self.task_name.clone(),
            index,
            step_name: self.step_names[index].clone(),
        });

        let runner = self.clone();
        let rm = RequestMonitor::on_completed(&self.dispatcher, Some(&self.monitor), move |rm| {
            runner.step_done(index, rm)
        });
        self.call_step(index, StepCall::Execute(rm));
    }

    /// Run `call` on step `index` without holding any lock during the call.
    ///
    /// On an inline dispatcher a step completing synchronously re-enters the
    /// runner, which may call the same step again (a cancel rolls back the step
    /// that just ran). Such a call is queued and runs as soon as the outer call
    /// returned.
    fn call_step(self: &Arc<Self>, index: usize, call: StepCall) {
        let slot = self.steps[index].lock().take();
        let Some(mut step) = slot else {
            self.deferred.lock().push((index, call));
            return;
        };
        let ctx = self.context(index);
        match call {
            StepCall::Execute(rm) => step.execute(&ctx, rm),
            StepCall::RollBack(rm) => step.roll_back(&ctx, rm),
        }
        *self.steps[index].lock() = Some(step);

        let next = {
            let mut deferred = self.deferred.lock();
            deferred
                .iter()
                .position(|(pending, _)| *pending == index)
                .map(|position| deferred.remove(position))
        };
        if let Some((index, call)) = next {
            self.call_step(index, call);
        }
    }

    fn step_done(self: &Arc<Self>, index: usize, rm: &RequestMonitor) {
        let status = rm.status();
        let duration = self.run.lock().step_started.elapsed();

        if rm.is_canceled() {
            self.report_step_failed(index, Status::cancel("Step canceled."), duration);
            self.cancel_execution();
        } else if status.is_error() {
            self.report_step_failed(index, status.clone(), duration);
            self.abort_execution(status);
        } else {
            self.report(SequenceEvent::StepCompleted {
                task_name: self.task_name.clone(),
                index,
                step_name: self.step_names[index].clone(),
                duration,
            });
            let (done_ticks, total_ticks) = {
                let mut run = self.run.lock();
                // Warnings do not stop the sequence but show up in the result.
                if !status.is_ok() {
                    run.status.add(status);
                }
                let rest = self.step_ticks[index].saturating_sub(run.step_progress);
                run.done_ticks += rest;
                (run.done_ticks, run.total_ticks)
            };
            self.report(SequenceEvent::Progress {
                task_name: self.task_name.clone(),
                done_ticks,
                total_ticks,
            });
            self.execute_step(index + 1);
        }
    }

    fn report_step_failed(&self, index: usize, status: Status, duration: Duration) {
        self.report(SequenceEvent::StepFailed {
            task_name: self.task_name.clone(),
            index,
            step_name: self.step_names[index].clone(),
            status,
            duration,
        });
    }

    /// Roll back everything executed so far, including the current step
    fn cancel_execution(self: &Arc<Self>) {
        let current = {
            let mut run = self.run.lock();
            run.state = SequenceState::Cancelling;
            let mut status = Status::cancel(format!("Sequence \"{}\" was canceled.", self.task_name));
            if run.status.is_multi() {
                status.merge(run.status.clone());
            }
            run.status = status;
            run.current
        };
        debug!(task = %self.task_name, "Sequence canceled, rolling back");
        self.roll_back_step(current);
    }

    /// Roll back the steps before the failed one
    fn abort_execution(self: &Arc<Self>, status: Status) {
        let (current, rollback) = {
            let mut run = self.run.lock();
            run.state = SequenceState::Aborting;
            // The failing status leads; warnings of earlier steps follow it.
            let earlier = std::mem::replace(&mut run.status, status);
            if earlier.is_multi() {
                run.status.merge(earlier);
            }
            (run.current, self.rollback_on_failure)
        };
        if !rollback {
            self.finish(SequenceState::Aborted);
            return;
        }
        self.roll_back_step(current.and_then(|index| index.checked_sub(1)));
    }

    fn roll_back_step(self: &Arc<Self>, index: Option<usize>) {
        let Some(index) = index else {
            let terminal = match self.run.lock().state {
                SequenceState::Cancelling => SequenceState::Cancelled,
                _ => SequenceState::Aborted,
            };
            self.finish(terminal);
            return;
        };

        self.run.lock().rolled_back = true;
        debug!(task = %self.task_name, index, step = %self.step_names[index], "Rolling back step");
        self.report(SequenceEvent::RollbackStarted {
            task_name: self.task_name.clone(),
            index,
            step_name: self.step_names[index].clone(),
        });

        // Not a child of the sequence monitor: rollback must run even when the
        // sequence was canceled.
        let runner = self.clone();
        let rm = RequestMonitor::on_completed(&self.dispatcher, None, move |rm| {
            let status = rm.status();
            if !status.is_ok() {
                runner.report(SequenceEvent::RollbackFailed {
                    task_name: runner.task_name.clone(),
                    index,
                    step_name: runner.step_names[index].clone(),
                    status: status.clone(),
                });
                runner.run.lock().status.add(status);
            }
            runner.roll_back_step(index.checked_sub(1));
        });
        self.call_step(index, StepCall::RollBack(rm));
    }

    fn finish(self: &Arc<Self>, terminal: SequenceState) {
        let (status, rolled_back, duration) = {
            let mut run = self.run.lock();
            run.state = terminal;
            (run.status.clone(), run.rolled_back, run.started.elapsed())
        };
        debug!(task = %self.task_name, state = %terminal, status = %status.severity(), "Sequence done");

        {
            let mut reporter = self.reporter.lock();
            reporter.report_event(SequenceEvent::SequenceFinished {
                task_name: self.task_name.clone(),
                status: status.clone(),
                rolled_back,
                duration,
            });
            reporter.finish();
        }

        if status.is_cancel() {
            self.monitor.cancel();
        }
        if !status.is_ok() {
            self.monitor.set_status(status);
        }
        self.monitor.done();
    }
}

/// Completion of the sequence monitor: publish the result and report to the
/// caller's completion monitor
fn publish(result: &FutureSync<Status>, rm: &RequestMonitor) {
    let status = rm.status();
    let outcome = if status.is_error() {
        Err(status.clone())
    } else {
        Ok(status.clone())
    };
    result.complete(outcome);

    if let Some(parent) = rm.parent() {
        if status.is_cancel() {
            parent.cancel();
        }
        if !status.is_ok() {
            parent.set_status(status);
        }
        parent.done();
    }
}

/// Handle to a started [`Sequence`]
#[derive(Clone)]
pub struct SequenceHandle {
    runner: Arc<Runner>,
}

impl SequenceHandle {
    /// Request cancellation. Observed before the next step; the running step's
    /// monitor is canceled as well.
    pub fn cancel(&self) {
        self.runner.cancel_requested.store(true, Ordering::Release);
        self.runner.monitor.cancel();
    }

    /// Current lifecycle state
    pub fn state(&self) -> SequenceState {
        self.runner.run.lock().state
    }

    /// Whether the final status is available
    pub fn is_done(&self) -> bool {
        self.runner.result.is_done()
    }

    /// Ticks completed so far and the total
    pub fn progress(&self) -> (u64, u64) {
        let run = self.runner.run.lock();
        (run.done_ticks, run.total_ticks)
    }

    /// Block until the sequence finished; returns the final status unless it
    /// is an error or a cancellation
    pub fn get(&self) -> QueryResult<Status> {
        self.check_not_dispatcher()?;
        self.runner.result.wait(None)
    }

    /// Like [`get`](Self::get), giving up after `timeout`
    pub fn get_timeout(&self, timeout: Duration) -> QueryResult<Status> {
        self.check_not_dispatcher()?;
        self.runner.result.wait(Some(timeout))
    }

    fn check_not_dispatcher(&self) -> QueryResult<()> {
        if !self.runner.result.is_done() && self.runner.dispatcher.is_in_dispatch_thread() {
            return Err(QueryError::WouldDeadlock);
        }
        Ok(())
    }
}

impl fmt::Debug for SequenceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceHandle")
            .field("task", &self.runner.task_name)
            .field("state", &self.state())
            .finish()
    }
}
