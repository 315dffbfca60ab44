//! Progress reporting for sequences
//!
//! A [`Sequence`](crate::sequence::Sequence) reports every step transition to a
//! [`SequenceReporter`]. Reporters run on the dispatcher thread and must not block.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::status::Status;

/// Events reported while a sequence runs
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    /// The sequence began executing its first step
    SequenceStarted {
        task_name: String,
        total_steps: usize,
        total_ticks: u64,
    },
    /// A step's `execute` was called
    StepStarted {
        task_name: String,
        index: usize,
        step_name: String,
    },
    /// A step completed successfully
    StepCompleted {
        task_name: String,
        index: usize,
        step_name: String,
        duration: Duration,
    },
    /// A step completed with an error or was canceled
    StepFailed {
        task_name: String,
        index: usize,
        step_name: String,
        status: Status,
        duration: Duration,
    },
    /// Ticks of finished steps out of the total
    Progress {
        task_name: String,
        done_ticks: u64,
        total_ticks: u64,
    },
    /// A step's `roll_back` was called
    RollbackStarted {
        task_name: String,
        index: usize,
        step_name: String,
    },
    /// A step's `roll_back` failed; rollback continues with the earlier steps
    RollbackFailed {
        task_name: String,
        index: usize,
        step_name: String,
        status: Status,
    },
    /// The sequence finished, rolled back or not
    SequenceFinished {
        task_name: String,
        status: Status,
        rolled_back: bool,
        duration: Duration,
    },
}

/// Receiver of [`SequenceEvent`]s
pub trait SequenceReporter: Send {
    fn report_event(&mut self, event: SequenceEvent);

    /// Set a prefix for the events of the current run
    fn set_context(&mut self, context: String) {
        let _ = context;
    }

    /// Called once the sequence has finished
    fn finish(&mut self) {}
}

/// Discards all events
#[derive(Debug, Default)]
pub struct NoOpReporter;

impl SequenceReporter for NoOpReporter {
    fn report_event(&mut self, _event: SequenceEvent) {}
}

/// Writes events as `tracing` records
#[derive(Debug, Default)]
pub struct TracingReporter {
    context: Option<String>,
}

impl TracingReporter {
    /// Reporter without a context prefix
    pub fn new() -> Self {
        Self { context: None }
    }

    fn format_duration(duration: Duration) -> String {
        if duration.as_secs() > 0 {
            format!("{:.1}s", duration.as_secs_f32())
        } else {
            format!("{}ms", duration.as_millis())
        }
    }
}

impl SequenceReporter for TracingReporter {
    fn report_event(&mut self, event: SequenceEvent) {
        let context = self.context.as_deref().unwrap_or("");
        match event {
            SequenceEvent::SequenceStarted {
                task_name,
                total_steps,
                total_ticks,
            } => {
                info!(context, task = %task_name, total_steps, total_ticks, "Sequence started");
            }
            SequenceEvent::StepStarted {
                task_name,
                index,
                step_name,
            } => {
                debug!(context, task = %task_name, index, step = %step_name, "Step started");
            }
            SequenceEvent::StepCompleted {
                task_name,
                index,
                step_name,
                duration,
            } => {
                debug!(
                    context,
                    task = %task_name,
                    index,
                    step = %step_name,
                    duration = %Self::format_duration(duration),
                    "Step completed"
                );
            }
            SequenceEvent::StepFailed {
                task_name,
                index,
                step_name,
                status,
                duration,
            } => {
                warn!(
                    context,
                    task = %task_name,
                    index,
                    step = %step_name,
                    status = %status,
                    duration = %Self::format_duration(duration),
                    "Step failed"
                );
            }
            SequenceEvent::Progress {
                task_name,
                done_ticks,
                total_ticks,
            } => {
                debug!(context, task = %task_name, "Progress {}/{}", done_ticks, total_ticks);
            }
            SequenceEvent::RollbackStarted {
                task_name,
                index,
                step_name,
            } => {
                debug!(context, task = %task_name, index, step = %step_name, "Rolling back step");
            }
            SequenceEvent::RollbackFailed {
                task_name,
                index,
                step_name,
                status,
            } => {
                warn!(context, task = %task_name, index, step = %step_name, status = %status, "Rollback failed");
            }
            SequenceEvent::SequenceFinished {
                task_name,
                status,
                rolled_back,
                duration,
            } => {
                info!(
                    context,
                    task = %task_name,
                    severity = %status.severity(),
                    rolled_back,
                    duration = %Self::format_duration(duration),
                    "Sequence finished"
                );
            }
        }
    }

    fn set_context(&mut self, context: String) {
        self.context = Some(context);
    }
}

/// Broadcasts events to several reporters
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn SequenceReporter>>,
}

impl MultiReporter {
    /// Broadcaster without any reporter
    pub fn new() -> Self {
        Self { reporters: Vec::new() }
    }

    /// Builder form of [`MultiReporter::with_reporter`]
    pub fn add_reporter<R: SequenceReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    /// Add `reporter` to the broadcast list
    pub fn with_reporter<R: SequenceReporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Box::new(reporter));
    }
}

impl SequenceReporter for MultiReporter {
    fn report_event(&mut self, event: SequenceEvent) {
        for reporter in &mut self.reporters {
            reporter.report_event(event.clone());
        }
    }

    fn set_context(&mut self, context: String) {
        for reporter in &mut self.reporters {
            reporter.set_context(context.clone());
        }
    }

    fn finish(&mut self) {
        for reporter in &mut self.reporters {
            reporter.finish();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every event; shared with the test through `events`
    #[derive(Debug, Default, Clone)]
    pub(crate) struct RecordingReporter {
        pub(crate) events: Arc<Mutex<Vec<SequenceEvent>>>,
        pub(crate) finished: Arc<Mutex<bool>>,
        pub(crate) context: Arc<Mutex<Option<String>>>,
    }

    impl SequenceReporter for RecordingReporter {
        fn report_event(&mut self, event: SequenceEvent) {
            self.events.lock().push(event);
        }

        fn set_context(&mut self, context: String) {
            *self.context.lock() = Some(context);
        }

        fn finish(&mut self) {
            *self.finished.lock() = true;
        }
    }

    fn started() -> SequenceEvent {
        SequenceEvent::StepStarted {
            task_name: "attach".to_string(),
            index: 0,
            step_name: "open session".to_string(),
        }
    }

    #[test]
    fn test_tracing_reporter() {
        let mut reporter = TracingReporter::new();
        reporter.set_context("session-1".to_string());
        reporter.report_event(started());
        reporter.report_event(SequenceEvent::SequenceFinished {
            task_name: "attach".to_string(),
            status: Status::ok(),
            rolled_back: false,
            duration: Duration::from_millis(1500),
        });
        assert_eq!(TracingReporter::format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(TracingReporter::format_duration(Duration::from_millis(12)), "12ms");
    }

    #[test]
    fn test_multi_reporter() {
        let first = RecordingReporter::default();
        let second = RecordingReporter::default();
        let (events1, events2) = (first.events.clone(), second.events.clone());
        let finished = first.finished.clone();

        let mut multi = MultiReporter::new().add_reporter(first).add_reporter(second);
        multi.report_event(started());
        multi.finish();

        assert_eq!(events1.lock().len(), 1);
        assert_eq!(*events2.lock(), vec![started()]);
        assert!(*finished.lock());
    }

    #[test]
    fn test_no_op_reporter() {
        let mut reporter = NoOpReporter;
        reporter.report_event(started());
        reporter.set_context("ignored".to_string());
        reporter.finish();
    }
}
