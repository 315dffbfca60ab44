//! Common types and configuration for the dispatcher

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Configuration for a [`DefaultDispatcher`](crate::executor::DefaultDispatcher)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Name of the dispatcher thread, also used in log records
    pub thread_name: String,

    /// Jobs running longer than this are logged as slow (None to disable)
    pub slow_job_threshold: Option<Duration>,

    /// Whether a panicking job is caught and logged instead of killing the thread
    pub catch_panics: bool,

    /// How long `shutdown` waits for the dispatcher thread to drain
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name: "taskmon-dispatch".to_string(),
            slow_job_threshold: Some(Duration::from_millis(100)),
            catch_panics: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    /// Create a new dispatcher configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dispatcher thread name
    pub fn with_thread_name<S: Into<String>>(mut self, name: S) -> ConfigResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }
        self.thread_name = name;
        Ok(self)
    }

    /// Set the slow job threshold
    pub fn with_slow_job_threshold(mut self, threshold: Duration) -> ConfigResult<Self> {
        if threshold.is_zero() {
            return Err(ConfigError::invalid_timeout(threshold));
        }
        self.slow_job_threshold = Some(threshold);
        Ok(self)
    }

    /// Disable slow job logging
    pub fn without_slow_job_logging(mut self) -> Self {
        self.slow_job_threshold = None;
        self
    }

    /// Enable or disable catching of job panics
    pub fn with_catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> ConfigResult<Self> {
        if timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(timeout));
        }
        self.shutdown_timeout = timeout;
        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.thread_name.trim().is_empty() {
            return Err(ConfigError::EmptyThreadName);
        }

        if let Some(threshold) = self.slow_job_threshold {
            if threshold.is_zero() {
                return Err(ConfigError::invalid_timeout(threshold));
            }
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(self.shutdown_timeout));
        }

        Ok(())
    }

    /// Create a configuration suited to unit tests
    pub fn for_testing() -> Self {
        Self {
            thread_name: "taskmon-test".to_string(),
            slow_job_threshold: None,
            catch_panics: true,
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// Counters collected by a running dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Jobs accepted through `execute`
    pub submitted_jobs: u64,

    /// Jobs accepted through `schedule`
    pub scheduled_jobs: u64,

    /// Jobs that ran to completion (including ones that panicked)
    pub executed_jobs: u64,

    /// Jobs refused because the dispatcher was shut down
    pub rejected_jobs: u64,

    /// Jobs that panicked
    pub panicked_jobs: u64,

    /// Jobs slower than the configured threshold
    pub slow_jobs: u64,
}

impl DispatcherStats {
    /// Jobs accepted but not yet run
    pub fn pending_jobs(&self) -> u64 {
        (self.submitted_jobs + self.scheduled_jobs).saturating_sub(self.executed_jobs)
    }
}
