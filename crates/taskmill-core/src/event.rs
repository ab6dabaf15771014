//! User-observable lifecycle events.
//!
//! The engines report through two callbacks supplied at init time: `on_error`
//! for degraded-but-retried conditions and `on_info` for lifecycle events
//! carrying one of the stable [`EventCode`]s. Neither callback may panic;
//! both are invoked from engine loops.

use std::fmt;
use std::sync::Arc;

/// Stable event codes surfaced through the `on_info` callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum EventCode {
    CronTaskStarted,
    CronTaskFinished,
    CronTaskScheduled,
    CronTaskFailed,
    ReactiveTaskStarted,
    ReactiveTaskFinished,
    ReactiveTaskFailed,
    ReactiveTaskPlannerStarted,
    ReactiveTaskPlannerStopped,
    ReactiveTaskPlannerReconciliationStarted,
    ReactiveTaskPlannerReconciliationFinished,
    ReactiveTaskPlannerStreamError,
    ReactiveTaskLeaderLockLost,
    ReactiveTaskCleanup,
    ManualTrigger,
}

impl EventCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CronTaskStarted => "cronTaskStarted",
            Self::CronTaskFinished => "cronTaskFinished",
            Self::CronTaskScheduled => "cronTaskScheduled",
            Self::CronTaskFailed => "cronTaskFailed",
            Self::ReactiveTaskStarted => "reactiveTaskStarted",
            Self::ReactiveTaskFinished => "reactiveTaskFinished",
            Self::ReactiveTaskFailed => "reactiveTaskFailed",
            Self::ReactiveTaskPlannerStarted => "reactiveTaskPlannerStarted",
            Self::ReactiveTaskPlannerStopped => "reactiveTaskPlannerStopped",
            Self::ReactiveTaskPlannerReconciliationStarted => {
                "reactiveTaskPlannerReconciliationStarted"
            }
            Self::ReactiveTaskPlannerReconciliationFinished => {
                "reactiveTaskPlannerReconciliationFinished"
            }
            Self::ReactiveTaskPlannerStreamError => "reactiveTaskPlannerStreamError",
            Self::ReactiveTaskLeaderLockLost => "reactiveTaskLeaderLockLost",
            Self::ReactiveTaskCleanup => "reactiveTaskCleanup",
            Self::ManualTrigger => "manualTrigger",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct InfoEvent {
    pub code: EventCode,
    /// Task name or cron task id the event concerns, when there is one.
    pub task: Option<String>,
    pub reason: Option<String>,
}

impl InfoEvent {
    pub fn new(code: EventCode) -> Self {
        Self {
            code,
            task: None,
            reason: None,
        }
    }

    pub fn task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A degraded condition that was handled (retried, rescheduled, or ignored)
/// rather than propagated.
#[derive(Clone, Debug)]
pub struct ErrorReport {
    /// Which component reported the error, e.g. `"lock heartbeat"`.
    pub context: &'static str,
    pub message: String,
}

pub type InfoCallback = Arc<dyn Fn(InfoEvent) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ErrorReport) + Send + Sync>;

/// Callback bundle threaded through every engine.
#[derive(Clone)]
pub struct Callbacks {
    pub on_info: InfoCallback,
    pub on_error: ErrorCallback,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_info: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        }
    }
}

impl Callbacks {
    pub fn info(&self, event: InfoEvent) {
        (self.on_info)(event);
    }

    pub fn error(&self, context: &'static str, message: impl fmt::Display) {
        (self.on_error)(ErrorReport {
            context,
            message: message.to_string(),
        });
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}
