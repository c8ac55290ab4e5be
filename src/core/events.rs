//! Typed lifecycle events and the bus that fans them out.
//!
//! The scheduler and its child supervisors publish every observable state
//! change here. Subscribers (the CLI presenter, tests, embedders) receive
//! clones over a broadcast channel; the scheduler never blocks on a slow
//! subscriber.

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::process::ResourceSample;
use crate::core::scheduler::ExecutionStatistics;
use crate::core::task::OutputLine;
use crate::error::ErrorReport;

/// Default broadcast capacity. A subscriber that falls more than this many
/// events behind observes `RecvError::Lagged` and skips ahead; the
/// scheduler is never stalled.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Every event emitted during an execution.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Execution accepted a batch and is about to admit tasks.
    ExecutionStart {
        execution_id: Uuid,
        total_tasks: usize,
    },
    /// Every task reached a terminal state.
    ExecutionComplete {
        execution_id: Uuid,
        successful: usize,
        failed: usize,
        killed: usize,
        duration_ms: u64,
    },
    /// `stop` was invoked; supervisors are being terminated.
    ExecutionStopping { signal: i32 },
    /// All stop signalling finished.
    ExecutionStopped,
    /// Admissions suspended.
    ExecutionPaused,
    /// Admissions resumed.
    ExecutionResumed,
    /// The global timeout fired.
    ExecutionGlobalTimeout { timeout_ms: u64 },
    /// Aggregate statistics snapshot (emitted on completion in verbose runs).
    ExecutionStatistics(ExecutionStatistics),
    /// A batch-level error that aborts the execution.
    ExecutionError(ErrorReport),

    /// A task's child process was spawned.
    TaskStart {
        identifier: String,
        pid: u32,
        command: String,
    },
    /// One line of child output.
    TaskOutput(OutputLine),
    /// A task reached `completed`.
    TaskComplete {
        identifier: String,
        exit_code: i32,
        duration_ms: u64,
    },
    /// A task attempt failed (may be retried).
    TaskError {
        identifier: String,
        report: ErrorReport,
    },
    /// A failed attempt is being retried after the configured delay.
    TaskRetry {
        identifier: String,
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
    },
    /// The per-task timeout fired; termination is in progress.
    TaskTimeout {
        identifier: String,
        timeout_ms: u64,
    },
    /// A task was transitioned to `killed`.
    TaskKilled { identifier: String },
    /// A task exhausted its retries (or retries are disabled).
    TaskFailedPermanently {
        identifier: String,
        exit_code: i32,
        retries: u32,
    },
    /// A termination signal was delivered to a task's child.
    TaskTerminated { identifier: String, signal: i32 },
    /// Periodic resource sample for a running child.
    TaskResourceCheck {
        identifier: String,
        sample: ResourceSample,
    },
    /// Resource sampling failed (non-fatal).
    TaskMonitorWarning {
        identifier: String,
        message: String,
    },
    /// Package manager resolution produced a non-fatal warning.
    TaskPmResolutionWarning {
        identifier: String,
        message: String,
    },
    /// Command screening passed but flagged something worth surfacing
    /// (chained shell operators).
    TaskCommandWarning {
        identifier: String,
        message: String,
    },
    /// All of a task's dependencies completed; it is admissible.
    TaskDependenciesSatisfied { identifier: String },
}

impl TaskEvent {
    /// The wire-style event name, e.g. `"task:start"`.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::ExecutionStart { .. } => "execution:start",
            TaskEvent::ExecutionComplete { .. } => "execution:complete",
            TaskEvent::ExecutionStopping { .. } => "execution:stopping",
            TaskEvent::ExecutionStopped => "execution:stopped",
            TaskEvent::ExecutionPaused => "execution:paused",
            TaskEvent::ExecutionResumed => "execution:resumed",
            TaskEvent::ExecutionGlobalTimeout { .. } => "execution:global-timeout",
            TaskEvent::ExecutionStatistics(_) => "execution:statistics",
            TaskEvent::ExecutionError(_) => "execution:error",
            TaskEvent::TaskStart { .. } => "task:start",
            TaskEvent::TaskOutput(_) => "task:output",
            TaskEvent::TaskComplete { .. } => "task:complete",
            TaskEvent::TaskError { .. } => "task:error",
            TaskEvent::TaskRetry { .. } => "task:retry",
            TaskEvent::TaskTimeout { .. } => "task:timeout",
            TaskEvent::TaskKilled { .. } => "task:killed",
            TaskEvent::TaskFailedPermanently { .. } => "task:failed-permanently",
            TaskEvent::TaskTerminated { .. } => "task:terminated",
            TaskEvent::TaskResourceCheck { .. } => "task:resource-check",
            TaskEvent::TaskMonitorWarning { .. } => "task:monitor-warning",
            TaskEvent::TaskPmResolutionWarning { .. } => "task:pm-resolution-warning",
            TaskEvent::TaskCommandWarning { .. } => "task:command-warning",
            TaskEvent::TaskDependenciesSatisfied { .. } => "task:dependencies-satisfied",
        }
    }

    /// The task identifier carried by task-scoped events.
    pub fn task_identifier(&self) -> Option<&str> {
        match self {
            TaskEvent::TaskStart { identifier, .. }
            | TaskEvent::TaskComplete { identifier, .. }
            | TaskEvent::TaskError { identifier, .. }
            | TaskEvent::TaskRetry { identifier, .. }
            | TaskEvent::TaskTimeout { identifier, .. }
            | TaskEvent::TaskKilled { identifier }
            | TaskEvent::TaskFailedPermanently { identifier, .. }
            | TaskEvent::TaskTerminated { identifier, .. }
            | TaskEvent::TaskResourceCheck { identifier, .. }
            | TaskEvent::TaskMonitorWarning { identifier, .. }
            | TaskEvent::TaskPmResolutionWarning { identifier, .. }
            | TaskEvent::TaskCommandWarning { identifier, .. }
            | TaskEvent::TaskDependenciesSatisfied { identifier } => Some(identifier),
            TaskEvent::TaskOutput(line) => Some(&line.identifier),
            _ => None,
        }
    }
}

/// Broadcast fan-out for [`TaskEvent`]s.
///
/// Cloning the bus is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Create a bus with [`EVENT_BUS_CAPACITY`] buffered events.
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    /// Create a bus with an explicit capacity.
    ///
    /// Subscribers that lag behind by more than `capacity` events skip the
    /// missed events instead of stalling publishers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: TaskEvent) {
        log::debug!("event {}", event.name());
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(TaskEvent::ExecutionStopped);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "execution:stopped");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(TaskEvent::ExecutionPaused);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_instead_of_blocking() {
        let bus = EventBus::with_capacity(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(TaskEvent::ExecutionPaused);
        }
        // First recv reports the lag, subsequent recvs deliver what's left.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped >= 1),
            Ok(_) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_event_names() {
        let event = TaskEvent::TaskKilled {
            identifier: "a".into(),
        };
        assert_eq!(event.name(), "task:killed");
        assert_eq!(event.task_identifier(), Some("a"));
        assert_eq!(TaskEvent::ExecutionStopped.task_identifier(), None);
    }
}
