//! The parallel task scheduler.
//!
//! `execute` validates a batch, orders it by dependencies, admits tasks
//! under the concurrency limit, drives retries and cancellation policies,
//! and aggregates per-task results. All state mutations happen under one
//! mutex; a single dispatcher loop inside `execute` reacts to supervisor
//! reports, retry timers and control calls. Events are published after the
//! lock is released.

pub mod graph;

pub use graph::{DependencyEdge, DependencyGraph};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::color::ColorFormatter;
use crate::core::events::{EventBus, TaskEvent};
use crate::core::pm::PackageManagerResolver;
use crate::core::process::{
    ChildSupervisor, SIGNAL_KILL, SpawnSpec, SupervisorOutcome, SupervisorReport,
};
use crate::core::task::{
    EXIT_CODE_GENERIC_FAILURE, EXIT_CODE_KILLED, EXIT_CODE_NEVER_STARTED, OutputLine, TaskConfig,
    TaskResult, TaskState, TaskStatus, derive_identifier, epoch_millis,
};
use crate::error::{ErrorReport, TasklyError, TasklyResult};

/// Extra slack after the global timeout before the scheduler stops
/// waiting for unreported supervisors.
const SAFETY_MARGIN: Duration = Duration::from_secs(60);

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_task_timeout_ms() -> u64 {
    300_000
}
fn default_global_timeout_ms() -> u64 {
    1_800_000
}

/// Recognized execution options.
///
/// Unknown keys are rejected at deserialization time so configuration
/// typos fail loudly instead of being silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ExecuteOptions {
    /// Kill every other task once one fails permanently
    pub kill_others_on_fail: bool,
    /// Concurrent task ceiling; `None` means unlimited
    pub max_concurrency: Option<usize>,
    /// Enable the retry controller
    pub retry_failed_tasks: bool,
    /// Retry budget per task
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay: u64,
    /// Keep admitting tasks after a permanent failure
    pub continue_on_error: bool,
    /// Per-task timeout, in milliseconds
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout: u64,
    /// Whole-batch timeout, in milliseconds
    #[serde(default = "default_global_timeout_ms")]
    pub global_timeout: u64,
    /// Dependency edges between batch tasks
    pub dependencies: Vec<DependencyEdge>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            kill_others_on_fail: false,
            max_concurrency: None,
            retry_failed_tasks: false,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay_ms(),
            continue_on_error: false,
            task_timeout: default_task_timeout_ms(),
            global_timeout: default_global_timeout_ms(),
            dependencies: Vec::new(),
        }
    }
}

impl ExecuteOptions {
    /// Validate option values.
    pub fn validate(&self) -> TasklyResult<()> {
        if self.max_concurrency == Some(0) {
            return Err(TasklyError::config(
                "maxConcurrency must be a positive integer",
            ));
        }
        if self.task_timeout == 0 {
            return Err(TasklyError::config("taskTimeout must be positive"));
        }
        if self.global_timeout == 0 {
            return Err(TasklyError::config("globalTimeout must be positive"));
        }
        Ok(())
    }
}

/// Coarse scheduler phase, reported by [`Scheduler::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// No execution in flight.
    Idle,
    /// Tasks are being admitted and driven.
    Running,
    /// Admissions suspended by `pause`.
    Paused,
    /// `stop` was requested; draining supervisors.
    Stopping,
}

/// Aggregate counters for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionStatistics {
    /// Id of the execution being described
    pub execution_id: Uuid,
    /// Batch size
    pub total: usize,
    /// Tasks in `completed`
    pub completed: usize,
    /// Tasks in `failed`
    pub failed: usize,
    /// Tasks in `killed`
    pub killed: usize,
    /// Tasks currently running
    pub running: usize,
    /// Tasks not yet admitted
    pub pending: usize,
    /// Milliseconds since `execute` entered
    pub elapsed_ms: u64,
    /// Mean duration of terminal tasks that ran, in milliseconds
    pub average_task_duration_ms: u64,
}

enum ControlMsg {
    /// Re-run admission and the completion check.
    Tick,
    /// A retry delay elapsed for the given task.
    RetryReady(String),
}

#[derive(Default)]
struct SchedulerState {
    phase_running: bool,
    paused: bool,
    stopping: bool,
    execution_id: Uuid,
    started_ms: u64,
    options: ExecuteOptions,
    graph: DependencyGraph,
    tasks: HashMap<String, TaskState>,
    order: Vec<String>,
    ready: VecDeque<String>,
    waiting: HashSet<String>,
    retry_waiting: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    killed: HashSet<String>,
    /// Supervisors that have not yet delivered their terminal report
    live: HashSet<String>,
    supervisors: HashMap<String, Arc<ChildSupervisor>>,
    outputs: HashMap<String, Vec<OutputLine>>,
}

impl SchedulerState {
    fn should_continue(&self) -> bool {
        if self.stopping {
            return false;
        }
        self.failed.is_empty() || self.options.continue_on_error
    }

    fn concurrency_available(&self) -> bool {
        match self.options.max_concurrency {
            Some(limit) => self.running.len() < limit,
            None => true,
        }
    }

    fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    fn statistics(&self) -> ExecutionStatistics {
        let ran: Vec<u64> = self
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .filter_map(|t| match (t.start_time_ms, t.end_time_ms) {
                (Some(start), Some(end)) => Some(end.saturating_sub(start)),
                _ => None,
            })
            .collect();
        let average = if ran.is_empty() {
            0
        } else {
            ran.iter().sum::<u64>() / ran.len() as u64
        };
        ExecutionStatistics {
            execution_id: self.execution_id,
            total: self.tasks.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            killed: self.killed.len(),
            running: self.running.len(),
            pending: self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending)
                .count(),
            elapsed_ms: epoch_millis().saturating_sub(self.started_ms),
            average_task_duration_ms: average,
        }
    }
}

/// The batch executor.
///
/// One scheduler instance runs at most one execution at a time; a second
/// concurrent `execute` fails with [`TasklyError::AlreadyRunning`]. After
/// `execute` returns the instance is reusable.
pub struct Scheduler {
    events: EventBus,
    formatter: Arc<ColorFormatter>,
    resolver: Arc<PackageManagerResolver>,
    state: Arc<Mutex<SchedulerState>>,
    control_tx: Mutex<Option<mpsc::UnboundedSender<ControlMsg>>>,
}

impl Scheduler {
    /// Scheduler with system package manager probing and detected color
    /// support.
    pub fn new() -> Self {
        Self::with_parts(
            EventBus::new(),
            Arc::new(ColorFormatter::new()),
            Arc::new(PackageManagerResolver::new()),
        )
    }

    /// Scheduler with injected collaborators (used by tests and the CLI).
    pub fn with_parts(
        events: EventBus,
        formatter: Arc<ColorFormatter>,
        resolver: Arc<PackageManagerResolver>,
    ) -> Self {
        Self {
            events,
            formatter,
            resolver,
            state: Arc::new(Mutex::new(SchedulerState::default())),
            control_tx: Mutex::new(None),
        }
    }

    /// The event bus this scheduler publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// The color formatter used for output prefixes.
    pub fn formatter(&self) -> &Arc<ColorFormatter> {
        &self.formatter
    }

    /// Current coarse phase.
    pub fn status(&self) -> ExecutionStatus {
        let state = self.lock_state();
        if !state.phase_running {
            ExecutionStatus::Idle
        } else if state.stopping {
            ExecutionStatus::Stopping
        } else if state.paused {
            ExecutionStatus::Paused
        } else {
            ExecutionStatus::Running
        }
    }

    /// Counters for the execution in flight (or the last one).
    pub fn statistics(&self) -> ExecutionStatistics {
        self.lock_state().statistics()
    }

    /// Snapshot of one task's state.
    pub fn task_state(&self, identifier: &str) -> Option<TaskState> {
        self.lock_state().tasks.get(identifier).cloned()
    }

    /// Suspend admissions. Running tasks are unaffected.
    pub fn pause(&self) {
        {
            let mut state = self.lock_state();
            if !state.phase_running || state.paused {
                return;
            }
            state.paused = true;
        }
        self.events.publish(TaskEvent::ExecutionPaused);
    }

    /// Resume admissions after `pause`.
    pub fn resume(&self) {
        {
            let mut state = self.lock_state();
            if !state.phase_running || !state.paused {
                return;
            }
            state.paused = false;
        }
        self.events.publish(TaskEvent::ExecutionResumed);
        self.send_control(ControlMsg::Tick);
    }

    /// Stop the execution: transition every pending task to `killed`,
    /// clear the ready queue and signal every live supervisor.
    ///
    /// Returns once the termination requests are delivered; children are
    /// drained by the completion wait inside `execute`.
    pub fn stop(&self, signal: i32) {
        let (killed_ids, supervisors) = {
            let mut state = self.lock_state();
            if !state.phase_running || state.stopping {
                return;
            }
            state.stopping = true;
            let mut killed_ids = kill_pending(&mut state);
            let supervisors: Vec<Arc<ChildSupervisor>> =
                state.supervisors.values().cloned().collect();
            // Running tasks transition to killed now; their reports fill
            // in results later.
            let running: Vec<String> = state.running.drain().collect();
            for id in &running {
                mark_killed(&mut state, id);
            }
            killed_ids.extend(running);
            (killed_ids, supervisors)
        };

        self.events.publish(TaskEvent::ExecutionStopping { signal });
        for id in killed_ids {
            self.events.publish(TaskEvent::TaskKilled { identifier: id });
        }
        let mut sorted = supervisors;
        crate::core::process::terminate_all(&mut sorted, signal);
        self.events.publish(TaskEvent::ExecutionStopped);
        self.send_control(ControlMsg::Tick);
    }

    /// Kill one task. Manual kills are policy-neutral: they do not count
    /// as failures and never trigger kill-others.
    pub fn kill_task(&self, identifier: &str, signal: i32) -> bool {
        let (found, supervisor, was_pending) = {
            let mut state = self.lock_state();
            if !state.phase_running {
                return false;
            }
            match state.tasks.get(identifier).map(|t| t.status) {
                Some(TaskStatus::Running) => {
                    state.running.remove(identifier);
                    mark_killed(&mut state, identifier);
                    (true, state.supervisors.get(identifier).cloned(), false)
                }
                Some(TaskStatus::Pending) => {
                    state.ready.retain(|id| id != identifier);
                    state.waiting.remove(identifier);
                    state.retry_waiting.remove(identifier);
                    mark_killed(&mut state, identifier);
                    (true, None, true)
                }
                _ => (false, None, false),
            }
        };
        if !found {
            return false;
        }
        self.events.publish(TaskEvent::TaskKilled {
            identifier: identifier.to_string(),
        });
        if let Some(supervisor) = supervisor {
            supervisor.terminate(signal);
        }
        if was_pending {
            self.send_control(ControlMsg::Tick);
        }
        true
    }

    /// Execute a batch under the given options.
    ///
    /// Returns one [`TaskResult`] per task, sorted by start time, or a
    /// batch-level error (validation, cycle, missing package manager,
    /// global timeout). Per-task failures never propagate here; they are
    /// captured into results and events.
    pub async fn execute(
        &self,
        tasks: Vec<TaskConfig>,
        options: ExecuteOptions,
    ) -> TasklyResult<Vec<TaskResult>> {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<SupervisorReport>();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlMsg>();

        // Single-flight guard plus full state reset.
        {
            let mut state = self.lock_state();
            if state.phase_running {
                return Err(TasklyError::AlreadyRunning);
            }
            *state = SchedulerState {
                phase_running: true,
                execution_id: Uuid::new_v4(),
                started_ms: epoch_millis(),
                options: options.clone(),
                ..SchedulerState::default()
            };
        }
        *self.control_tx.lock().expect("control poisoned") = Some(control_tx.clone());

        let prepared = self.prepare_batch(tasks, &options).await;
        if let Err(error) = prepared {
            self.publish_execution_error(&error);
            self.finish_execution();
            return Err(error);
        }

        let total = {
            let state = self.lock_state();
            state.tasks.len()
        };
        let execution_id = { self.lock_state().execution_id };
        self.events.publish(TaskEvent::ExecutionStart {
            execution_id,
            total_tasks: total,
        });

        self.admit_ready(&report_tx);

        let global_deadline = Instant::now() + Duration::from_millis(options.global_timeout);
        let safety_deadline = global_deadline + SAFETY_MARGIN;
        let mut global_timed_out = false;

        loop {
            if self.execution_finished() {
                break;
            }
            tokio::select! {
                Some(report) = report_rx.recv() => {
                    self.handle_report(report, &control_tx, &report_tx);
                }
                Some(msg) = control_rx.recv() => {
                    match msg {
                        ControlMsg::Tick => {}
                        ControlMsg::RetryReady(id) => self.handle_retry_ready(&id),
                    }
                    self.admit_ready(&report_tx);
                }
                _ = tokio::time::sleep_until(global_deadline), if !global_timed_out => {
                    global_timed_out = true;
                    self.events.publish(TaskEvent::ExecutionGlobalTimeout {
                        timeout_ms: options.global_timeout,
                    });
                    self.stop(SIGNAL_KILL);
                }
                _ = tokio::time::sleep_until(safety_deadline), if global_timed_out => {
                    // A supervisor failed to report; abandon the drain.
                    log::warn!("safety timer fired with unreported supervisors");
                    break;
                }
            }
        }

        let results = self.collect_results();
        let statistics = self.lock_state().statistics();
        self.events
            .publish(TaskEvent::ExecutionStatistics(statistics.clone()));
        self.events.publish(TaskEvent::ExecutionComplete {
            execution_id,
            successful: statistics.completed,
            failed: statistics.failed,
            killed: statistics.killed,
            duration_ms: statistics.elapsed_ms,
        });
        self.finish_execution();

        if global_timed_out {
            let error = TasklyError::system(format!(
                "execution exceeded the global timeout of {} ms",
                options.global_timeout
            ));
            self.publish_execution_error(&error);
            return Err(error);
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // Batch preparation
    // ------------------------------------------------------------------

    async fn prepare_batch(
        &self,
        tasks: Vec<TaskConfig>,
        options: &ExecuteOptions,
    ) -> TasklyResult<()> {
        options.validate()?;
        if tasks.is_empty() {
            return Err(TasklyError::validation("task list must not be empty"));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut prepared: Vec<TaskState> = Vec::with_capacity(tasks.len());
        for (index, config) in tasks.into_iter().enumerate() {
            let command = config.trimmed_command().to_string();
            if command.is_empty() {
                return Err(TasklyError::validation(format!(
                    "task at index {index} has an empty command"
                )));
            }
            let identifier = match &config.identifier {
                Some(explicit) => {
                    let trimmed = explicit.trim().to_string();
                    if trimmed.is_empty() {
                        return Err(TasklyError::validation(format!(
                            "task at index {index} has an empty identifier"
                        )));
                    }
                    trimmed
                }
                None => derive_identifier(&command, index),
            };
            if !seen.insert(identifier.clone()) {
                return Err(TasklyError::validation(format!(
                    "duplicate task identifier: {identifier}"
                )));
            }
            if let Some(cwd) = &config.cwd {
                if !cwd.is_dir() {
                    return Err(TasklyError::validation(format!(
                        "working directory for task {identifier} does not exist: {}",
                        cwd.display()
                    )));
                }
            }
            prepared.push(TaskState::new(identifier, config, index));
        }

        // Package manager confirmation and command rewriting.
        for task in &mut prepared {
            if let Some(preferred) = task.config.package_manager {
                let cwd = task
                    .config
                    .cwd
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("."));
                let resolution = self.resolver.resolve(Some(preferred), &cwd).await?;
                if let Some(warning) = &resolution.warning {
                    self.events.publish(TaskEvent::TaskPmResolutionWarning {
                        identifier: task.identifier.clone(),
                        message: warning.clone(),
                    });
                }
                task.resolved_pm = Some(resolution.package_manager);
                task.effective_command = PackageManagerResolver::rewrite_command(
                    resolution.package_manager,
                    &task.effective_command,
                );
            }
        }

        for task in &prepared {
            self.formatter
                .register(&task.identifier, task.config.color.as_deref())?;
        }

        let ordered_ids: Vec<String> = prepared.iter().map(|t| t.identifier.clone()).collect();
        let graph = DependencyGraph::build(&options.dependencies, &ordered_ids)?;
        let topo = graph.topological_order(&ordered_ids);

        let mut state = self.lock_state();
        state.order = ordered_ids;
        for task in prepared {
            state.tasks.insert(task.identifier.clone(), task);
        }
        for id in topo {
            if graph.dependencies_of(&id).is_empty() {
                state.ready.push_back(id);
            } else {
                state.waiting.insert(id);
            }
        }
        state.graph = graph;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn admit_ready(&self, report_tx: &mpsc::UnboundedSender<SupervisorReport>) {
        // Admission errors are handled per-task and may re-enter the
        // failure path, so loop until no more work is admissible.
        loop {
            let next = {
                let mut state = self.lock_state();
                if state.paused
                    || state.stopping
                    || !state.should_continue()
                    || !state.concurrency_available()
                {
                    None
                } else {
                    state.ready.pop_front()
                }
            };
            let Some(id) = next else { break };
            self.admit_one(&id, report_tx);
        }
        self.reap_unreachable();
    }

    fn admit_one(&self, identifier: &str, report_tx: &mpsc::UnboundedSender<SupervisorReport>) {
        let spec = {
            let mut state = self.lock_state();
            let timeout_ms = state.options.task_timeout;
            let Some(task) = state.tasks.get_mut(identifier) else {
                return;
            };
            task.status = TaskStatus::Running;
            if task.start_time_ms.is_none() {
                task.start_time_ms = Some(epoch_millis());
            }
            let spec = SpawnSpec {
                identifier: task.identifier.clone(),
                command: task.effective_command.clone(),
                cwd: task.config.cwd.clone(),
                env_overlay: task.config.env.clone(),
                env_additions: self.child_env_additions(task),
                timeout: Duration::from_millis(timeout_ms),
            };
            state.running.insert(identifier.to_string());
            spec
        };

        match ChildSupervisor::spawn(
            spec,
            self.events.clone(),
            Arc::clone(&self.formatter),
            report_tx.clone(),
        ) {
            Ok(supervisor) => {
                let mut state = self.lock_state();
                if let Some(task) = state.tasks.get_mut(identifier) {
                    task.process = Some(crate::core::task::ProcessInfo {
                        pid: supervisor.pid(),
                        start_time_ms: epoch_millis(),
                    });
                }
                state.live.insert(identifier.to_string());
                state
                    .supervisors
                    .insert(identifier.to_string(), supervisor);
            }
            Err(error) => {
                {
                    let mut state = self.lock_state();
                    state.running.remove(identifier);
                }
                self.handle_attempt_failure(
                    identifier,
                    EXIT_CODE_NEVER_STARTED,
                    error,
                    Vec::new(),
                    None,
                );
            }
        }
    }

    fn child_env_additions(&self, task: &TaskState) -> HashMap<String, String> {
        let mut additions = HashMap::new();
        additions.insert("TASKLY_TASK_ID".to_string(), task.identifier.clone());
        additions.insert(
            "TASKLY_TASK_COMMAND".to_string(),
            task.effective_command.clone(),
        );
        let cwd = task
            .config
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        additions.insert("TASKLY_TASK_CWD".to_string(), cwd);
        if let Some(pm) = task.resolved_pm {
            additions.insert("TASKLY_PACKAGE_MANAGER".to_string(), pm.to_string());
        }
        if self.formatter.supports_color() {
            if let Some(spec) = self.formatter.color_spec(&task.identifier) {
                additions.insert("TASKLY_TASK_COLOR".to_string(), spec);
            }
            if let Some(code) = self.formatter.ansi_code(&task.identifier) {
                additions.insert("TASKLY_TASK_ANSI_CODE".to_string(), code);
            }
        }
        additions
    }

    // ------------------------------------------------------------------
    // Terminal handling
    // ------------------------------------------------------------------

    fn handle_report(
        &self,
        report: SupervisorReport,
        control_tx: &mpsc::UnboundedSender<ControlMsg>,
        report_tx: &mpsc::UnboundedSender<SupervisorReport>,
    ) {
        let identifier = report.identifier.clone();
        let was_marked_killed = {
            let mut state = self.lock_state();
            state.live.remove(&identifier);
            state.supervisors.remove(&identifier);
            state
                .outputs
                .entry(identifier.clone())
                .or_default()
                .extend(report.output.iter().cloned());
            state
                .tasks
                .get(&identifier)
                .map(|t| t.status == TaskStatus::Killed)
                .unwrap_or(false)
        };

        if was_marked_killed {
            // Kill-others, stop or kill_task already transitioned the
            // task; the report only fills in the result.
            let mut state = self.lock_state();
            let output = state.outputs.remove(&identifier).unwrap_or_default();
            if let Some(task) = state.tasks.get_mut(&identifier) {
                let end = report.ended_ms;
                task.end_time_ms = Some(end);
                task.result = Some(TaskResult {
                    identifier: identifier.clone(),
                    exit_code: EXIT_CODE_KILLED,
                    output,
                    duration_ms: end.saturating_sub(report.started_ms),
                    start_time_ms: report.started_ms,
                    end_time_ms: end,
                    error: Some("killed".to_string()),
                    retries: task.retry_attempt,
                });
            }
            drop(state);
            self.admit_ready(report_tx);
            return;
        }

        match report.outcome {
            SupervisorOutcome::Exited { exit_code: 0 } => {
                self.handle_success(&identifier, &report);
                self.admit_ready(report_tx);
            }
            SupervisorOutcome::Exited { exit_code } => {
                let error = TasklyError::TaskFailed {
                    task_id: identifier.clone(),
                    exit_code,
                };
                self.fail_or_retry(&identifier, exit_code, error, &report, control_tx);
                self.admit_ready(report_tx);
            }
            SupervisorOutcome::TimedOut { exit_code } => {
                let timeout_ms = { self.lock_state().options.task_timeout };
                let error = TasklyError::ProcessTimeout {
                    task_id: identifier.clone(),
                    timeout_ms,
                };
                self.fail_or_retry(&identifier, exit_code, error, &report, control_tx);
                self.admit_ready(report_tx);
            }
            SupervisorOutcome::TerminatedBySignal { signal } => {
                let exit_code = 128 + signal;
                let error = TasklyError::TaskFailed {
                    task_id: identifier.clone(),
                    exit_code,
                };
                self.fail_or_retry(&identifier, exit_code, error, &report, control_tx);
                self.admit_ready(report_tx);
            }
        }
    }

    fn handle_success(&self, identifier: &str, report: &SupervisorReport) {
        let (duration_ms, newly_satisfied) = {
            let mut state = self.lock_state();
            state.running.remove(identifier);
            state.completed.insert(identifier.to_string());
            let output = state.outputs.remove(identifier).unwrap_or_default();
            let mut duration_ms = 0;
            if let Some(task) = state.tasks.get_mut(identifier) {
                task.status = TaskStatus::Completed;
                task.end_time_ms = Some(report.ended_ms);
                duration_ms = report.ended_ms.saturating_sub(report.started_ms);
                task.result = Some(TaskResult {
                    identifier: identifier.to_string(),
                    exit_code: 0,
                    output,
                    duration_ms,
                    start_time_ms: report.started_ms,
                    end_time_ms: report.ended_ms,
                    error: None,
                    retries: task.retry_attempt,
                });
            }
            let newly_satisfied = unblock_dependents(&mut state, identifier);
            (duration_ms, newly_satisfied)
        };

        self.events.publish(TaskEvent::TaskComplete {
            identifier: identifier.to_string(),
            exit_code: 0,
            duration_ms,
        });
        for dependent in newly_satisfied {
            self.events
                .publish(TaskEvent::TaskDependenciesSatisfied { identifier: dependent });
        }
    }

    fn fail_or_retry(
        &self,
        identifier: &str,
        exit_code: i32,
        error: TasklyError,
        report: &SupervisorReport,
        control_tx: &mpsc::UnboundedSender<ControlMsg>,
    ) {
        let output = {
            let mut state = self.lock_state();
            state.running.remove(identifier);
            state.outputs.remove(identifier).unwrap_or_default()
        };
        self.handle_attempt_failure(
            identifier,
            exit_code,
            error,
            output,
            Some((report.started_ms, report.ended_ms, control_tx.clone())),
        );
    }

    /// Shared failure path for spawn errors and non-zero exits.
    ///
    /// `timing` is absent for admission-time failures that never produced
    /// a report (and therefore cannot be retried asynchronously without a
    /// control channel).
    fn handle_attempt_failure(
        &self,
        identifier: &str,
        exit_code: i32,
        error: TasklyError,
        output: Vec<OutputLine>,
        timing: Option<(u64, u64, mpsc::UnboundedSender<ControlMsg>)>,
    ) {
        let report = ErrorReport::capture(&error, self.error_context(identifier, exit_code));
        self.events.publish(TaskEvent::TaskError {
            identifier: identifier.to_string(),
            report,
        });

        let retry_plan = {
            let mut state = self.lock_state();
            let options = state.options.clone();
            let Some(task) = state.tasks.get_mut(identifier) else {
                return;
            };
            if options.retry_failed_tasks
                && error.is_recoverable()
                && task.retry_attempt < options.max_retries
            {
                task.retry_attempt += 1;
                task.result = None;
                task.status = TaskStatus::Pending;
                let attempt = task.retry_attempt;
                state.retry_waiting.insert(identifier.to_string());
                Some((attempt, options.max_retries, options.retry_delay))
            } else {
                let end = timing
                    .as_ref()
                    .map(|(_, end, _)| *end)
                    .unwrap_or_else(epoch_millis);
                let start = timing.as_ref().map(|(start, _, _)| *start).unwrap_or(0);
                task.status = TaskStatus::Failed;
                task.end_time_ms = Some(end);
                let retries = task.retry_attempt;
                task.result = Some(TaskResult {
                    identifier: identifier.to_string(),
                    exit_code,
                    output,
                    duration_ms: end.saturating_sub(start),
                    start_time_ms: start,
                    end_time_ms: end,
                    error: Some(error.user_friendly_message()),
                    retries,
                });
                state.failed.insert(identifier.to_string());
                None
            }
        };

        match retry_plan {
            Some((attempt, max_retries, delay_ms)) => {
                self.events.publish(TaskEvent::TaskRetry {
                    identifier: identifier.to_string(),
                    attempt,
                    max_retries,
                    delay_ms,
                });
                if let Some((_, _, control)) = timing {
                    let id = identifier.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = control.send(ControlMsg::RetryReady(id));
                    });
                } else if let Some(control) = self.control_sender() {
                    let id = identifier.to_string();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        let _ = control.send(ControlMsg::RetryReady(id));
                    });
                }
            }
            None => {
                let retries = {
                    self.lock_state()
                        .tasks
                        .get(identifier)
                        .map(|t| t.retry_attempt)
                        .unwrap_or(0)
                };
                self.events.publish(TaskEvent::TaskFailedPermanently {
                    identifier: identifier.to_string(),
                    exit_code,
                    retries,
                });
                let (kill_others, continue_on_error) = {
                    let state = self.lock_state();
                    (
                        state.options.kill_others_on_fail,
                        state.options.continue_on_error,
                    )
                };
                // kill-others dominates only while continue-on-error is
                // off; with both set, siblings keep running.
                if kill_others && !continue_on_error {
                    self.kill_others(identifier);
                }
            }
        }
    }

    fn kill_others(&self, trigger: &str) {
        let (killed_ids, supervisors) = {
            let mut state = self.lock_state();
            let mut killed_ids = Vec::new();
            let running: Vec<String> = state
                .running
                .iter()
                .filter(|id| id.as_str() != trigger)
                .cloned()
                .collect();
            for id in running {
                state.running.remove(&id);
                mark_killed(&mut state, &id);
                killed_ids.push(id);
            }
            killed_ids.extend(kill_pending(&mut state));
            let supervisors: Vec<Arc<ChildSupervisor>> =
                state.supervisors.values().cloned().collect();
            (killed_ids, supervisors)
        };

        for id in killed_ids {
            self.events.publish(TaskEvent::TaskKilled { identifier: id });
        }
        let mut sorted = supervisors;
        crate::core::process::terminate_all(&mut sorted, SIGNAL_KILL);
    }

    fn handle_retry_ready(&self, identifier: &str) {
        let requeued = {
            let mut state = self.lock_state();
            if state.retry_waiting.remove(identifier)
                && state
                    .tasks
                    .get(identifier)
                    .map(|t| t.status == TaskStatus::Pending)
                    .unwrap_or(false)
            {
                // Retried tasks take priority over fresh work.
                state.ready.push_front(identifier.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            log::debug!("task {identifier} re-enqueued for retry");
        }
    }

    /// Tasks waiting on a dependency that failed or was killed can never
    /// run; transition them to `killed` so the execution can finish.
    fn reap_unreachable(&self) {
        let reaped: Vec<String> = {
            let mut state = self.lock_state();
            let blocked: Vec<String> = state
                .waiting
                .iter()
                .filter(|id| {
                    state.graph.dependencies_of(id).iter().any(|dep| {
                        state.failed.contains(dep) || state.killed.contains(dep)
                    })
                })
                .cloned()
                .collect();
            for id in &blocked {
                state.waiting.remove(id);
                mark_killed(&mut state, id);
            }
            blocked
        };
        for id in reaped {
            self.events.publish(TaskEvent::TaskKilled { identifier: id });
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    fn execution_finished(&self) -> bool {
        let mut state = self.lock_state();
        if !state.live.is_empty() {
            return false;
        }
        if state.all_terminal() {
            return true;
        }
        if state.should_continue() {
            // Admissible work remains: queued tasks, pending retry
            // timers, waiting dependency chains, or a pause to resume.
            return false;
        }
        // No more admissions will happen; transition the remainder.
        let remainder = kill_pending(&mut state);
        drop(state);
        for id in remainder {
            self.events.publish(TaskEvent::TaskKilled { identifier: id });
        }
        true
    }

    fn collect_results(&self) -> Vec<TaskResult> {
        let mut state = self.lock_state();
        let mut results: Vec<(u64, usize, TaskResult)> = Vec::with_capacity(state.tasks.len());
        let ids: Vec<String> = state.order.clone();
        for id in ids {
            let task = state
                .tasks
                .get(&id)
                .cloned()
                .expect("task state must exist");
            let index = task.index;
            let sort_key = task.start_time_ms.unwrap_or(u64::MAX);
            let result = match task.result {
                Some(result) => result,
                None => {
                    // Never started: killed before admission or unreported.
                    let output = state.outputs.remove(&id).unwrap_or_default();
                    TaskResult {
                        identifier: id.clone(),
                        exit_code: if task.status == TaskStatus::Killed {
                            EXIT_CODE_NEVER_STARTED
                        } else {
                            EXIT_CODE_GENERIC_FAILURE
                        },
                        output,
                        duration_ms: 0,
                        start_time_ms: task.start_time_ms.unwrap_or(0),
                        end_time_ms: task.end_time_ms.unwrap_or_else(epoch_millis),
                        error: Some("task never started".to_string()),
                        retries: task.retry_attempt,
                    }
                }
            };
            results.push((sort_key, index, result));
        }
        results.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        results.into_iter().map(|(_, _, r)| r).collect()
    }

    fn finish_execution(&self) {
        *self.control_tx.lock().expect("control poisoned") = None;
        let mut state = self.lock_state();
        state.phase_running = false;
        state.stopping = false;
        state.paused = false;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().expect("scheduler state poisoned")
    }

    fn control_sender(&self) -> Option<mpsc::UnboundedSender<ControlMsg>> {
        self.control_tx.lock().expect("control poisoned").clone()
    }

    fn send_control(&self, msg: ControlMsg) {
        if let Some(tx) = self.control_sender() {
            let _ = tx.send(msg);
        }
    }

    fn error_context(&self, identifier: &str, exit_code: i32) -> HashMap<String, String> {
        let state = self.lock_state();
        let mut context = HashMap::new();
        context.insert("taskId".to_string(), identifier.to_string());
        context.insert("exitCode".to_string(), exit_code.to_string());
        if let Some(task) = state.tasks.get(identifier) {
            context.insert("command".to_string(), task.effective_command.clone());
            context.insert("retryAttempt".to_string(), task.retry_attempt.to_string());
            if let Some(cwd) = &task.config.cwd {
                context.insert("cwd".to_string(), cwd.display().to_string());
            }
            if let Some(pm) = task.resolved_pm {
                context.insert("packageManager".to_string(), pm.to_string());
            }
        }
        context
    }

    fn publish_execution_error(&self, error: &TasklyError) {
        let report = ErrorReport::capture(error, HashMap::new());
        self.events.publish(TaskEvent::ExecutionError(report));
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Transition a task to `killed` and record it in the killed set.
fn mark_killed(state: &mut SchedulerState, identifier: &str) {
    if let Some(task) = state.tasks.get_mut(identifier) {
        if !task.status.is_terminal() {
            task.status = TaskStatus::Killed;
            task.end_time_ms = Some(epoch_millis());
        }
    }
    state.killed.insert(identifier.to_string());
}

/// Kill every not-yet-admitted task; returns the affected identifiers.
fn kill_pending(state: &mut SchedulerState) -> Vec<String> {
    let mut affected: Vec<String> = Vec::new();
    let ready: Vec<String> = state.ready.drain(..).collect();
    affected.extend(ready);
    affected.extend(state.waiting.drain());
    affected.extend(state.retry_waiting.drain());
    for id in &affected {
        mark_killed(state, id);
    }
    affected
}

/// Move dependents whose predecessors are now all complete from waiting
/// to the ready queue; returns them in submission order.
fn unblock_dependents(state: &mut SchedulerState, completed_id: &str) -> Vec<String> {
    let mut satisfied: Vec<String> = state
        .graph
        .dependents_of(completed_id)
        .iter()
        .filter(|dep| state.waiting.contains(*dep))
        .filter(|dep| {
            state
                .graph
                .dependencies_of(dep)
                .iter()
                .all(|pred| state.completed.contains(pred))
        })
        .cloned()
        .collect();
    satisfied.sort_by_key(|id| state.tasks.get(id).map(|t| t.index).unwrap_or(usize::MAX));
    for id in &satisfied {
        state.waiting.remove(id);
        state.ready.push_back(id.clone());
    }
    satisfied
}
