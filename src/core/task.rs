//! Task data model: configuration, runtime state and results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::pm::PackageManagerKind;

/// Exit code reported for tasks that were killed.
pub const EXIT_CODE_KILLED: i32 = 130;
/// Exit code reported for tasks that never started.
pub const EXIT_CODE_NEVER_STARTED: i32 = 2;
/// Exit code reported for failures with no child exit status.
pub const EXIT_CODE_GENERIC_FAILURE: i32 = 1;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Which child stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Stdout => write!(f, "stdout"),
            OutputKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// One captured line of child output, without its trailing newline.
#[derive(Debug, Clone)]
pub struct OutputLine {
    /// Identifier of the task that produced the line
    pub identifier: String,
    /// Line content, `\r?\n` stripped
    pub content: String,
    /// Originating stream
    pub kind: OutputKind,
    /// Milliseconds since the Unix epoch at emit time
    pub timestamp_ms: u64,
    /// Prefixed/colored presentation string
    pub formatted: String,
}

/// Lifecycle states of a task.
///
/// Transitions are driven solely by the scheduler: `Pending → Running`,
/// then exactly one of `Completed`, `Failed` or `Killed`. A retry resets
/// `Failed`-bound tasks back to `Pending` before they become permanent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
}

impl TaskStatus {
    /// Whether this status is one of the terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Killed
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Killed => write!(f, "killed"),
        }
    }
}

/// User-supplied description of one task.
///
/// # Examples
///
/// ```rust
/// use taskly_cli::core::task::TaskConfig;
///
/// let task = TaskConfig::new("echo hello").with_identifier("greet");
/// assert_eq!(task.identifier.as_deref(), Some("greet"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskConfig {
    /// Shell command to run (non-empty after trimming)
    pub command: String,
    /// Unique identifier within the batch; derived from the command when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Color name, `#RRGGBB` or `rgb(r,g,b)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Preferred package manager for this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<PackageManagerKind>,
    /// Working directory; must exist at preparation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables overlaid on the parent environment
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl TaskConfig {
    /// Create a task config for the given command.
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
            identifier: None,
            color: None,
            package_manager: None,
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Set an explicit identifier.
    pub fn with_identifier<S: Into<String>>(mut self, identifier: S) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Set a color specification.
    pub fn with_color<S: Into<String>>(mut self, color: S) -> Self {
        self.color = Some(color.into());
        self
    }

    /// Set a preferred package manager.
    pub fn with_package_manager(mut self, pm: PackageManagerKind) -> Self {
        self.package_manager = Some(pm);
        self
    }

    /// Set the working directory.
    pub fn with_cwd<P: Into<PathBuf>>(mut self, cwd: P) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add one environment variable to the overlay.
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The trimmed command, used everywhere after validation.
    pub fn trimmed_command(&self) -> &str {
        self.command.trim()
    }
}

/// Derive an identifier from a command and its submission index.
///
/// The first whitespace-separated token is sanitized down to its ASCII
/// alphanumerics; an empty survivor falls back to `task`. The index keeps
/// derived identifiers unique across a batch of identical commands.
pub fn derive_identifier(command: &str, index: usize) -> String {
    let first_token = command.split_whitespace().next().unwrap_or("");
    let sanitized: String = first_token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let stem = if sanitized.is_empty() {
        "task".to_string()
    } else {
        sanitized
    };
    format!("{stem}-{index}")
}

/// Pid and spawn time of a running child.
#[derive(Debug, Clone, Copy)]
pub struct ProcessInfo {
    /// OS process id of the shell wrapper
    pub pid: u32,
    /// Milliseconds since the Unix epoch at spawn
    pub start_time_ms: u64,
}

/// Final per-task outcome returned from an execution.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Identifier of the task
    pub identifier: String,
    /// Exit code: 0 for completed, 130 for killed, 2 for never started
    pub exit_code: i32,
    /// Captured output lines in emit order
    pub output: Vec<OutputLine>,
    /// Wall time between start and end, in milliseconds
    pub duration_ms: u64,
    /// Milliseconds since the Unix epoch when the task started (0 if never)
    pub start_time_ms: u64,
    /// Milliseconds since the Unix epoch when the task ended
    pub end_time_ms: u64,
    /// Failure description, when the task did not complete
    pub error: Option<String>,
    /// Number of retry attempts consumed
    pub retries: u32,
}

impl TaskResult {
    /// Whether the task completed successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Concatenate the captured lines of one stream.
    pub fn stream_text(&self, kind: OutputKind) -> String {
        self.output
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| l.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runtime state of one task inside the scheduler.
///
/// Created during batch preparation and destroyed when `execute` returns.
#[derive(Debug, Clone)]
pub struct TaskState {
    /// Resolved unique identifier
    pub identifier: String,
    /// The bound configuration
    pub config: TaskConfig,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Child process info while running
    pub process: Option<ProcessInfo>,
    /// Final result once terminal
    pub result: Option<TaskResult>,
    /// Milliseconds since the Unix epoch at first admission
    pub start_time_ms: Option<u64>,
    /// Milliseconds since the Unix epoch at terminal transition
    pub end_time_ms: Option<u64>,
    /// Retry attempts consumed so far
    pub retry_attempt: u32,
    /// Submission index, used for deterministic ordering
    pub index: usize,
    /// Effective command after package manager rewriting
    pub effective_command: String,
    /// The package manager resolution, when one was requested
    pub resolved_pm: Option<PackageManagerKind>,
}

impl TaskState {
    /// Bind a config to its resolved identifier and submission index.
    pub fn new(identifier: String, config: TaskConfig, index: usize) -> Self {
        let effective_command = config.trimmed_command().to_string();
        Self {
            identifier,
            config,
            status: TaskStatus::Pending,
            process: None,
            result: None,
            start_time_ms: None,
            end_time_ms: None,
            retry_attempt: 0,
            index,
            effective_command,
            resolved_pm: None,
        }
    }
}
