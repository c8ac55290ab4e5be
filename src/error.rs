//! Comprehensive error types for taskly orchestration operations.
//!
//! This module defines the `TasklyError` enum covering all error conditions
//! that can occur during batch validation, package manager resolution,
//! child process supervision, and scheduling.
//!
//! It also provides helper methods to construct errors, classify their
//! severity and recoverability, and generate user-friendly messages.

use std::collections::HashMap;
use thiserror::Error;

/// Severity attached to each error kind.
///
/// Severity is advisory: it drives verbose reporting and log levels, not
/// control flow. Control flow is driven by [`TasklyError::is_recoverable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Informational problems that rarely need attention.
    Low,
    /// Misconfiguration and invalid input.
    Medium,
    /// Failures of a single task or spawn.
    High,
    /// Security violations and resource exhaustion.
    Critical,
}

/// Represents all possible errors in the taskly application.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Examples
///
/// ```rust
/// use taskly_cli::error::{TasklyError, TasklyResult};
///
/// fn example() -> TasklyResult<()> {
///     Err(TasklyError::Validation {
///         message: "duplicate task identifier: build".to_string(),
///     })
/// }
/// ```
///
/// # Exit Codes
///
/// Each error variant maps to a process exit code via
/// [`TasklyError::exit_code`]: user interrupts map to 130, everything else
/// to 1.
#[derive(Error, Debug)]
pub enum TasklyError {
    /// I/O operation failed during file system access or process control.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Batch validation failed before any task was admitted.
    ///
    /// Covers empty batches, empty commands, duplicate identifiers,
    /// unknown dependency references and dependency cycles.
    #[error("Validation error: {message}")]
    Validation {
        /// Description of the validation failure
        message: String,
    },

    /// Configuration error due to invalid, unknown or missing settings.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// No usable package manager could be found on PATH.
    #[error("Package manager not found: {package_manager}")]
    PmNotFound {
        /// The package manager that was requested or inferred
        package_manager: String,
    },

    /// Package manager detection ran but could not produce a decision.
    #[error("Package manager detection failed: {message}")]
    PmDetectionFailed {
        /// Description of the detection failure
        message: String,
    },

    /// The child process could not be created.
    #[error("Failed to run command \"{command}\"")]
    SpawnFailed {
        /// The effective command that failed to spawn
        command: String,
        /// The underlying I/O error, when available
        #[source]
        source: Option<std::io::Error>,
    },

    /// A supervised task exited with a non-zero status.
    #[error("Task {task_id} failed with exit code {exit_code}")]
    TaskFailed {
        /// Identifier of the failed task
        task_id: String,
        /// Exit code reported by the child
        exit_code: i32,
    },

    /// A supervised task exceeded its configured timeout.
    #[error("Task {task_id} timed out after {timeout_ms} ms")]
    ProcessTimeout {
        /// Identifier of the timed-out task
        task_id: String,
        /// The configured per-task timeout in milliseconds
        timeout_ms: u64,
    },

    /// The operating system denied an operation.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation
        message: String,
    },

    /// The system ran out of a resource (file descriptors, processes).
    #[error("Resource exhausted: {message}")]
    ResourceExhausted {
        /// Description of the exhausted resource
        message: String,
    },

    /// The command matched the dangerous-pattern blocklist.
    ///
    /// No child process is created when this error is raised.
    #[error("Command blocked by security screening: \"{command}\"")]
    CommandInjection {
        /// The command that was rejected
        command: String,
        /// Human-readable name of the matched pattern
        pattern: String,
    },

    /// An internal invariant was violated; the run is aborted.
    #[error("Internal error: {message}")]
    System {
        /// Description of the invariant violation
        message: String,
    },

    /// `execute` was called while another execution was in flight.
    #[error("An execution is already running on this scheduler")]
    AlreadyRunning,

    /// The run was interrupted by the user (SIGINT).
    #[error("Interrupted")]
    Interrupted,

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Specialized `Result` type for taskly operations.
pub type TasklyResult<T> = Result<T, TasklyError>;

impl TasklyError {
    /// Create a validation error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use taskly_cli::error::TasklyError;
    /// let err = TasklyError::validation("empty task list");
    /// assert_eq!(err.to_string(), "Validation error: empty task list");
    /// ```
    pub fn validation<S: Into<String>>(message: S) -> Self {
        TasklyError::Validation {
            message: message.into(),
        }
    }

    /// Create a configuration error with the given message.
    pub fn config<S: Into<String>>(message: S) -> Self {
        TasklyError::Config {
            message: message.into(),
        }
    }

    /// Create a package-manager-not-found error for the given manager.
    pub fn pm_not_found<S: Into<String>>(package_manager: S) -> Self {
        TasklyError::PmNotFound {
            package_manager: package_manager.into(),
        }
    }

    /// Create a spawn failure without an underlying cause.
    pub fn spawn_failed<S: Into<String>>(command: S) -> Self {
        TasklyError::SpawnFailed {
            command: command.into(),
            source: None,
        }
    }

    /// Create an internal error with the given message.
    pub fn system<S: Into<String>>(message: S) -> Self {
        TasklyError::System {
            message: message.into(),
        }
    }

    /// Classify a spawn-time I/O error into the taxonomy.
    ///
    /// `ENOENT` means the shell or program is missing and maps to
    /// [`TasklyError::SpawnFailed`]; `EACCES`/`EPERM` map to
    /// [`TasklyError::PermissionDenied`]; `EMFILE`/`ENFILE` map to
    /// [`TasklyError::ResourceExhausted`]. Anything else stays a spawn
    /// failure carrying the original error as its cause.
    pub fn from_spawn_error(command: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => TasklyError::SpawnFailed {
                command: command.to_string(),
                source: Some(err),
            },
            ErrorKind::PermissionDenied => TasklyError::PermissionDenied {
                message: format!("cannot execute \"{command}\": {err}"),
            },
            _ => match err.raw_os_error() {
                // EMFILE / ENFILE
                Some(24) | Some(23) => TasklyError::ResourceExhausted {
                    message: format!("cannot spawn \"{command}\": {err}"),
                },
                _ => TasklyError::SpawnFailed {
                    command: command.to_string(),
                    source: Some(err),
                },
            },
        }
    }

    /// Return the severity class of this error.
    pub fn severity(&self) -> Severity {
        match self {
            TasklyError::Validation { .. }
            | TasklyError::Config { .. }
            | TasklyError::PmNotFound { .. }
            | TasklyError::PmDetectionFailed { .. }
            | TasklyError::PermissionDenied { .. } => Severity::Medium,
            TasklyError::SpawnFailed { .. }
            | TasklyError::TaskFailed { .. }
            | TasklyError::ProcessTimeout { .. }
            | TasklyError::System { .. }
            | TasklyError::AlreadyRunning
            | TasklyError::Io(_) => Severity::High,
            TasklyError::ResourceExhausted { .. } | TasklyError::CommandInjection { .. } => {
                Severity::Critical
            }
            TasklyError::Interrupted => Severity::Low,
            TasklyError::Other(_) => Severity::High,
        }
    }

    /// Whether the retry controller may attempt recovery for this kind.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TasklyError::SpawnFailed { .. }
                | TasklyError::TaskFailed { .. }
                | TasklyError::ProcessTimeout { .. }
                | TasklyError::ResourceExhausted { .. }
                | TasklyError::System { .. }
        )
    }

    /// Return the corresponding process exit code for this error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use taskly_cli::error::TasklyError;
    /// assert_eq!(TasklyError::validation("x").exit_code(), 1);
    /// assert_eq!(TasklyError::Interrupted.exit_code(), 130);
    /// ```
    pub fn exit_code(&self) -> i32 {
        match self {
            TasklyError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Return a user-friendly error message with suggested remedies.
    pub fn user_friendly_message(&self) -> String {
        match self {
            TasklyError::Io(e) => format!("File operation error: {e}"),
            TasklyError::Validation { message } => format!(
                "Validation error: {message}\nHint: check task commands, identifiers and dependencies"
            ),
            TasklyError::Config { message } => format!(
                "Configuration error: {message}\nHint: run 'taskly --help' for recognized options"
            ),
            TasklyError::PmNotFound { package_manager } => format!(
                "Package manager not found: {package_manager}\nHint: install it or pass --pm with an available one"
            ),
            TasklyError::PmDetectionFailed { message } => {
                format!("Package manager detection failed: {message}")
            }
            TasklyError::SpawnFailed { command, .. } => {
                format!("Failed to run command \"{command}\"\nHint: verify the program exists on PATH")
            }
            TasklyError::TaskFailed { task_id, exit_code } => {
                format!("Task {task_id} failed with exit code {exit_code}")
            }
            TasklyError::ProcessTimeout { task_id, timeout_ms } => {
                format!("Task {task_id} timed out after {timeout_ms} ms")
            }
            TasklyError::PermissionDenied { message } => {
                format!("Permission denied: {message}")
            }
            TasklyError::ResourceExhausted { message } => format!(
                "Resource exhausted: {message}\nHint: lower --max-concurrency"
            ),
            TasklyError::CommandInjection { command, pattern } => format!(
                "Command blocked by security screening: \"{command}\" (matched: {pattern})"
            ),
            TasklyError::System { message } => {
                format!("Internal error: {message}\nHint: please report this issue")
            }
            TasklyError::AlreadyRunning => {
                "An execution is already running on this scheduler".to_string()
            }
            TasklyError::Interrupted => "Interrupted".to_string(),
            TasklyError::Other(err) => {
                format!("Unknown error: {err}\nHint: please report this issue")
            }
        }
    }
}

impl From<serde_yaml::Error> for TasklyError {
    fn from(err: serde_yaml::Error) -> Self {
        TasklyError::Config {
            message: format!("YAML configuration error: {err}"),
        }
    }
}

impl From<serde_json::Error> for TasklyError {
    fn from(err: serde_json::Error) -> Self {
        TasklyError::Config {
            message: format!("JSON serialization/deserialization error: {err}"),
        }
    }
}

/// A serializable snapshot of an error for the event stream.
///
/// Scheduler subscribers receive reports instead of the error values
/// themselves so that events stay `Clone`. Verbose mode prints every field;
/// normal mode prints only `message`.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    /// Stable kind name, e.g. `"SpawnFailed"`
    pub code: &'static str,
    /// Severity of the originating error
    pub severity: Severity,
    /// User-facing message
    pub message: String,
    /// Milliseconds since the Unix epoch at capture time
    pub timestamp_ms: u64,
    /// Contextual fields (task id, command, cwd, exit code, retries)
    pub context: HashMap<String, String>,
    /// Rendered chain of wrapped causes, outermost first
    pub cause: Option<String>,
}

impl ErrorReport {
    /// Capture a report from an error plus contextual fields.
    pub fn capture(error: &TasklyError, context: HashMap<String, String>) -> Self {
        let cause = std::error::Error::source(error).map(|c| c.to_string());
        Self {
            code: error.code(),
            severity: error.severity(),
            message: error.user_friendly_message(),
            timestamp_ms: crate::core::task::epoch_millis(),
            context,
            cause,
        }
    }
}

impl TasklyError {
    /// Stable machine-readable name for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            TasklyError::Io(_) => "Io",
            TasklyError::Validation { .. } => "ValidationError",
            TasklyError::Config { .. } => "ConfigError",
            TasklyError::PmNotFound { .. } => "PmNotFound",
            TasklyError::PmDetectionFailed { .. } => "PmDetectionFailed",
            TasklyError::SpawnFailed { .. } => "SpawnFailed",
            TasklyError::TaskFailed { .. } => "TaskFailed",
            TasklyError::ProcessTimeout { .. } => "ProcessTimeout",
            TasklyError::PermissionDenied { .. } => "PermissionDenied",
            TasklyError::ResourceExhausted { .. } => "ResourceExhausted",
            TasklyError::CommandInjection { .. } => "CommandInjection",
            TasklyError::System { .. } => "SystemError",
            TasklyError::AlreadyRunning => "AlreadyRunning",
            TasklyError::Interrupted => "Interrupted",
            TasklyError::Other(_) => "Unknown",
        }
    }
}
