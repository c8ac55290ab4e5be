//! Child process supervision: spawn, line-buffered capture, timeout
//! escalation, termination and resource sampling.
//!
//! A supervisor owns exactly one child for exactly one attempt. Retries
//! spawn a fresh supervisor; that policy lives in the scheduler.

pub mod guard;
pub mod monitor;

pub use guard::{SCRUBBED_ENV_VARS, build_child_env, chained_operator_warning, screen_command};
pub use monitor::{ResourceMonitor, ResourceSample};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::core::color::ColorFormatter;
use crate::core::events::{EventBus, TaskEvent};
use crate::core::task::{OutputKind, OutputLine, epoch_millis};
use crate::error::{TasklyError, TasklyResult};

/// Graceful-to-forceful escalation window after a timeout fires.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Interval between resource samples.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Graceful termination signal.
#[cfg(unix)]
pub const SIGNAL_TERM: i32 = libc::SIGTERM;
/// Graceful termination signal (no delivery semantics off unix).
#[cfg(not(unix))]
pub const SIGNAL_TERM: i32 = 15;

/// Forceful termination signal.
#[cfg(unix)]
pub const SIGNAL_KILL: i32 = libc::SIGKILL;
/// Forceful termination signal (no delivery semantics off unix).
#[cfg(not(unix))]
pub const SIGNAL_KILL: i32 = 9;

/// Interrupt signal, reported for killed tasks.
#[cfg(unix)]
pub const SIGNAL_INT: i32 = libc::SIGINT;
/// Interrupt signal, reported for killed tasks.
#[cfg(not(unix))]
pub const SIGNAL_INT: i32 = 2;

/// Everything a supervisor needs to run one attempt.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Task identifier, used for events and formatting
    pub identifier: String,
    /// Effective command after package manager rewriting
    pub command: String,
    /// Working directory, already validated to exist
    pub cwd: Option<PathBuf>,
    /// Per-task environment overlay
    pub env_overlay: HashMap<String, String>,
    /// Supervisor-agnostic additions (`TASKLY_TASK_*`)
    pub env_additions: HashMap<String, String>,
    /// Per-task timeout
    pub timeout: Duration,
}

/// The single terminal notification for one spawn.
#[derive(Debug, Clone)]
pub enum SupervisorOutcome {
    /// The child exited on its own.
    Exited {
        /// Child exit code (0 for success)
        exit_code: i32,
    },
    /// The per-task timeout fired before the child exited.
    TimedOut {
        /// Non-zero exit code observed after termination
        exit_code: i32,
    },
    /// The child was terminated by a signal (requested or external).
    TerminatedBySignal {
        /// The signal that ended the child
        signal: i32,
    },
}

/// Terminal report sent to the scheduler exactly once per spawn.
#[derive(Debug, Clone)]
pub struct SupervisorReport {
    /// Task identifier
    pub identifier: String,
    /// How the attempt ended
    pub outcome: SupervisorOutcome,
    /// Full line history, both streams, in emit order
    pub output: Vec<OutputLine>,
    /// Pid of the shell wrapper
    pub pid: u32,
    /// Milliseconds since the Unix epoch at spawn
    pub started_ms: u64,
    /// Milliseconds since the Unix epoch at the terminal transition
    pub ended_ms: u64,
}

/// Supervisor lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    /// The child is alive and being driven.
    Running,
    /// The terminal report has been produced.
    Terminated,
}

/// Handle to one supervised child.
///
/// The child handle and line buffers are owned exclusively by the driver
/// task; this handle only carries the pid, the status flag and the
/// termination channel.
pub struct ChildSupervisor {
    identifier: String,
    pid: u32,
    status: Mutex<SupervisorStatus>,
    term_tx: watch::Sender<i32>,
}

impl ChildSupervisor {
    /// Screen, spawn and start driving one child.
    ///
    /// Publishes `task:start` on success. The terminal report is sent on
    /// `report_tx` exactly once. A blocklist match or spawn failure
    /// returns an error instead; no report will follow and, for blocklist
    /// matches, no process was created.
    pub fn spawn(
        spec: SpawnSpec,
        events: EventBus,
        formatter: Arc<ColorFormatter>,
        report_tx: mpsc::UnboundedSender<SupervisorReport>,
    ) -> TasklyResult<Arc<ChildSupervisor>> {
        screen_command(&spec.command)?;
        if let Some(warning) = chained_operator_warning(&spec.command) {
            events.publish(TaskEvent::TaskCommandWarning {
                identifier: spec.identifier.clone(),
                message: warning,
            });
        }

        let mut command = shell_command(&spec.command);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(build_child_env(&spec.env_overlay, &spec.env_additions))
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| TasklyError::from_spawn_error(&spec.command, e))?;
        let pid = child
            .id()
            .ok_or_else(|| TasklyError::system("spawned child has no pid"))?;

        events.publish(TaskEvent::TaskStart {
            identifier: spec.identifier.clone(),
            pid,
            command: spec.command.clone(),
        });

        let (term_tx, term_rx) = watch::channel(0i32);
        let supervisor = Arc::new(ChildSupervisor {
            identifier: spec.identifier.clone(),
            pid,
            status: Mutex::new(SupervisorStatus::Running),
            term_tx,
        });

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let driver_supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let report = drive(
                spec,
                child,
                pid,
                stdout,
                stderr,
                term_rx,
                events,
                formatter,
            )
            .await;
            *driver_supervisor.status.lock().expect("supervisor poisoned") =
                SupervisorStatus::Terminated;
            let _ = report_tx.send(report);
        });

        Ok(supervisor)
    }

    /// Task identifier this supervisor serves.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Pid of the supervised child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current supervisor status.
    pub fn status(&self) -> SupervisorStatus {
        *self.status.lock().expect("supervisor poisoned")
    }

    /// Request termination with the given signal.
    ///
    /// Returns whether the request was delivered to a live child.
    pub fn terminate(&self, signal: i32) -> bool {
        if self.status() != SupervisorStatus::Running {
            return false;
        }
        self.term_tx.send(signal).is_ok()
    }
}

/// Terminate a set of supervisors in deterministic (identifier) order.
///
/// Returns how many termination requests were delivered.
pub fn terminate_all(supervisors: &mut Vec<Arc<ChildSupervisor>>, signal: i32) -> usize {
    supervisors.sort_by(|a, b| a.identifier().cmp(b.identifier()));
    supervisors
        .iter()
        .filter(|s| s.terminate(signal))
        .count()
}

fn shell_command(command: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        // Keep child consoles from flashing windows.
        cmd.creation_flags(winapi::um::winbase::CREATE_NO_WINDOW);
        cmd
    }
}

/// Deliver a signal to the child.
///
/// Forceful kills go through the runtime's kill to reap reliably; other
/// signals are delivered by number on unix. Platforms without signals
/// treat every request as forceful.
fn deliver_signal(child: &mut Child, pid: u32, signal: i32) {
    #[cfg(unix)]
    {
        if signal == SIGNAL_KILL {
            let _ = child.start_kill();
        } else {
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        let _ = child.start_kill();
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    spec: SpawnSpec,
    mut child: Child,
    pid: u32,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    mut term_rx: watch::Receiver<i32>,
    events: EventBus,
    formatter: Arc<ColorFormatter>,
) -> SupervisorReport {
    let started_ms = epoch_millis();
    let identifier = spec.identifier.clone();

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<OutputLine>();
    let mut readers = Vec::new();
    if let Some(stream) = stdout {
        readers.push(tokio::spawn(read_lines(
            stream,
            OutputKind::Stdout,
            identifier.clone(),
            Arc::clone(&formatter),
            line_tx.clone(),
        )));
    }
    if let Some(stream) = stderr {
        readers.push(tokio::spawn(read_lines(
            stream,
            OutputKind::Stderr,
            identifier.clone(),
            Arc::clone(&formatter),
            line_tx.clone(),
        )));
    }
    drop(line_tx);

    let timeout_at = Instant::now() + spec.timeout;
    let mut grace_at: Option<Instant> = None;
    let mut timed_out = false;
    let mut requested_signal: Option<i32> = None;
    let mut monitor = ResourceMonitor::new(pid);
    let mut monitor_warned = false;
    let mut monitor_tick = tokio::time::interval(MONITOR_INTERVAL);
    monitor_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut output: Vec<OutputLine> = Vec::new();

    let exit_status = loop {
        tokio::select! {
            status = child.wait() => break status,

            Some(line) = line_rx.recv() => {
                events.publish(TaskEvent::TaskOutput(line.clone()));
                output.push(line);
            }

            changed = term_rx.changed() => {
                if changed.is_ok() {
                    let signal = *term_rx.borrow_and_update();
                    requested_signal = Some(signal);
                    deliver_signal(&mut child, pid, signal);
                    events.publish(TaskEvent::TaskTerminated {
                        identifier: identifier.clone(),
                        signal,
                    });
                }
            }

            _ = tokio::time::sleep_until(timeout_at), if !timed_out => {
                timed_out = true;
                grace_at = Some(Instant::now() + GRACE_PERIOD);
                events.publish(TaskEvent::TaskTimeout {
                    identifier: identifier.clone(),
                    timeout_ms: spec.timeout.as_millis() as u64,
                });
                deliver_signal(&mut child, pid, SIGNAL_TERM);
            }

            _ = async { tokio::time::sleep_until(grace_at.unwrap()).await },
                if grace_at.is_some() => {
                grace_at = None;
                deliver_signal(&mut child, pid, SIGNAL_KILL);
            }

            _ = monitor_tick.tick() => {
                match monitor.sample() {
                    Ok(sample) => events.publish(TaskEvent::TaskResourceCheck {
                        identifier: identifier.clone(),
                        sample,
                    }),
                    Err(e) if !monitor_warned => {
                        monitor_warned = true;
                        events.publish(TaskEvent::TaskMonitorWarning {
                            identifier: identifier.clone(),
                            message: format!("resource sampling unavailable: {e}"),
                        });
                    }
                    Err(_) => {}
                }
            }
        }
    };

    // Streams can still hold buffered output after exit; wait for both
    // readers to hit EOF, then drain what they queued.
    futures::future::join_all(readers).await;
    while let Ok(line) = line_rx.try_recv() {
        events.publish(TaskEvent::TaskOutput(line.clone()));
        output.push(line);
    }

    let (exit_code, killed_by) = match exit_status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            log::warn!("wait failed for task {identifier}: {e}");
            (crate::core::task::EXIT_CODE_GENERIC_FAILURE, None)
        }
    };

    let outcome = if let Some(signal) = requested_signal {
        SupervisorOutcome::TerminatedBySignal { signal }
    } else if timed_out {
        // The close after a timeout always reports non-zero.
        let code = if exit_code == 0 { 124 } else { exit_code };
        SupervisorOutcome::TimedOut { exit_code: code }
    } else if let Some(signal) = killed_by {
        SupervisorOutcome::TerminatedBySignal { signal }
    } else {
        SupervisorOutcome::Exited { exit_code }
    };

    SupervisorReport {
        identifier,
        outcome,
        output,
        pid,
        started_ms,
        ended_ms: epoch_millis(),
    }
}

/// `(exit_code, terminating_signal)` for a finished child.
fn exit_code_of(status: std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (128 + signal, Some(signal));
        }
    }
    (crate::core::task::EXIT_CODE_GENERIC_FAILURE, None)
}

/// Read one stream to EOF, emitting complete lines in arrival order.
///
/// A rolling byte buffer accumulates chunks; each `\n` releases one line
/// with any trailing `\r` stripped, and the final partial line is flushed
/// when the stream closes.
async fn read_lines<R>(
    mut stream: R,
    kind: OutputKind,
    identifier: String,
    formatter: Arc<ColorFormatter>,
    tx: mpsc::UnboundedSender<OutputLine>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut partial: Vec<u8> = Vec::new();

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                partial.extend_from_slice(&buf[..n]);
                while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
                    let mut line_bytes: Vec<u8> = partial.drain(..=pos).collect();
                    line_bytes.pop(); // the \n itself
                    if line_bytes.last() == Some(&b'\r') {
                        line_bytes.pop();
                    }
                    if emit_line(&identifier, kind, line_bytes, &formatter, &tx).is_err() {
                        return;
                    }
                }
            }
            Err(_) => break,
        }
    }

    if !partial.is_empty() {
        let mut line_bytes = std::mem::take(&mut partial);
        if line_bytes.last() == Some(&b'\r') {
            line_bytes.pop();
        }
        let _ = emit_line(&identifier, kind, line_bytes, &formatter, &tx);
    }
}

fn emit_line(
    identifier: &str,
    kind: OutputKind,
    line_bytes: Vec<u8>,
    formatter: &ColorFormatter,
    tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<(), mpsc::error::SendError<OutputLine>> {
    let content = String::from_utf8_lossy(&line_bytes).into_owned();
    let formatted = formatter.format(identifier, &content);
    tx.send(OutputLine {
        identifier: identifier.to_string(),
        content,
        kind,
        timestamp_ms: epoch_millis(),
        formatted,
    })
}
