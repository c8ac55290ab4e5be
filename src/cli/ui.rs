//! Terminal presenter for the event stream.
//!
//! The scheduler emits typed events; this thin subscriber renders them.
//! Task output goes to stdout/stderr according to its originating stream,
//! status lines use colored glyphs, and verbose mode additionally surfaces
//! warnings, statistics and full error reports on stderr.

use colored::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::events::TaskEvent;
use crate::core::task::OutputKind;
use crate::error::ErrorReport;

/// Print a success message with a green check mark.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message with a red cross to stderr.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message with a yellow marker to stderr.
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "⚠".yellow().bold(), message);
}

/// Background subscriber that renders events until the bus closes.
pub struct Presenter {
    handle: JoinHandle<()>,
}

impl Presenter {
    /// Start rendering events from the given receiver.
    pub fn spawn(mut rx: broadcast::Receiver<TaskEvent>, verbose: bool) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => render(&event, verbose),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        if verbose {
                            print_warning(&format!("presenter lagged, skipped {skipped} events"));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { handle }
    }

    /// Wait for the remaining buffered events to be rendered.
    ///
    /// The publisher side must be dropped first, otherwise this waits
    /// forever.
    pub async fn finish(self) {
        let _ = self.handle.await;
    }
}

fn render(event: &TaskEvent, verbose: bool) {
    match event {
        TaskEvent::TaskOutput(line) => match line.kind {
            OutputKind::Stdout => println!("{}", line.formatted),
            OutputKind::Stderr => eprintln!("{}", line.formatted),
        },
        TaskEvent::TaskStart {
            identifier,
            pid,
            command,
        } => {
            if verbose {
                eprintln!("{} {identifier} started (pid {pid}): {command}", "▶".bold());
            }
        }
        TaskEvent::TaskComplete {
            identifier,
            duration_ms,
            ..
        } => {
            print_success(&format!("{identifier} finished in {duration_ms} ms"));
        }
        TaskEvent::TaskFailedPermanently {
            identifier,
            exit_code,
            retries,
        } => {
            if *retries > 0 {
                print_error(&format!(
                    "{identifier} failed with exit code {exit_code} after {retries} retries"
                ));
            } else {
                print_error(&format!("{identifier} failed with exit code {exit_code}"));
            }
        }
        TaskEvent::TaskRetry {
            identifier,
            attempt,
            max_retries,
            delay_ms,
        } => {
            print_warning(&format!(
                "{identifier} retrying ({attempt}/{max_retries}) in {delay_ms} ms"
            ));
        }
        TaskEvent::TaskTimeout {
            identifier,
            timeout_ms,
        } => {
            print_error(&format!("{identifier} timed out after {timeout_ms} ms"));
        }
        TaskEvent::TaskKilled { identifier } => {
            print_warning(&format!("{identifier} killed"));
        }
        TaskEvent::TaskPmResolutionWarning { message, .. }
        | TaskEvent::TaskCommandWarning { message, .. }
        | TaskEvent::TaskMonitorWarning { message, .. } => {
            if verbose {
                print_warning(message);
            }
        }
        TaskEvent::TaskResourceCheck { identifier, sample } => {
            if verbose {
                eprintln!(
                    "  {identifier}: rss {} KiB, cpu {:.1}%",
                    sample.rss_bytes / 1024,
                    sample.cpu_percent
                );
            }
        }
        TaskEvent::ExecutionGlobalTimeout { timeout_ms } => {
            print_error(&format!("execution exceeded global timeout of {timeout_ms} ms"));
        }
        TaskEvent::ExecutionStatistics(stats) => {
            if verbose {
                eprintln!(
                    "{} {} tasks: {} completed, {} failed, {} killed in {} ms (avg {} ms)",
                    "∑".bold(),
                    stats.total,
                    stats.completed,
                    stats.failed,
                    stats.killed,
                    stats.elapsed_ms,
                    stats.average_task_duration_ms,
                );
            }
        }
        TaskEvent::ExecutionError(report) => render_error_report(report, verbose),
        TaskEvent::TaskError { report, .. } => {
            if verbose {
                render_error_report(report, verbose);
            }
        }
        TaskEvent::ExecutionStopping { signal } => {
            if verbose {
                print_warning(&format!("stopping all tasks with signal {signal}"));
            }
        }
        // Remaining lifecycle events carry no user-facing text.
        _ => {}
    }
}

fn render_error_report(report: &ErrorReport, verbose: bool) {
    print_error(&report.message);
    if verbose {
        eprintln!("  code: {} at {} ms", report.code, report.timestamp_ms);
        for (key, value) in &report.context {
            eprintln!("  {key}: {value}");
        }
        if let Some(cause) = &report.cause {
            eprintln!("  caused by: {cause}");
        }
    }
}
