//! Core orchestration engine for taskly.
//!
//! This module contains the subsystems that drive a batch of shell
//! commands to completion:
//! - `task` for the task data model (configs, states, results)
//! - `scheduler` for dependency-aware admission, retries and policies
//! - `process` for child supervision, output capture and termination
//! - `pm` for package manager detection and command rewriting
//! - `color` for per-task color assignment and prefix formatting
//! - `events` for the typed lifecycle event stream

pub mod color;
pub mod events;
pub mod pm;
pub mod process;
pub mod scheduler;
pub mod task;
