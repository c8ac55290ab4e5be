//! Command-line interface for the taskly orchestrator.
//!
//! This module provides the top-level CLI application structure: the
//! argument parser, the precedence merge over the configuration layers
//! (command line > configuration file > environment > defaults), batch
//! construction, and the run orchestration that wires the scheduler to
//! the terminal presenter.
//!
//! # Examples
//!
//! ```bash
//! # Run two commands concurrently with colored prefixes
//! taskly "npm run dev" "cargo run"
//!
//! # Kill everything as soon as one task fails, two at a time
//! taskly -k -m 2 "npm test" "npm run lint" "npm run build"
//!
//! # Name the tasks and prefer a package manager
//! taskly -n web,api --pm pnpm "run dev" "run start:api"
//! ```

pub mod ui;

pub use ui::{Presenter, print_error, print_success, print_warning};

use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{Config, ConfigService, OptionsSection, ProductionConfigService};
use crate::core::color::ColorFormatter;
use crate::core::events::EventBus;
use crate::core::pm::{PackageManagerKind, PackageManagerResolver};
use crate::core::process::SIGNAL_TERM;
use crate::core::scheduler::{ExecuteOptions, Scheduler};
use crate::core::task::TaskConfig;
use crate::error::TasklyError;

/// Main CLI application structure defining the top-level interface.
#[derive(Parser, Debug)]
#[command(name = "taskly")]
#[command(about = "Run shell commands concurrently with multiplexed, color-prefixed output")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Commands to run concurrently
    #[arg(value_name = "COMMAND")]
    pub commands: Vec<String>,

    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Override task identifiers (csv, one per command)
    #[arg(short = 'n', long = "names", value_name = "CSV")]
    pub names: Option<String>,

    /// Override task colors (csv, one per command)
    #[arg(short = 'c', long = "colors", value_name = "CSV")]
    pub colors: Option<String>,

    /// Preferred package manager (npm, yarn, pnpm, bun)
    #[arg(
        short = 'p',
        long = "package-manager",
        visible_alias = "pm",
        value_name = "PM"
    )]
    pub package_manager: Option<String>,

    /// Kill every other task once one fails permanently
    #[arg(short = 'k', long = "kill-others-on-fail")]
    pub kill_others_on_fail: bool,

    /// Maximum number of tasks running at once
    #[arg(short = 'm', long = "max-concurrency", value_name = "N")]
    pub max_concurrency: Option<usize>,

    /// Emit statistics and warnings to stderr
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// Path to a configuration file
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Fold the command-line flags into a configuration layer.
    fn as_config_layer(&self) -> crate::Result<Config> {
        let mut layer = Config::default();
        if let Some(raw) = &self.package_manager {
            layer.package_manager = Some(PackageManagerKind::from_str(raw)?);
        }
        if self.kill_others_on_fail {
            layer.kill_others_on_fail = Some(true);
        }
        if let Some(n) = self.max_concurrency {
            layer.max_concurrency = Some(n);
        }
        if let Some(csv) = &self.names {
            layer.names = Some(split_csv(csv));
        }
        if let Some(csv) = &self.colors {
            layer.colors = Some(split_csv(csv));
        }
        if self.verbose {
            layer.options = Some(OptionsSection {
                verbose: Some(true),
            });
        }
        Ok(layer)
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Executes the taskly CLI application with parsed arguments.
///
/// This is the main entry point for CLI execution; it loads the
/// configuration layers, builds the batch, and drives the scheduler to
/// completion.
pub async fn run() -> crate::Result<()> {
    let cli = Cli::parse();
    let service = ProductionConfigService::new()?.with_config_path(cli.config.clone());
    run_with_config(cli, &service).await
}

/// Run the CLI with a provided configuration service.
///
/// This function enables dependency injection of configuration services,
/// making it easier to test and providing better control over
/// configuration management.
pub async fn run_with_config(cli: Cli, service: &dyn ConfigService) -> crate::Result<()> {
    let config = service.get_config()?.overlay(cli.as_config_layer()?);
    config.validate()?;
    let verbose = config.verbose();

    let resolver = Arc::new(PackageManagerResolver::new());
    let batch = build_batch(&cli.commands, &config)?;
    let batch = expand_batch(batch, &resolver).await?;

    let options = ExecuteOptions {
        kill_others_on_fail: config.kill_others_on_fail.unwrap_or(false),
        max_concurrency: config.max_concurrency,
        ..ExecuteOptions::default()
    };

    let scheduler = Arc::new(Scheduler::with_parts(
        EventBus::new(),
        Arc::new(ColorFormatter::new()),
        resolver,
    ));
    let presenter = Presenter::spawn(scheduler.subscribe(), verbose);

    // First Ctrl-C stops the batch; the run then unwinds with exit 130.
    let interrupted = Arc::new(AtomicBool::new(false));
    let signal_task = {
        let scheduler = Arc::clone(&scheduler);
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
                scheduler.stop(SIGNAL_TERM);
            }
        })
    };

    let outcome = scheduler.execute(batch, options).await;
    signal_task.abort();
    let _ = signal_task.await;
    // Dropping the last scheduler handle closes the event bus, which lets
    // the presenter drain its buffer and exit.
    drop(scheduler);
    presenter.finish().await;

    let results = outcome?;
    if interrupted.load(Ordering::SeqCst) {
        return Err(TasklyError::Interrupted);
    }
    if let Some(failed) = results.iter().find(|r| !r.success()) {
        return Err(TasklyError::TaskFailed {
            task_id: failed.identifier.clone(),
            exit_code: failed.exit_code,
        });
    }
    Ok(())
}

/// Build the batch from positional commands, or from the configuration
/// file's `tasks` section when no commands were given.
fn build_batch(commands: &[String], config: &Config) -> crate::Result<Vec<TaskConfig>> {
    if commands.is_empty() {
        let Some(tasks) = config.tasks.as_ref().filter(|t| !t.is_empty()) else {
            return Err(TasklyError::validation(
                "no commands given and no tasks defined in configuration",
            ));
        };
        return Ok(tasks
            .iter()
            .map(|(name, entry)| {
                let mut task = TaskConfig::new(entry.command.clone()).with_identifier(
                    entry.identifier.clone().unwrap_or_else(|| name.clone()),
                );
                task.color = entry.color.clone();
                task.package_manager = entry.package_manager.or(config.package_manager);
                task.cwd = entry.cwd.clone();
                task
            })
            .collect());
    }

    if let Some(names) = &config.names {
        if names.len() != commands.len() {
            return Err(TasklyError::validation(format!(
                "got {} names for {} commands",
                names.len(),
                commands.len()
            )));
        }
    }
    if let Some(colors) = &config.colors {
        if colors.len() != commands.len() {
            return Err(TasklyError::validation(format!(
                "got {} colors for {} commands",
                colors.len(),
                commands.len()
            )));
        }
    }

    Ok(commands
        .iter()
        .enumerate()
        .map(|(index, command)| {
            let mut task = TaskConfig::new(command.clone());
            if let Some(names) = &config.names {
                task.identifier = Some(names[index].clone());
            }
            if let Some(colors) = &config.colors {
                task.color = Some(colors[index].clone());
            }
            task.package_manager = config.package_manager;
            task
        })
        .collect())
}

/// Expand `run` wildcards for tasks with a package manager preference.
///
/// Each matched script becomes its own task named after the script. The
/// scheduler's own rewriting is a fixed point over the expanded commands.
async fn expand_batch(
    tasks: Vec<TaskConfig>,
    resolver: &PackageManagerResolver,
) -> crate::Result<Vec<TaskConfig>> {
    let mut expanded = Vec::with_capacity(tasks.len());
    for task in tasks {
        let Some(preferred) = task.package_manager else {
            expanded.push(task);
            continue;
        };
        let cwd = task.config_dir();
        let resolution = resolver.resolve(Some(preferred), &cwd).await?;
        let rewritten = PackageManagerResolver::rewrite_command(
            resolution.package_manager,
            task.trimmed_command(),
        );
        let expansion = PackageManagerResolver::expand_wildcards(
            resolution.package_manager,
            &rewritten,
            &cwd,
            false,
        )?;
        if expansion.commands.len() == 1 {
            expanded.push(task);
        } else {
            for command in expansion.commands {
                let script = command
                    .rsplit(' ')
                    .next()
                    .unwrap_or("script")
                    .to_string();
                let mut clone = task.clone();
                clone.command = command;
                clone.identifier = Some(script);
                expanded.push(clone);
            }
        }
    }
    Ok(expanded)
}

impl TaskConfig {
    /// The directory wildcard expansion and lockfile detection run in.
    fn config_dir(&self) -> PathBuf {
        self.cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskEntry;
    use std::collections::BTreeMap;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_positional_commands_and_flags() {
        let cli = parse(&[
            "taskly",
            "-k",
            "-m",
            "2",
            "-n",
            "web,api",
            "echo a",
            "echo b",
        ]);
        assert_eq!(cli.commands, vec!["echo a", "echo b"]);
        assert!(cli.kill_others_on_fail);
        assert_eq!(cli.max_concurrency, Some(2));
        assert_eq!(cli.names.as_deref(), Some("web,api"));
    }

    #[test]
    fn test_pm_alias() {
        let cli = parse(&["taskly", "--pm", "yarn", "run build"]);
        assert_eq!(cli.package_manager.as_deref(), Some("yarn"));
    }

    #[test]
    fn test_verbose_is_capital_v() {
        let cli = parse(&["taskly", "-V", "echo hi"]);
        assert!(cli.verbose);
    }

    #[test]
    fn test_cli_layer_rejects_bad_pm() {
        let cli = parse(&["taskly", "-p", "cargo", "echo hi"]);
        assert!(cli.as_config_layer().is_err());
    }

    #[test]
    fn test_build_batch_names_count_mismatch() {
        let config = Config {
            names: Some(vec!["only-one".into()]),
            ..Config::default()
        };
        let commands = vec!["echo a".to_string(), "echo b".to_string()];
        let err = build_batch(&commands, &config).unwrap_err();
        assert!(err.to_string().contains("names"));
    }

    #[test]
    fn test_build_batch_applies_overrides() {
        let config = Config {
            names: Some(vec!["web".into(), "api".into()]),
            colors: Some(vec!["red".into(), "blue".into()]),
            package_manager: Some(PackageManagerKind::Pnpm),
            ..Config::default()
        };
        let commands = vec!["echo a".to_string(), "echo b".to_string()];
        let batch = build_batch(&commands, &config).unwrap();
        assert_eq!(batch[0].identifier.as_deref(), Some("web"));
        assert_eq!(batch[1].color.as_deref(), Some("blue"));
        assert_eq!(batch[1].package_manager, Some(PackageManagerKind::Pnpm));
    }

    #[test]
    fn test_build_batch_from_config_tasks() {
        let mut tasks = BTreeMap::new();
        tasks.insert(
            "web".to_string(),
            TaskEntry {
                command: "npm run dev".into(),
                identifier: None,
                color: Some("cyan".into()),
                package_manager: None,
                cwd: None,
            },
        );
        let config = Config {
            tasks: Some(tasks),
            ..Config::default()
        };
        let batch = build_batch(&[], &config).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].identifier.as_deref(), Some("web"));
        assert_eq!(batch[0].color.as_deref(), Some("cyan"));
    }

    #[test]
    fn test_build_batch_empty_everything_fails() {
        let err = build_batch(&[], &Config::default()).unwrap_err();
        assert!(matches!(err, TasklyError::Validation { .. }));
    }
}
