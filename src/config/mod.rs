//! Configuration management module for taskly.
//!
//! Settings come from four layers with fixed precedence:
//! command line > configuration file > `TASKLY_*` environment > defaults.
//! This module owns the file/environment layers and the merged
//! [`Config`] type; the CLI applies its own flags on top.
//!
//! # Key Components
//!
//! - [`Config`] - merged configuration structure
//! - [`ConfigService`] - service interface for configuration loading
//! - [`ProductionConfigService`] - production implementation with file I/O
//! - [`TestConfigService`] - test implementation with a fixed config
//!
//! # Examples
//!
//! ```rust
//! use taskly_cli::config::{Config, ConfigService, TestConfigService};
//!
//! let service = TestConfigService::new(Config::default());
//! let config = service.get_config().unwrap();
//! assert!(config.package_manager.is_none());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub mod environment;
pub mod service;

pub use environment::{EnvironmentProvider, SystemEnvironmentProvider, TestEnvironmentProvider};
pub use service::{ConfigService, ProductionConfigService, TestConfigService};

use crate::core::color::parse_color_spec;
use crate::core::pm::PackageManagerKind;
use crate::error::{TasklyError, TasklyResult};

/// One named task in a configuration file.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskEntry {
    /// Shell command to run
    pub command: String,
    /// Identifier override; the map key is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Color specification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Preferred package manager for this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<PackageManagerKind>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// The `options` section of a configuration file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionsSection {
    /// Emit statistics and warnings to stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

/// Merged application configuration.
///
/// Every field is optional; `None` means "not set at this layer" so that
/// [`Config::overlay`] can express precedence by letting later layers win.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Preferred package manager for every task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<PackageManagerKind>,
    /// Kill-others-on-fail policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_others_on_fail: Option<bool>,
    /// Concurrent task ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    /// Color overrides, one per command in submission order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colors: Option<Vec<String>>,
    /// Identifier overrides, one per command in submission order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,
    /// Nested options section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<OptionsSection>,
    /// Named tasks, run when no commands are given on the command line.
    ///
    /// A `BTreeMap` keeps file-defined batches deterministic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeMap<String, TaskEntry>>,
}

impl Config {
    /// Overlay `other` on top of `self`; set fields of `other` win.
    pub fn overlay(mut self, other: Config) -> Config {
        if other.package_manager.is_some() {
            self.package_manager = other.package_manager;
        }
        if other.kill_others_on_fail.is_some() {
            self.kill_others_on_fail = other.kill_others_on_fail;
        }
        if other.max_concurrency.is_some() {
            self.max_concurrency = other.max_concurrency;
        }
        if other.colors.is_some() {
            self.colors = other.colors;
        }
        if other.names.is_some() {
            self.names = other.names;
        }
        if let Some(options) = other.options {
            let merged = self.options.get_or_insert_with(OptionsSection::default);
            if options.verbose.is_some() {
                merged.verbose = options.verbose;
            }
        }
        if other.tasks.is_some() {
            self.tasks = other.tasks;
        }
        self
    }

    /// Whether verbose output is enabled.
    pub fn verbose(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.verbose)
            .unwrap_or(false)
    }

    /// Validate value ranges and color specifications.
    pub fn validate(&self) -> TasklyResult<()> {
        if self.max_concurrency == Some(0) {
            return Err(TasklyError::config(
                "maxConcurrency must be a positive integer",
            ));
        }
        if let Some(colors) = &self.colors {
            for color in colors {
                parse_color_spec(color).map_err(|_| {
                    TasklyError::config(format!("invalid color in configuration: {color}"))
                })?;
            }
        }
        if let Some(tasks) = &self.tasks {
            for (name, entry) in tasks {
                if entry.command.trim().is_empty() {
                    return Err(TasklyError::config(format!(
                        "task \"{name}\" has an empty command"
                    )));
                }
                if let Some(color) = &entry.color {
                    parse_color_spec(color).map_err(|_| {
                        TasklyError::config(format!(
                            "invalid color for task \"{name}\": {color}"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_precedence() {
        let base = Config {
            package_manager: Some(PackageManagerKind::Npm),
            max_concurrency: Some(2),
            ..Config::default()
        };
        let top = Config {
            package_manager: Some(PackageManagerKind::Yarn),
            kill_others_on_fail: Some(true),
            ..Config::default()
        };
        let merged = base.overlay(top);
        assert_eq!(merged.package_manager, Some(PackageManagerKind::Yarn));
        assert_eq!(merged.max_concurrency, Some(2));
        assert_eq!(merged.kill_others_on_fail, Some(true));
    }

    #[test]
    fn test_overlay_merges_options_section() {
        let base = Config {
            options: Some(OptionsSection {
                verbose: Some(false),
            }),
            ..Config::default()
        };
        let top = Config {
            options: Some(OptionsSection {
                verbose: Some(true),
            }),
            ..Config::default()
        };
        assert!(base.overlay(top).verbose());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let json = r#"{"packageManager": "npm", "maxWorkers": 4}"#;
        let parsed: Result<Config, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            max_concurrency: Some(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_color() {
        let config = Config {
            colors: Some(vec!["cyan".into(), "sparkly".into()]),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tasks_parse_from_json() {
        let json = r#"{
            "killOthersOnFail": true,
            "tasks": {
                "web": {"command": "npm run dev", "color": "cyan"},
                "api": {"command": "cargo run", "cwd": "/tmp"}
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.kill_others_on_fail, Some(true));
        let tasks = config.tasks.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks["web"].color.as_deref(), Some("cyan"));
    }
}
