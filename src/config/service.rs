//! Configuration service system for dependency injection and test isolation.
//!
//! This module provides a clean abstraction for configuration loading
//! that enables dependency injection and complete test isolation without
//! requiring global state resets.

use log::debug;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::environment::{EnvironmentProvider, SystemEnvironmentProvider, environment_layer};
use crate::config::Config;
use crate::error::{TasklyError, TasklyResult};

/// File stems probed in the working directory, in order.
const CONFIG_STEMS: [&str; 2] = ["taskly.config", ".tasklyrc"];
/// Supported extensions per stem, in order.
const CONFIG_EXTENSIONS: [&str; 5] = ["json", "yaml", "yml", "js", "mjs"];

/// Configuration service trait for dependency injection.
///
/// This trait abstracts configuration loading operations, allowing
/// different implementations for production and testing environments.
pub trait ConfigService: Send + Sync {
    /// Get the current configuration.
    ///
    /// Returns the merged [`Config`] from defaults, environment variables
    /// and the discovered (or explicitly given) configuration file. May
    /// cache internally.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or validation fails.
    fn get_config(&self) -> TasklyResult<Config>;

    /// Force a reload from all sources, discarding cached values.
    fn reload(&self) -> TasklyResult<()>;

    /// The configuration file in effect, when one was found.
    fn config_file_path(&self) -> Option<PathBuf>;
}

/// Production configuration service implementation.
///
/// Sources in increasing precedence: defaults, `TASKLY_*` environment
/// variables, then the configuration file (explicit `--config` /
/// `TASKLY_CONFIG` path, auto-discovered `taskly.config.*` or
/// `.tasklyrc.*` in the search directory, or a `taskly` key inside
/// `package.json`). The command line merges on top of all of this at the
/// CLI layer.
pub struct ProductionConfigService {
    env_provider: Arc<dyn EnvironmentProvider>,
    explicit_path: Option<PathBuf>,
    search_dir: PathBuf,
    cached: RwLock<Option<(Config, Option<PathBuf>)>>,
}

impl ProductionConfigService {
    /// Service over the system environment and current directory.
    pub fn new() -> TasklyResult<Self> {
        let search_dir = std::env::current_dir()?;
        Ok(Self {
            env_provider: Arc::new(SystemEnvironmentProvider::new()),
            explicit_path: None,
            search_dir,
            cached: RwLock::new(None),
        })
    }

    /// Inject an environment provider (tests).
    pub fn with_env_provider(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.env_provider = provider;
        self
    }

    /// Pin an explicit configuration file path (`--config`).
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.explicit_path = path;
        self
    }

    /// Search a different directory than the current one.
    pub fn with_search_dir(mut self, dir: PathBuf) -> Self {
        self.search_dir = dir;
        self
    }

    fn load(&self) -> TasklyResult<(Config, Option<PathBuf>)> {
        let mut merged = Config::default();
        merged = merged.overlay(environment_layer(self.env_provider.as_ref())?);

        let explicit = self.explicit_path.clone().or_else(|| {
            self.env_provider
                .get_var("TASKLY_CONFIG")
                .map(PathBuf::from)
        });

        let discovered = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(TasklyError::config(format!(
                        "configuration file not found: {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => discover_config_file(&self.search_dir),
        };

        if let Some(path) = &discovered {
            merged = merged.overlay(load_config_file(path)?);
        } else if let Some(embedded) = load_package_json_key(&self.search_dir)? {
            debug!("using taskly key from package.json");
            merged = merged.overlay(embedded);
        } else if let Some(path) = user_config_file() {
            merged = merged.overlay(load_config_file(&path)?);
        }

        merged.validate()?;
        Ok((merged, discovered))
    }
}

impl ConfigService for ProductionConfigService {
    fn get_config(&self) -> TasklyResult<Config> {
        {
            let cached = self.cached.read().expect("config cache poisoned");
            if let Some((config, _)) = cached.as_ref() {
                return Ok(config.clone());
            }
        }
        let loaded = self.load()?;
        let config = loaded.0.clone();
        *self.cached.write().expect("config cache poisoned") = Some(loaded);
        Ok(config)
    }

    fn reload(&self) -> TasklyResult<()> {
        *self.cached.write().expect("config cache poisoned") = None;
        self.get_config().map(|_| ())
    }

    fn config_file_path(&self) -> Option<PathBuf> {
        self.cached
            .read()
            .expect("config cache poisoned")
            .as_ref()
            .and_then(|(_, path)| path.clone())
    }
}

/// Test configuration service with a fixed configuration.
pub struct TestConfigService {
    config: Config,
}

impl TestConfigService {
    /// Service that always returns the given configuration.
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigService for TestConfigService {
    fn get_config(&self) -> TasklyResult<Config> {
        Ok(self.config.clone())
    }

    fn reload(&self) -> TasklyResult<()> {
        Ok(())
    }

    fn config_file_path(&self) -> Option<PathBuf> {
        None
    }
}

/// Probe the discovery order and return the first existing file.
fn discover_config_file(dir: &Path) -> Option<PathBuf> {
    for stem in CONFIG_STEMS {
        for ext in CONFIG_EXTENSIONS {
            let candidate = dir.join(format!("{stem}.{ext}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// User-level fallback at `$CONFIG_DIR/taskly/config.{toml,json,yaml,yml}`.
fn user_config_file() -> Option<PathBuf> {
    let base = dirs::config_dir()?.join("taskly");
    for ext in ["toml", "json", "yaml", "yml"] {
        let candidate = base.join(format!("config.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Parse one configuration file by extension.
fn load_config_file(path: &Path) -> TasklyResult<Config> {
    debug!("loading configuration from {}", path.display());
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") | Some("mjs") => Err(TasklyError::config(format!(
            "JavaScript configuration files are not supported: {} (use JSON or YAML)",
            path.display()
        ))),
        Some("yaml") | Some("yml") => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_yaml::from_str(&raw)?)
        }
        Some("json") => {
            let raw = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        Some("toml") => {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| {
                TasklyError::config(format!("TOML configuration error: {e}"))
            })
        }
        _ => Err(TasklyError::config(format!(
            "unrecognized configuration file format: {}",
            path.display()
        ))),
    }
}

/// Extract a `taskly` key from `dir/package.json`, when present.
fn load_package_json_key(dir: &Path) -> TasklyResult<Option<Config>> {
    let path = dir.join("package.json");
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    let json: serde_json::Value = serde_json::from_str(&raw)?;
    match json.get("taskly") {
        Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        None => Ok(None),
    }
}
