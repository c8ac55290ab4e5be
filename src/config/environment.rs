//! Environment variable provider module.
//!
//! This module defines traits for abstracting environment variable access,
//! along with corresponding production and test implementations, plus the
//! parser that turns `TASKLY_*` variables into a configuration layer.

use std::collections::HashMap;
use std::str::FromStr;

use crate::config::{Config, OptionsSection};
use crate::core::pm::PackageManagerKind;
use crate::error::{TasklyError, TasklyResult};

/// Environment variable provider trait.
///
/// This trait abstracts environment variable access, allowing for mock
/// implementations to be injected during testing.
pub trait EnvironmentProvider: Send + Sync {
    /// Get the value of the specified environment variable.
    fn get_var(&self, key: &str) -> Option<String>;

    /// Check if an environment variable exists.
    fn has_var(&self, key: &str) -> bool {
        self.get_var(key).is_some()
    }
}

/// System environment variable provider implementation.
#[derive(Debug, Default)]
pub struct SystemEnvironmentProvider;

impl SystemEnvironmentProvider {
    /// Create a new system environment variable provider.
    pub fn new() -> Self {
        Self
    }
}

impl EnvironmentProvider for SystemEnvironmentProvider {
    fn get_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Test environment variable provider implementation.
///
/// Uses a predefined variable mapping for complete isolation in tests.
#[derive(Debug, Default)]
pub struct TestEnvironmentProvider {
    variables: HashMap<String, String>,
}

impl TestEnvironmentProvider {
    /// Create a new empty test provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a test provider containing specified variables.
    pub fn with_variables(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Set an environment variable.
    pub fn set_var(&mut self, key: &str, value: &str) {
        self.variables.insert(key.to_string(), value.to_string());
    }

    /// Remove an environment variable.
    pub fn remove_var(&mut self, key: &str) {
        self.variables.remove(key);
    }
}

impl EnvironmentProvider for TestEnvironmentProvider {
    fn get_var(&self, key: &str) -> Option<String> {
        self.variables.get(key).cloned()
    }
}

/// Parse the `TASKLY_*` variables into a configuration layer.
///
/// Recognized variables: `TASKLY_PACKAGE_MANAGER`,
/// `TASKLY_KILL_OTHERS_ON_FAIL`, `TASKLY_MAX_CONCURRENCY`,
/// `TASKLY_VERBOSE`, `TASKLY_COLORS` (csv), `TASKLY_NAMES` (csv).
/// `TASKLY_CONFIG` points at a config file and is consumed by the
/// service, not here.
///
/// # Errors
///
/// Malformed values are configuration errors rather than silently
/// ignored settings.
pub fn environment_layer(provider: &dyn EnvironmentProvider) -> TasklyResult<Config> {
    let mut config = Config::default();

    if let Some(raw) = provider.get_var("TASKLY_PACKAGE_MANAGER") {
        config.package_manager = Some(PackageManagerKind::from_str(&raw)?);
    }
    if let Some(raw) = provider.get_var("TASKLY_KILL_OTHERS_ON_FAIL") {
        config.kill_others_on_fail = Some(parse_bool("TASKLY_KILL_OTHERS_ON_FAIL", &raw)?);
    }
    if let Some(raw) = provider.get_var("TASKLY_MAX_CONCURRENCY") {
        let value: usize = raw.trim().parse().map_err(|_| {
            TasklyError::config(format!(
                "TASKLY_MAX_CONCURRENCY must be a positive integer, got: {raw}"
            ))
        })?;
        config.max_concurrency = Some(value);
    }
    if let Some(raw) = provider.get_var("TASKLY_VERBOSE") {
        config.options = Some(OptionsSection {
            verbose: Some(parse_bool("TASKLY_VERBOSE", &raw)?),
        });
    }
    if let Some(raw) = provider.get_var("TASKLY_COLORS") {
        config.colors = Some(split_csv(&raw));
    }
    if let Some(raw) = provider.get_var("TASKLY_NAMES") {
        config.names = Some(split_csv(&raw));
    }

    Ok(config)
}

fn parse_bool(name: &str, raw: &str) -> TasklyResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(TasklyError::config(format!(
            "{name} must be a boolean, got: {other}"
        ))),
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_environment_provider_existing_var() {
        let provider = SystemEnvironmentProvider::new();
        let path = provider.get_var("PATH");
        assert!(path.is_some());
        assert!(!path.unwrap().is_empty());
    }

    #[test]
    fn test_system_environment_provider_non_existing_var() {
        let provider = SystemEnvironmentProvider::new();
        assert!(provider.get_var("NON_EXISTING_VAR_12345").is_none());
    }

    #[test]
    fn test_environment_layer_empty() {
        let provider = TestEnvironmentProvider::new();
        let config = environment_layer(&provider).unwrap();
        assert!(config.package_manager.is_none());
        assert!(config.max_concurrency.is_none());
    }

    #[test]
    fn test_environment_layer_full() {
        let mut provider = TestEnvironmentProvider::new();
        provider.set_var("TASKLY_PACKAGE_MANAGER", "pnpm");
        provider.set_var("TASKLY_KILL_OTHERS_ON_FAIL", "true");
        provider.set_var("TASKLY_MAX_CONCURRENCY", "4");
        provider.set_var("TASKLY_VERBOSE", "1");
        provider.set_var("TASKLY_COLORS", "red, blue");
        provider.set_var("TASKLY_NAMES", "web,api");

        let config = environment_layer(&provider).unwrap();
        assert_eq!(config.package_manager, Some(PackageManagerKind::Pnpm));
        assert_eq!(config.kill_others_on_fail, Some(true));
        assert_eq!(config.max_concurrency, Some(4));
        assert!(config.verbose());
        assert_eq!(
            config.colors.unwrap(),
            vec!["red".to_string(), "blue".to_string()]
        );
        assert_eq!(
            config.names.unwrap(),
            vec!["web".to_string(), "api".to_string()]
        );
    }

    #[test]
    fn test_environment_layer_rejects_malformed_values() {
        let mut provider = TestEnvironmentProvider::new();
        provider.set_var("TASKLY_MAX_CONCURRENCY", "lots");
        assert!(environment_layer(&provider).is_err());

        let mut provider = TestEnvironmentProvider::new();
        provider.set_var("TASKLY_KILL_OTHERS_ON_FAIL", "maybe");
        assert!(environment_layer(&provider).is_err());

        let mut provider = TestEnvironmentProvider::new();
        provider.set_var("TASKLY_PACKAGE_MANAGER", "cargo");
        assert!(environment_layer(&provider).is_err());
    }
}
