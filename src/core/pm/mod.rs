//! Package manager detection and command rewriting.
//!
//! The resolver decides which package manager to invoke (preferred →
//! lockfile → npm fallback), rewrites script-ish commands into fully
//! qualified invocations, and expands `run` wildcards against
//! `package.json`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{TasklyError, TasklyResult};

/// How long an availability probe may run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerKind {
    Npm,
    Yarn,
    Pnpm,
    Bun,
}

impl PackageManagerKind {
    /// Executable name on PATH.
    pub fn executable(&self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm",
            PackageManagerKind::Yarn => "yarn",
            PackageManagerKind::Pnpm => "pnpm",
            PackageManagerKind::Bun => "bun",
        }
    }

    /// All supported kinds.
    pub fn all() -> [PackageManagerKind; 4] {
        [
            PackageManagerKind::Npm,
            PackageManagerKind::Yarn,
            PackageManagerKind::Pnpm,
            PackageManagerKind::Bun,
        ]
    }
}

impl fmt::Display for PackageManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable())
    }
}

impl FromStr for PackageManagerKind {
    type Err = TasklyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(PackageManagerKind::Npm),
            "yarn" => Ok(PackageManagerKind::Yarn),
            "pnpm" => Ok(PackageManagerKind::Pnpm),
            "bun" => Ok(PackageManagerKind::Bun),
            other => Err(TasklyError::config(format!(
                "unknown package manager: {other} (expected npm, yarn, pnpm or bun)"
            ))),
        }
    }
}

/// Lockfiles in fixed precedence order, mapped to their manager.
pub const LOCKFILE_PRECEDENCE: [(&str, PackageManagerKind); 5] = [
    ("package-lock.json", PackageManagerKind::Npm),
    ("npm-shrinkwrap.json", PackageManagerKind::Npm),
    ("yarn.lock", PackageManagerKind::Yarn),
    ("pnpm-lock.yaml", PackageManagerKind::Pnpm),
    ("bun.lockb", PackageManagerKind::Bun),
];

/// First tokens that mark a command as a package manager invocation.
const PM_SUBCOMMANDS: [&str; 16] = [
    "run", "exec", "install", "add", "remove", "uninstall", "update", "upgrade", "audit", "test",
    "start", "build", "dev", "serve", "lint", "format",
];

/// Where the resolution decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// The caller's preferred manager was available.
    Preferred,
    /// A lockfile in the working directory decided.
    Lockfile,
    /// Fell back to npm.
    Fallback,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionSource::Preferred => write!(f, "preferred"),
            ResolutionSource::Lockfile => write!(f, "lockfile"),
            ResolutionSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Outcome of one resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The manager to invoke
    pub package_manager: PackageManagerKind,
    /// How the decision was made
    pub source: ResolutionSource,
    /// Non-fatal conflict note when a lockfile disagrees with the choice
    pub warning: Option<String>,
}

/// Probe seam for package manager availability.
///
/// Production probes run `<pm> --version`; tests inject a static set so
/// resolution logic is exercised without touching PATH.
#[async_trait]
pub trait PmProber: Send + Sync {
    /// Whether the manager responds to `--version` on this machine.
    async fn is_available(&self, pm: PackageManagerKind) -> bool;
}

/// Probes the real system by invoking `<pm> --version`.
#[derive(Debug, Default)]
pub struct SystemPmProber;

#[async_trait]
impl PmProber for SystemPmProber {
    async fn is_available(&self, pm: PackageManagerKind) -> bool {
        let child = tokio::process::Command::new(pm.executable())
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match tokio::time::timeout(PROBE_TIMEOUT, child).await {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

/// Static availability set for tests.
#[derive(Debug, Default)]
pub struct StaticPmProber {
    available: HashSet<PackageManagerKind>,
}

impl StaticPmProber {
    /// A prober where only the given managers are available.
    pub fn with_available(available: &[PackageManagerKind]) -> Self {
        Self {
            available: available.iter().copied().collect(),
        }
    }
}

#[async_trait]
impl PmProber for StaticPmProber {
    async fn is_available(&self, pm: PackageManagerKind) -> bool {
        self.available.contains(&pm)
    }
}

/// Decides and rewrites package manager invocations.
pub struct PackageManagerResolver {
    prober: Arc<dyn PmProber>,
    probe_cache: Mutex<HashMap<PackageManagerKind, bool>>,
}

impl PackageManagerResolver {
    /// Resolver backed by the system prober.
    pub fn new() -> Self {
        Self::with_prober(Arc::new(SystemPmProber))
    }

    /// Resolver with an injected prober.
    pub fn with_prober(prober: Arc<dyn PmProber>) -> Self {
        Self {
            prober,
            probe_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn available(&self, pm: PackageManagerKind) -> bool {
        if let Some(&cached) = self
            .probe_cache
            .lock()
            .expect("probe cache poisoned")
            .get(&pm)
        {
            return cached;
        }
        let result = self.prober.is_available(pm).await;
        self.probe_cache
            .lock()
            .expect("probe cache poisoned")
            .insert(pm, result);
        result
    }

    /// The lockfile-implied manager for a directory, if any.
    pub fn lockfile_hint(cwd: &Path) -> Option<(&'static str, PackageManagerKind)> {
        LOCKFILE_PRECEDENCE
            .iter()
            .find(|(file, _)| cwd.join(file).is_file())
            .copied()
    }

    /// Resolve which manager to use for a working directory.
    ///
    /// Detection order: preferred (if available) → lockfile-implied (if
    /// available) → npm fallback. A lockfile that disagrees with the
    /// final choice produces a non-fatal warning on the resolution.
    ///
    /// # Errors
    ///
    /// [`TasklyError::PmNotFound`] when nothing usable is on PATH.
    pub async fn resolve(
        &self,
        preferred: Option<PackageManagerKind>,
        cwd: &Path,
    ) -> TasklyResult<Resolution> {
        let hint = Self::lockfile_hint(cwd);

        if let Some(pm) = preferred {
            if self.available(pm).await {
                let warning = hint.and_then(|(file, implied)| {
                    (implied != pm).then(|| {
                        format!(
                            "lockfile {file} suggests {implied}, but {pm} was preferred"
                        )
                    })
                });
                return Ok(Resolution {
                    package_manager: pm,
                    source: ResolutionSource::Preferred,
                    warning,
                });
            }
            log::debug!("preferred package manager {pm} unavailable, falling through");
        }

        if let Some((_, implied)) = hint {
            if self.available(implied).await {
                return Ok(Resolution {
                    package_manager: implied,
                    source: ResolutionSource::Lockfile,
                    warning: None,
                });
            }
        }

        if self.available(PackageManagerKind::Npm).await {
            let warning = hint.and_then(|(file, implied)| {
                (implied != PackageManagerKind::Npm).then(|| {
                    format!("lockfile {file} suggests {implied}, but only npm is available")
                })
            });
            return Ok(Resolution {
                package_manager: PackageManagerKind::Npm,
                source: ResolutionSource::Fallback,
                warning,
            });
        }

        let requested = preferred
            .map(|pm| pm.to_string())
            .unwrap_or_else(|| "npm".to_string());
        Err(TasklyError::pm_not_found(requested))
    }

    /// Rewrite a script-ish command into a fully qualified invocation.
    ///
    /// Commands whose first token is a known package manager subcommand
    /// are prefixed with the resolved executable; commands that already
    /// start with any package manager executable are a fixed point.
    pub fn rewrite_command(pm: PackageManagerKind, command: &str) -> String {
        let trimmed = command.trim();
        let first = trimmed.split_whitespace().next().unwrap_or("");
        if PackageManagerKind::all()
            .iter()
            .any(|k| k.executable() == first)
        {
            return trimmed.to_string();
        }
        if PM_SUBCOMMANDS.contains(&first) {
            return format!("{} {trimmed}", pm.executable());
        }
        trimmed.to_string()
    }

    /// Expand `<pm> run <pattern>` wildcards against `package.json`.
    ///
    /// `*` is the only wildcard and matches any substring. Matching
    /// script names produce one concrete command each, alphabetically.
    /// Commands that are not a wildcard `run` pass through unchanged. A
    /// wildcard with no matches passes through too, unless
    /// `ignore_missing` is set, in which case it expands to nothing and
    /// the returned warning explains the skip.
    pub fn expand_wildcards(
        pm: PackageManagerKind,
        command: &str,
        cwd: &Path,
        ignore_missing: bool,
    ) -> TasklyResult<Expansion> {
        let prefix = format!("{} run ", pm.executable());
        let pattern = match command.strip_prefix(&prefix) {
            Some(rest) if rest.contains('*') => rest.trim(),
            _ => {
                return Ok(Expansion {
                    commands: vec![command.to_string()],
                    warning: None,
                });
            }
        };

        let scripts = read_package_scripts(cwd)?;
        let mut matches: Vec<String> = scripts
            .into_iter()
            .filter(|name| glob_match(pattern, name))
            .collect();
        matches.sort();

        if matches.is_empty() {
            if ignore_missing {
                return Ok(Expansion {
                    commands: Vec::new(),
                    warning: Some(format!(
                        "no scripts match \"{pattern}\"; task skipped"
                    )),
                });
            }
            return Ok(Expansion {
                commands: vec![command.to_string()],
                warning: None,
            });
        }

        Ok(Expansion {
            commands: matches
                .into_iter()
                .map(|name| format!("{} run {name}", pm.executable()))
                .collect(),
            warning: None,
        })
    }
}

impl Default for PackageManagerResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of wildcard expansion.
#[derive(Debug, Clone)]
pub struct Expansion {
    /// Concrete commands to run (possibly empty when skipped)
    pub commands: Vec<String>,
    /// Non-fatal note when the expansion skipped the task
    pub warning: Option<String>,
}

/// Script names from `cwd/package.json`, empty when the file is absent.
fn read_package_scripts(cwd: &Path) -> TasklyResult<Vec<String>> {
    let path = cwd.join("package.json");
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&path)?;
    let json: serde_json::Value = serde_json::from_str(&raw)?;
    Ok(json
        .get("scripts")
        .and_then(|s| s.as_object())
        .map(|scripts| scripts.keys().cloned().collect())
        .unwrap_or_default())
}

/// Glob match where `*` matches any substring and everything else is
/// literal.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with '*', which matches any remainder.
    true
}
