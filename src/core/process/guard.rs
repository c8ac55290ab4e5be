//! Pre-spawn command screening and environment scrubbing.
//!
//! Screening happens before a child is created: a blocklist match raises
//! [`TasklyError::CommandInjection`] and nothing is spawned. Chained shell
//! operators are legal but surfaced as a warning so users notice compound
//! commands running under one prefix.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::{TasklyError, TasklyResult};

/// Environment variables removed from every child environment.
///
/// These are dynamic loader / runtime injection hooks; letting a task
/// overlay inherit them produces surprising ambient authority.
pub const SCRUBBED_ENV_VARS: [&str; 5] = [
    "LD_PRELOAD",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "NODE_OPTIONS",
];

struct BlockedPattern {
    name: &'static str,
    regex: Regex,
}

static BLOCKLIST: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    let table: [(&str, &str); 6] = [
        (
            "recursive root deletion",
            r"rm\s+-[A-Za-z]*[rR][A-Za-z]*\s+(--no-preserve-root\s+)?/(\s|$|\*)",
        ),
        (
            "recursive root deletion",
            r"rm\s+-[A-Za-z]*[rR][A-Za-z]*\s+--no-preserve-root",
        ),
        (
            "privilege elevation with destructive command",
            r"sudo\s+(rm\s+-[A-Za-z]*[rR]|mkfs(\.\w+)?\b|dd\s+[^|;&]*of=/dev/)",
        ),
        (
            "shell substitution around destructive command",
            r"\$\([^)]*rm\s+-[A-Za-z]*[rR][^)]*\)",
        ),
        (
            "shell substitution around destructive command",
            r"`[^`]*rm\s+-[A-Za-z]*[rR][^`]*`",
        ),
        (
            "piping downloaded content into a shell",
            r"(curl|wget)\b[^|;]*\|\s*(sudo\s+)?\w*sh\b",
        ),
    ];
    table
        .into_iter()
        .map(|(name, pattern)| BlockedPattern {
            name,
            regex: Regex::new(pattern).expect("blocklist pattern must compile"),
        })
        .collect()
});

static CHAIN_OPERATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(&&|\|\||\||;|`|\$\()").expect("chain pattern must compile"));

/// Screen a command against the dangerous-pattern blocklist.
///
/// # Errors
///
/// Returns [`TasklyError::CommandInjection`] on the first match; the
/// caller must not spawn the command.
pub fn screen_command(command: &str) -> TasklyResult<()> {
    for pattern in BLOCKLIST.iter() {
        if pattern.regex.is_match(command) {
            return Err(TasklyError::CommandInjection {
                command: command.to_string(),
                pattern: pattern.name.to_string(),
            });
        }
    }
    Ok(())
}

/// Non-fatal warning when a command chains shell operators.
pub fn chained_operator_warning(command: &str) -> Option<String> {
    CHAIN_OPERATORS.find(command).map(|m| {
        format!(
            "command contains shell operator '{}'; it will run as one shell line",
            m.as_str()
        )
    })
}

/// Build the child environment: parent env, minus the scrub list, plus the
/// task overlay and supervisor-provided additions.
///
/// The overlay wins over the parent; `additions` win over both. Scrubbed
/// variables are dropped even when the overlay reintroduces them.
pub fn build_child_env(
    overlay: &HashMap<String, String>,
    additions: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in overlay {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in additions {
        env.insert(key.clone(), value.clone());
    }
    for var in SCRUBBED_ENV_VARS {
        env.remove(var);
    }
    env
}
