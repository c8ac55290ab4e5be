//! Per-task color assignment and prefixed line formatting.
//!
//! The formatter is pure: it returns presentation strings and never writes
//! to a stream. Color codes are plain SGR sequences because the exact open
//! code is part of the contract with child processes (exported as
//! `TASKLY_TASK_ANSI_CODE`).

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Mutex;

use crate::error::{TasklyError, TasklyResult};

const RESET: &str = "\x1b[0m";

/// Ordered palette cycled through for tasks without an explicit color.
const DEFAULT_PALETTE: [&str; 12] = [
    "cyan",
    "magenta",
    "green",
    "yellow",
    "blue",
    "red",
    "brightCyan",
    "brightMagenta",
    "brightGreen",
    "brightYellow",
    "brightBlue",
    "brightRed",
];

/// Values available to prefix templates.
#[derive(Debug, Clone, Default)]
pub struct PrefixContext {
    /// Submission index of the task
    pub index: usize,
    /// Child pid, when running
    pub pid: Option<u32>,
    /// Wall-clock time string (HH:MM:SS)
    pub time: String,
    /// The task's effective command
    pub command: String,
    /// The task identifier
    pub name: String,
}

/// Render a prefix template, substituting the recognized placeholders.
///
/// Recognized placeholders: `{index}`, `{pid}`, `{time}`, `{command}`,
/// `{name}`. Unknown placeholders are left untouched.
pub fn render_prefix(template: &str, ctx: &PrefixContext) -> String {
    template
        .replace("{index}", &ctx.index.to_string())
        .replace(
            "{pid}",
            &ctx.pid.map(|p| p.to_string()).unwrap_or_default(),
        )
        .replace("{time}", &ctx.time)
        .replace("{command}", &ctx.command)
        .replace("{name}", &ctx.name)
}

/// Parse a color specification into its SGR open sequence.
///
/// Accepts predefined names (standard and bright variants, case and
/// separator insensitive), `#RRGGBB`, and `rgb(r,g,b)` with components in
/// 0..=255.
pub fn parse_color_spec(spec: &str) -> TasklyResult<String> {
    let trimmed = spec.trim();

    if let Some(code) = named_color_code(trimmed) {
        return Ok(format!("\x1b[{code}m"));
    }

    if let Some(hex) = trimmed.strip_prefix('#') {
        if hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            let r = u8::from_str_radix(&hex[0..2], 16).unwrap_or(0);
            let g = u8::from_str_radix(&hex[2..4], 16).unwrap_or(0);
            let b = u8::from_str_radix(&hex[4..6], 16).unwrap_or(0);
            return Ok(format!("\x1b[38;2;{r};{g};{b}m"));
        }
        return Err(TasklyError::validation(format!(
            "invalid hex color: {trimmed}"
        )));
    }

    let lower = trimmed.to_ascii_lowercase();
    if let Some(body) = lower
        .strip_prefix("rgb(")
        .and_then(|s| s.strip_suffix(')'))
    {
        let parts: Vec<&str> = body.split(',').map(str::trim).collect();
        if parts.len() == 3 {
            let mut rgb = [0u8; 3];
            for (slot, part) in rgb.iter_mut().zip(&parts) {
                *slot = part.parse::<u8>().map_err(|_| {
                    TasklyError::validation(format!("invalid rgb component in: {trimmed}"))
                })?;
            }
            return Ok(format!("\x1b[38;2;{};{};{}m", rgb[0], rgb[1], rgb[2]));
        }
        return Err(TasklyError::validation(format!(
            "invalid rgb color: {trimmed}"
        )));
    }

    Err(TasklyError::validation(format!(
        "unknown color: {trimmed}"
    )))
}

/// SGR foreground code for a predefined color name, if recognized.
fn named_color_code(name: &str) -> Option<u8> {
    let normalized: String = name
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .collect::<String>()
        .to_ascii_lowercase();
    let (bright, base) = match normalized.strip_prefix("bright") {
        Some(rest) => (true, rest),
        None => (false, normalized.as_str()),
    };
    let code = match base {
        "black" => 30,
        "red" => 31,
        "green" => 32,
        "yellow" => 33,
        "blue" => 34,
        "magenta" => 35,
        "cyan" => 36,
        "white" => 37,
        // gray is the bright variant of black
        "gray" | "grey" => return Some(90),
        _ => return None,
    };
    Some(if bright { code + 60 } else { code })
}

/// Detect whether colored output should be produced.
///
/// `NO_COLOR` disables, `FORCE_COLOR`/`CLICOLOR_FORCE` enable, otherwise
/// colors are on when stdout is a terminal whose `TERM` looks capable.
pub fn detect_color_support() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() || std::env::var_os("CLICOLOR_FORCE").is_some() {
        return true;
    }
    if !std::io::stdout().is_terminal() {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) => term != "dumb" && !term.is_empty(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
struct Assignment {
    open_code: String,
    spec: String,
}

#[derive(Debug, Default)]
struct FormatterInner {
    assignments: HashMap<String, Assignment>,
    next_palette_slot: usize,
}

/// Assigns a stable color per task identifier and formats output lines.
///
/// # Examples
///
/// ```rust
/// use taskly_cli::core::color::ColorFormatter;
///
/// let formatter = ColorFormatter::with_support(false);
/// formatter.register("web", None).unwrap();
/// // Without color support the content passes through unchanged.
/// assert_eq!(formatter.format("web", "listening"), "listening");
/// ```
pub struct ColorFormatter {
    inner: Mutex<FormatterInner>,
    supports_color: bool,
}

impl ColorFormatter {
    /// Create a formatter using detected terminal capabilities.
    pub fn new() -> Self {
        Self::with_support(detect_color_support())
    }

    /// Create a formatter with color support forced on or off.
    pub fn with_support(supports_color: bool) -> Self {
        Self {
            inner: Mutex::new(FormatterInner::default()),
            supports_color,
        }
    }

    /// Whether this formatter emits SGR sequences.
    pub fn supports_color(&self) -> bool {
        self.supports_color
    }

    /// Register an identifier, optionally with an explicit color spec.
    ///
    /// The first registration wins; re-registering an identifier is a
    /// no-op even with a different spec. Without an explicit spec the next
    /// palette color is assigned.
    pub fn register(&self, identifier: &str, spec: Option<&str>) -> TasklyResult<()> {
        let mut inner = self.inner.lock().expect("color formatter poisoned");
        if inner.assignments.contains_key(identifier) {
            return Ok(());
        }
        let (spec, open_code) = match spec {
            Some(explicit) => (explicit.to_string(), parse_color_spec(explicit)?),
            None => {
                let name = DEFAULT_PALETTE[inner.next_palette_slot % DEFAULT_PALETTE.len()];
                inner.next_palette_slot += 1;
                (name.to_string(), parse_color_spec(name)?)
            }
        };
        inner
            .assignments
            .insert(identifier.to_string(), Assignment { open_code, spec });
        Ok(())
    }

    /// The SGR open code assigned to an identifier, if registered.
    pub fn ansi_code(&self, identifier: &str) -> Option<String> {
        let inner = self.inner.lock().expect("color formatter poisoned");
        inner
            .assignments
            .get(identifier)
            .map(|a| a.open_code.clone())
    }

    /// The color spec recorded for an identifier, if registered.
    pub fn color_spec(&self, identifier: &str) -> Option<String> {
        let inner = self.inner.lock().expect("color formatter poisoned");
        inner.assignments.get(identifier).map(|a| a.spec.clone())
    }

    /// Format a content line with the identifier's colored prefix.
    ///
    /// Unregistered identifiers and formatters without color support
    /// return the content unchanged.
    pub fn format(&self, identifier: &str, content: &str) -> String {
        let inner = self.inner.lock().expect("color formatter poisoned");
        match inner.assignments.get(identifier) {
            Some(assignment) if self.supports_color => {
                format!(
                    "{}[{identifier}]{RESET} {content}",
                    assignment.open_code
                )
            }
            _ => content.to_string(),
        }
    }
}

impl Default for ColorFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_ansi(input: &str) -> String {
        let re = regex::Regex::new("\x1b\\[[0-9;]*m").unwrap();
        re.replace_all(input, "").to_string()
    }

    #[test]
    fn test_named_colors_standard_and_bright() {
        assert_eq!(parse_color_spec("red").unwrap(), "\x1b[31m");
        assert_eq!(parse_color_spec("brightRed").unwrap(), "\x1b[91m");
        assert_eq!(parse_color_spec("bright-blue").unwrap(), "\x1b[94m");
        assert_eq!(parse_color_spec("GRAY").unwrap(), "\x1b[90m");
    }

    #[test]
    fn test_hex_and_rgb_colors() {
        assert_eq!(parse_color_spec("#ff8000").unwrap(), "\x1b[38;2;255;128;0m");
        assert_eq!(
            parse_color_spec("rgb(0, 128, 255)").unwrap(),
            "\x1b[38;2;0;128;255m"
        );
    }

    #[test]
    fn test_invalid_color_specs() {
        assert!(parse_color_spec("chartreuse-ish").is_err());
        assert!(parse_color_spec("#12345").is_err());
        assert!(parse_color_spec("rgb(300,0,0)").is_err());
        assert!(parse_color_spec("rgb(1,2)").is_err());
    }

    #[test]
    fn test_unregistered_identifier_passes_through() {
        let formatter = ColorFormatter::with_support(true);
        assert_eq!(formatter.format("ghost", "hello"), "hello");
    }

    #[test]
    fn test_registered_identifier_round_trip() {
        let formatter = ColorFormatter::with_support(true);
        formatter.register("web", None).unwrap();
        let formatted = formatter.format("web", "listening on :3000");
        assert_eq!(strip_ansi(&formatted), "[web] listening on :3000");
    }

    #[test]
    fn test_palette_cycles_in_order() {
        let formatter = ColorFormatter::with_support(true);
        for i in 0..DEFAULT_PALETTE.len() + 1 {
            formatter.register(&format!("t{i}"), None).unwrap();
        }
        // Slot 12 wraps back to the first palette entry.
        assert_eq!(
            formatter.ansi_code("t0"),
            formatter.ansi_code(&format!("t{}", DEFAULT_PALETTE.len()))
        );
        assert_ne!(formatter.ansi_code("t0"), formatter.ansi_code("t1"));
    }

    #[test]
    fn test_reassignment_is_ignored() {
        let formatter = ColorFormatter::with_support(true);
        formatter.register("api", Some("red")).unwrap();
        let first = formatter.ansi_code("api").unwrap();
        formatter.register("api", Some("blue")).unwrap();
        assert_eq!(formatter.ansi_code("api").unwrap(), first);
    }

    #[test]
    fn test_explicit_invalid_color_fails_registration() {
        let formatter = ColorFormatter::with_support(true);
        assert!(formatter.register("bad", Some("not-a-color")).is_err());
        assert!(formatter.ansi_code("bad").is_none());
    }

    #[test]
    fn test_render_prefix_placeholders() {
        let ctx = PrefixContext {
            index: 2,
            pid: Some(4242),
            time: "12:30:01".into(),
            command: "npm run dev".into(),
            name: "dev".into(),
        };
        assert_eq!(
            render_prefix("{index}:{name}({pid}) {time} $ {command}", &ctx),
            "2:dev(4242) 12:30:01 $ npm run dev"
        );
        assert_eq!(render_prefix("{unknown}", &ctx), "{unknown}");
    }
}
