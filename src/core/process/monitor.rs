//! Advisory resource sampling for supervised children.
//!
//! Samples are taken at roughly 1 Hz by the supervisor and published as
//! `task:resource-check` events. Sampling failures are non-fatal; the
//! supervisor downgrades them to a single `task:monitor-warning`.

use std::time::Instant;

use crate::core::task::epoch_millis;

/// One point-in-time resource reading for a child process.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    /// Sampled process id
    pub pid: u32,
    /// Resident set size in bytes
    pub rss_bytes: u64,
    /// CPU usage since the previous sample, in percent of one core.
    ///
    /// May exceed 100 on multi-threaded children; the theoretical ceiling
    /// is `100 * num_cpus`.
    pub cpu_percent: f64,
    /// Milliseconds since the Unix epoch at sample time
    pub timestamp_ms: u64,
}

/// Stateful sampler for one pid.
///
/// CPU percentages are derived from the tick delta between consecutive
/// calls, so the first sample always reports 0.
#[derive(Debug)]
pub struct ResourceMonitor {
    pid: u32,
    prev_ticks: Option<u64>,
    prev_at: Instant,
}

impl ResourceMonitor {
    /// Create a monitor for the given pid.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            prev_ticks: None,
            prev_at: Instant::now(),
        }
    }

    /// Take one sample.
    ///
    /// # Errors
    ///
    /// Fails when the process is gone or the platform exposes no
    /// per-process accounting (non-Linux builds).
    pub fn sample(&mut self) -> std::io::Result<ResourceSample> {
        let (rss_bytes, total_ticks) = read_proc_usage(self.pid)?;

        let now = Instant::now();
        let elapsed = now.duration_since(self.prev_at).as_secs_f64();
        let cpu_percent = match self.prev_ticks {
            Some(prev) if elapsed > 0.0 => {
                let delta = total_ticks.saturating_sub(prev) as f64;
                let ceiling = 100.0 * num_cpus::get() as f64;
                ((delta / clock_ticks_per_second()) / elapsed * 100.0).min(ceiling)
            }
            _ => 0.0,
        };
        self.prev_ticks = Some(total_ticks);
        self.prev_at = now;

        Ok(ResourceSample {
            pid: self.pid,
            rss_bytes,
            cpu_percent,
            timestamp_ms: epoch_millis(),
        })
    }
}

#[cfg(unix)]
fn clock_ticks_per_second() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

#[cfg(not(unix))]
fn clock_ticks_per_second() -> f64 {
    100.0
}

/// Read `(rss_bytes, utime+stime ticks)` for a pid.
#[cfg(target_os = "linux")]
fn read_proc_usage(pid: u32) -> std::io::Result<(u64, u64)> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm"))?;
    let rss_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| std::io::Error::other("malformed statm"))?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if page_size > 0 { page_size as u64 } else { 4096 };

    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    // Skip past the parenthesized comm field, which may contain spaces.
    let after_comm = stat
        .rfind(')')
        .map(|i| &stat[i + 2..])
        .ok_or_else(|| std::io::Error::other("malformed stat"))?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Fields 14 and 15 of the full stat line are utime and stime; after
    // stripping pid and comm they land at offsets 11 and 12.
    let utime: u64 = fields
        .get(11)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| std::io::Error::other("malformed stat utime"))?;
    let stime: u64 = fields
        .get(12)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| std::io::Error::other("malformed stat stime"))?;

    Ok((rss_pages * page_size, utime + stime))
}

#[cfg(not(target_os = "linux"))]
fn read_proc_usage(_pid: u32) -> std::io::Result<(u64, u64)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "per-process resource sampling is only implemented on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sample_own_process() {
        let mut monitor = ResourceMonitor::new(std::process::id());
        let sample = monitor.sample().expect("self should be sampleable");
        assert_eq!(sample.pid, std::process::id());
        assert!(sample.rss_bytes > 0);
        assert_eq!(sample.cpu_percent, 0.0); // first sample has no baseline
        assert!(sample.timestamp_ms > 0);
    }

    #[test]
    fn test_sample_missing_process_fails() {
        // Pid 0 is never a visible child of ours.
        let mut monitor = ResourceMonitor::new(0);
        assert!(monitor.sample().is_err());
    }
}
