//! Resource usage sampling from OS process-accounting files.
//!
//! Reads cumulative CPU time from `/proc/<pid>/stat` and resident memory
//! from `/proc/<pid>/statm` on a fixed cadence. Read failures are normal
//! during process teardown and are skipped per sample, never surfaced.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

/// One resource usage sample. Most-recent-value semantics: new samples
/// overwrite, consumers never accumulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageSample {
    /// Instantaneous CPU usage in percent, clamped to [0, 100].
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
}

/// Cumulative accounting values for one process at one point in time.
#[derive(Debug, Clone, Copy)]
pub struct ProcUsage {
    /// Total CPU seconds (user + system) consumed so far.
    pub cpu_seconds: f64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
}

/// Read the accounting files for a process. `None` when the process is
/// gone or mid-teardown — expected, not an error.
pub fn read_proc_usage(pid: u32) -> Option<ProcUsage> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let ticks = parse_stat_cpu_ticks(&stat)?;

    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let rss_pages = parse_statm_rss_pages(&statm)?;

    Some(ProcUsage {
        cpu_seconds: ticks as f64 / clock_ticks_per_second(),
        rss_bytes: rss_pages * page_size_bytes(),
    })
}

/// Sum of utime and stime (clock ticks) from a `/proc/<pid>/stat` line.
/// The command field is parenthesized and may contain spaces, so fields
/// are counted from the last `)`.
fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Post-comm index 11 = utime (field 14), 12 = stime (field 15).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Second column of `/proc/<pid>/statm` is the resident page count.
fn parse_statm_rss_pages(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

fn clock_ticks_per_second() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 { ticks as f64 } else { 100.0 }
}

fn page_size_bytes() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as u64 } else { 4096 }
}

/// Instantaneous CPU percentage from cumulative-time deltas, clamped to
/// [0, 100]. Multi-core accounting can mathematically exceed 100% — the
/// clamp keeps the published value a sane single-gauge percentage.
pub fn cpu_percent(cpu_delta_seconds: f64, wall_delta_seconds: f64) -> f32 {
    if wall_delta_seconds <= 0.0 {
        return 0.0;
    }
    ((cpu_delta_seconds / wall_delta_seconds) * 100.0).clamp(0.0, 100.0) as f32
}

/// Tracks the previous CPU sample of one process to compute deltas.
pub struct CpuTracker {
    last_cpu_seconds: f64,
    last_sampled: std::time::Instant,
}

impl CpuTracker {
    pub fn new(initial_cpu_seconds: f64) -> Self {
        Self {
            last_cpu_seconds: initial_cpu_seconds,
            last_sampled: std::time::Instant::now(),
        }
    }

    /// Fold in a new cumulative reading and return the instantaneous
    /// percentage since the previous one.
    pub fn update(&mut self, cpu_seconds: f64) -> f32 {
        let now = std::time::Instant::now();
        let wall = now.duration_since(self.last_sampled).as_secs_f64();
        let pct = cpu_percent(cpu_seconds - self.last_cpu_seconds, wall);
        self.last_cpu_seconds = cpu_seconds;
        self.last_sampled = now;
        pct
    }
}

/// Registry of per-workload usage streams, created lazily on first access.
/// `watch` gives exactly the required semantics: last value wins, every
/// consumer sees the most recent sample.
#[derive(Default)]
pub struct UsageHub {
    channels: DashMap<String, watch::Sender<UsageSample>>,
}

impl UsageHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, workload_id: &str) -> watch::Sender<UsageSample> {
        self.channels
            .entry(workload_id.to_string())
            .or_insert_with(|| watch::channel(UsageSample::default()).0)
            .clone()
    }

    pub fn publish(&self, workload_id: &str, sample: UsageSample) {
        trace!(
            "usage {}: cpu={:.1}% rss={}B",
            workload_id, sample.cpu_percent, sample.memory_bytes
        );
        self.channel(workload_id).send_replace(sample);
    }

    pub fn subscribe(&self, workload_id: &str) -> watch::Receiver<UsageSample> {
        self.channel(workload_id).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_clamped_to_100() {
        // 8 cores fully busy: 40 CPU-seconds over 5 wall-seconds.
        assert_eq!(cpu_percent(40.0, 5.0), 100.0);
        // Clock skew producing a negative delta clamps to zero.
        assert_eq!(cpu_percent(-1.0, 5.0), 0.0);
        // Degenerate wall delta.
        assert_eq!(cpu_percent(1.0, 0.0), 0.0);
    }

    #[test]
    fn test_cpu_percent_normal_range() {
        let pct = cpu_percent(2.5, 5.0);
        assert!((pct - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        // comm field "(tmux: server)" contains a space and parentheses.
        let stat = "1234 (tmux: server) S 1 1234 1234 0 -1 4194304 2000 0 0 0 \
                    150 75 0 0 20 0 1 0 100000 10000000 500 18446744073709551615";
        assert_eq!(parse_stat_cpu_ticks(stat), Some(225));
    }

    #[test]
    fn test_parse_statm_rss() {
        assert_eq!(parse_statm_rss_pages("2048 512 300 12 0 200 0"), Some(512));
        assert_eq!(parse_statm_rss_pages(""), None);
    }

    #[test]
    fn test_read_proc_usage_self() {
        // Our own accounting files always exist on Linux.
        let usage = read_proc_usage(std::process::id()).expect("self usage");
        assert!(usage.rss_bytes > 0);
        assert!(usage.cpu_seconds >= 0.0);
    }

    #[test]
    fn test_read_proc_usage_gone_process_is_none() {
        // PID near the default pid_max upper bound — not a live process.
        assert!(read_proc_usage(4_000_000).is_none());
    }

    #[tokio::test]
    async fn test_usage_stream_last_value_wins() {
        let hub = UsageHub::new();
        let mut rx = hub.subscribe("w");

        hub.publish("w", UsageSample { cpu_percent: 10.0, memory_bytes: 100 });
        hub.publish("w", UsageSample { cpu_percent: 90.0, memory_bytes: 900 });

        rx.changed().await.unwrap();
        let sample = *rx.borrow_and_update();
        assert_eq!(sample.cpu_percent, 90.0);
        assert_eq!(sample.memory_bytes, 900);
    }
}
