//! Workload process supervision.
//!
//! Spawns workload processes from a provisioned runtime, registers them,
//! multiplexes their output into per-workload log streams, extracts
//! lifecycle events, samples resource usage, and manages stop/kill.

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::events::{self, LogEvent, ParticipantRoster};
use crate::logs::LogHub;
use crate::registry::{ManagedProcess, ProcessRegistry};
use crate::usage::{CpuTracker, UsageHub, UsageSample, read_proc_usage};

/// Everything needed to launch one workload process. The supervisor does
/// not interpret `args` — they are passed through verbatim.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Absolute path to the executable (normally `<runtime_root>/bin/java`).
    pub executable: PathBuf,
    /// Argument list, passed through uninterpreted.
    pub args: Vec<String>,
    /// The workload's own directory; becomes the process working directory.
    pub working_dir: PathBuf,
    /// Environment overlay merged over the inherited environment.
    pub env: HashMap<String, String>,
    /// Provisioned runtime root whose `lib/` leads the library search path.
    pub runtime_root: PathBuf,
    /// Host native-library directories appended after the runtime's own.
    pub host_lib_dirs: Vec<PathBuf>,
}

/// Tunables for the supervisor. Defaults come from `pkg-constants`;
/// tests shorten the timeouts.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Input line that asks the workload to shut down on its own.
    pub graceful_stop_command: String,
    /// How long `stop` waits before escalating to a force kill.
    pub stop_timeout: Duration,
    /// Liveness poll interval while waiting for a graceful exit.
    pub stop_poll_interval: Duration,
    /// Cadence of resource usage samples.
    pub sample_interval: Duration,
    /// Replay buffer size of each workload's log stream.
    pub log_replay_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        use pkg_constants::workload as w;
        Self {
            graceful_stop_command: w::GRACEFUL_STOP_COMMAND.to_string(),
            stop_timeout: Duration::from_secs(w::STOP_TIMEOUT_SECS),
            stop_poll_interval: Duration::from_millis(w::STOP_POLL_INTERVAL_MS),
            sample_interval: Duration::from_secs(w::USAGE_SAMPLE_INTERVAL_SECS),
            log_replay_capacity: w::LOG_REPLAY_CAPACITY,
        }
    }
}

/// A permission change extracted from a workload's output, delivered on
/// the supervisor-wide notification channel.
#[derive(Debug, Clone)]
pub struct WorkloadNotification {
    pub workload_id: String,
    pub event: LogEvent,
}

struct SupervisorInner {
    registry: ProcessRegistry,
    /// Guards the spawn window so two concurrent starts for the same
    /// workload id produce exactly one process.
    starting: DashMap<String, ()>,
    logs: LogHub,
    usage: UsageHub,
    roster: ParticipantRoster,
    notifications: broadcast::Sender<WorkloadNotification>,
    config: SupervisorConfig,
}

/// Workload process supervisor. Cheap to clone — all state is shared.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Build a supervisor around an explicitly-owned registry. The
    /// registry is injected rather than global so callers control its
    /// lifetime and tests can inspect it directly.
    pub fn new(registry: ProcessRegistry, config: SupervisorConfig) -> Self {
        let (notifications, _) = broadcast::channel(256);
        let log_replay_capacity = config.log_replay_capacity;
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                starting: DashMap::new(),
                logs: LogHub::new(log_replay_capacity),
                usage: UsageHub::new(),
                roster: ParticipantRoster::new(),
                notifications,
                config,
            }),
        }
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Start a workload. A no-op when an entry for `workload_id` already
    /// has a live process — never a second process.
    pub async fn start(&self, workload_id: &str, spec: &LaunchSpec) -> Result<()> {
        if let Some(existing) = self.inner.registry.get(workload_id) {
            if existing.is_alive().await {
                info!("workload {} already running — start is a no-op", workload_id);
                return Ok(());
            }
            // Stale entry from a crash the output loop has not reaped yet.
            self.inner.registry.remove(workload_id);
        }

        match self.inner.starting.entry(workload_id.to_string()) {
            Entry::Occupied(_) => {
                debug!("workload {} is already starting", workload_id);
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let result = self.spawn_and_register(workload_id, spec).await;
        self.inner.starting.remove(workload_id);
        result
    }

    async fn spawn_and_register(&self, workload_id: &str, spec: &LaunchSpec) -> Result<()> {
        // Validate synchronously so a failed start never leaves a
        // half-registered entry or background loops.
        if !spec.executable.is_file() {
            bail!(
                "executable for workload {} not found: {}",
                workload_id,
                spec.executable.display()
            );
        }
        if !spec.working_dir.is_dir() {
            bail!(
                "working directory for workload {} missing: {}",
                workload_id,
                spec.working_dir.display()
            );
        }

        let library_path = build_library_path(
            &spec.runtime_root,
            &spec.host_lib_dirs,
            std::env::var("LD_LIBRARY_PATH").ok().as_deref(),
        );

        let mut cmd = tokio::process::Command::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .env("LD_LIBRARY_PATH", library_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn workload {workload_id}"))?;
        let stdout = child.stdout.take().context("stdout pipe missing")?;
        let stderr = child.stderr.take().context("stderr pipe missing")?;

        let managed = Arc::new(ManagedProcess::new(workload_id, child));
        self.inner.registry.insert(workload_id, managed.clone());

        // The OS identifier is not always available synchronously.
        let mut pid = None;
        for _ in 0..pkg_constants::workload::PID_RETRY_ATTEMPTS {
            pid = managed.os_pid().await;
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(
                pkg_constants::workload::PID_RETRY_DELAY_MS,
            ))
            .await;
        }

        match pid {
            Some(pid) => {
                info!("workload {} started with pid {}", workload_id, pid);
                self.inner
                    .logs
                    .publish(workload_id, &format!("Process started with pid {pid}"))
                    .await;
            }
            None => {
                warn!("workload {} started but pid retrieval failed", workload_id);
                self.inner
                    .logs
                    .publish(workload_id, "Process started (pid unknown)")
                    .await;
            }
        }

        self.spawn_output_loop(workload_id.to_string(), stdout, true);
        self.spawn_output_loop(workload_id.to_string(), stderr, false);
        self.spawn_usage_loop(workload_id.to_string(), managed, pid);
        Ok(())
    }

    /// Graceful stop: send the shutdown command, wait up to the bound,
    /// escalate to a force kill. The registry entry is removed no matter
    /// which path ran.
    pub async fn stop(&self, workload_id: &str) {
        let Some(process) = self.inner.registry.get(workload_id) else {
            return;
        };
        info!("stopping workload {} gracefully", workload_id);
        process
            .write_line(&self.inner.config.graceful_stop_command)
            .await;

        let deadline = tokio::time::Instant::now() + self.inner.config.stop_timeout;
        while tokio::time::Instant::now() < deadline {
            if !process.is_alive().await {
                break;
            }
            tokio::time::sleep(self.inner.config.stop_poll_interval).await;
        }

        if process.is_alive().await {
            warn!(
                "workload {} ignored graceful stop — force killing",
                workload_id
            );
            process.force_kill().await;
        }

        self.inner.registry.remove(workload_id);
        self.inner.roster.clear(workload_id);
    }

    /// Immediate force kill, no graceful attempt.
    pub async fn kill(&self, workload_id: &str) {
        if let Some(process) = self.inner.registry.remove(workload_id) {
            warn!("force killing workload {}", workload_id);
            process.force_kill().await;
        }
        self.inner.roster.clear(workload_id);
    }

    /// Write a console command to the workload's stdin. Silently does
    /// nothing when the workload is not running.
    pub async fn send_input(&self, workload_id: &str, line: &str) {
        if let Some(process) = self.inner.registry.get(workload_id) {
            process.write_line(line).await;
        }
    }

    /// Pure liveness check against the registry and the OS handle.
    pub async fn is_running(&self, workload_id: &str) -> bool {
        self.inner.registry.is_live(workload_id).await
    }

    // ─── Observation ────────────────────────────────────────────────

    /// The workload's log stream: buffered recent lines plus a live
    /// receiver. Created lazily on first access.
    pub async fn log_stream(
        &self,
        workload_id: &str,
    ) -> (Vec<String>, broadcast::Receiver<String>) {
        self.inner.logs.subscribe(workload_id).await
    }

    /// The workload's usage stream — most recent sample wins.
    pub fn usage_stream(&self, workload_id: &str) -> watch::Receiver<UsageSample> {
        self.inner.usage.subscribe(workload_id)
    }

    /// Currently connected participants, derived from parsed log events.
    pub fn participants(&self, workload_id: &str) -> Vec<String> {
        self.inner.roster.snapshot(workload_id)
    }

    /// Supervisor-wide channel of permission-change notifications.
    pub fn notifications(&self) -> broadcast::Receiver<WorkloadNotification> {
        self.inner.notifications.subscribe()
    }

    // ─── Background loops ───────────────────────────────────────────

    /// One loop per output stream. The stdout loop is the primary one:
    /// its end-of-stream means the process exited and triggers cleanup.
    fn spawn_output_loop(
        &self,
        workload_id: String,
        stream: impl AsyncRead + Unpin + Send + 'static,
        primary: bool,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => sup.handle_line(&workload_id, &line).await,
                    Ok(None) => break,
                    Err(e) => {
                        // Mid-run read failures are a normal exit path,
                        // not a supervisor error.
                        debug!("output stream of {} failed: {}", workload_id, e);
                        break;
                    }
                }
            }
            if primary {
                sup.on_process_exit(&workload_id).await;
            }
        });
    }

    async fn handle_line(&self, workload_id: &str, raw: &str) {
        self.inner.logs.publish(workload_id, raw).await;
        let Some(event) = events::parse_line(raw) else {
            return;
        };
        match &event {
            LogEvent::Joined(name) => self.inner.roster.add(workload_id, name),
            LogEvent::Left(name) => self.inner.roster.remove(workload_id, name),
            LogEvent::PermissionGranted(_) | LogEvent::PermissionRevoked(_) => {
                let _ = self.inner.notifications.send(WorkloadNotification {
                    workload_id: workload_id.to_string(),
                    event,
                });
            }
        }
    }

    async fn on_process_exit(&self, workload_id: &str) {
        info!("workload {} process ended", workload_id);
        self.inner.roster.clear(workload_id);
        self.inner.registry.remove(workload_id);
        self.inner.logs.publish(workload_id, "Process ended").await;
    }

    fn spawn_usage_loop(
        &self,
        workload_id: String,
        managed: Arc<ManagedProcess>,
        pid: Option<u32>,
    ) {
        let sup = self.clone();
        tokio::spawn(async move {
            let Some(pid) = pid else {
                warn!("no pid for {} — usage sampling disabled", workload_id);
                return;
            };
            let baseline = read_proc_usage(pid).map(|u| u.cpu_seconds).unwrap_or(0.0);
            let mut tracker = CpuTracker::new(baseline);
            let mut interval = tokio::time::interval(sup.inner.config.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // immediate first tick
            loop {
                interval.tick().await;
                if sup.inner.registry.get(&workload_id).is_none() || !managed.is_alive().await {
                    break;
                }
                // Accounting files vanish mid-teardown — skip the sample.
                let Some(usage) = read_proc_usage(pid) else {
                    continue;
                };
                let sample = UsageSample {
                    cpu_percent: tracker.update(usage.cpu_seconds),
                    memory_bytes: usage.rss_bytes,
                };
                sup.inner.usage.publish(&workload_id, sample);
            }
            debug!("usage sampling for {} ended", workload_id);
        });
    }
}

/// Compose the library search path for a workload launch: the runtime's
/// own `lib/` first, then host native-library directories, then standard
/// system directories, preserving any inherited value by appending.
pub fn build_library_path(
    runtime_root: &Path,
    host_lib_dirs: &[PathBuf],
    inherited: Option<&str>,
) -> String {
    let mut parts: Vec<String> = vec![runtime_root.join("lib").display().to_string()];
    parts.extend(host_lib_dirs.iter().map(|d| d.display().to_string()));
    parts.extend(
        pkg_constants::paths::SYSTEM_LIB_DIRS
            .iter()
            .map(|d| d.to_string()),
    );
    if let Some(existing) = inherited
        && !existing.is_empty()
    {
        parts.push(existing.to_string());
    }
    parts.join(":")
}
