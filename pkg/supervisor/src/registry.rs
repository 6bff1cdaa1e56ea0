//! In-process workload registry.
//!
//! Tracks the live process of every workload managed by this supervisor
//! instance. Every entry wraps a real OS child process — no two entries
//! ever reference the same handle.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::Mutex;
use tracing::debug;

/// One running workload process, exclusively owned by its registry entry.
pub struct ManagedProcess {
    /// Workload identity this process belongs to.
    pub workload_id: String,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
    /// OS process identifier, cached once retrieval succeeds.
    pid: OnceLock<u32>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
}

impl ManagedProcess {
    /// Wrap a freshly spawned child. Takes ownership of its stdin pipe.
    pub fn new(workload_id: &str, mut child: Child) -> Self {
        let stdin = child.stdin.take();
        Self {
            workload_id: workload_id.to_string(),
            started_at: Utc::now(),
            pid: OnceLock::new(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
        }
    }

    /// OS process identifier, if known yet. Retrieval is fallible right
    /// after spawn — callers retry briefly instead of assuming it.
    pub async fn os_pid(&self) -> Option<u32> {
        if let Some(pid) = self.pid.get() {
            return Some(*pid);
        }
        let pid = self.child.lock().await.id()?;
        let _ = self.pid.set(pid);
        Some(pid)
    }

    /// Liveness is derived from the OS handle, never cached.
    pub async fn is_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    /// Write `line` plus a newline to the process's stdin. Silently does
    /// nothing if the pipe is gone — callers check liveness if they care.
    pub async fn write_line(&self, line: &str) {
        let mut stdin = self.stdin.lock().await;
        if let Some(pipe) = stdin.as_mut() {
            let framed = format!("{line}\n");
            if let Err(e) = pipe.write_all(framed.as_bytes()).await {
                debug!("stdin write to {} failed: {}", self.workload_id, e);
                return;
            }
            let _ = pipe.flush().await;
        }
    }

    /// Immediate force-terminate. Errors are ignored — the process is
    /// either dead already or about to be reaped.
    pub async fn force_kill(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

/// Concurrent workload-id → process map.
///
/// Thread-safe via `DashMap` — liveness checks read concurrently while
/// start/stop/kill are the only mutating operations. At most one entry
/// per workload id exists at a time.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<DashMap<String, Arc<ManagedProcess>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process under a workload id. The previous entry, if any,
    /// is replaced and returned.
    pub fn insert(
        &self,
        workload_id: &str,
        process: Arc<ManagedProcess>,
    ) -> Option<Arc<ManagedProcess>> {
        self.inner.insert(workload_id.to_string(), process)
    }

    pub fn get(&self, workload_id: &str) -> Option<Arc<ManagedProcess>> {
        self.inner.get(workload_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, workload_id: &str) -> Option<Arc<ManagedProcess>> {
        self.inner.remove(workload_id).map(|(_, p)| p)
    }

    /// Liveness check against the registry and the OS handle.
    pub async fn is_live(&self, workload_id: &str) -> bool {
        match self.get(workload_id) {
            Some(p) => p.is_alive().await,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
