//! Per-workload log streams with bounded replay.
//!
//! Each workload gets an append-only broadcast channel of framed text
//! lines plus a ring buffer of the most recent lines. A late-attaching
//! consumer receives the buffered lines first, then live ones. Consumers
//! never affect the producer or each other.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

/// Leading `[HH:MM:SS]` marker — lines that already carry one are passed
/// through unmodified.
static TIMESTAMP_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[\d{2}:\d{2}:\d{2}\]").expect("invalid timestamp pattern"));

/// Terminal color escapes, stripped before the timestamp check (some
/// workloads colorize their already-timestamped output).
static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("invalid ansi pattern"));

/// Frame a raw process output line into the `[HH:MM:SS] <message>` wire
/// format. Already-timestamped lines pass through unchanged.
pub fn frame_line(raw: &str) -> String {
    let stripped = ANSI_ESCAPE.replace_all(raw, "");
    if TIMESTAMP_PREFIX.is_match(&stripped) {
        raw.to_string()
    } else {
        format!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), raw)
    }
}

struct LogChannel {
    sender: broadcast::Sender<String>,
    recent: Arc<RwLock<VecDeque<String>>>,
}

/// Registry of per-workload log channels, created lazily on first access.
pub struct LogHub {
    channels: DashMap<String, Arc<LogChannel>>,
    replay_capacity: usize,
}

impl LogHub {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            replay_capacity,
        }
    }

    fn channel(&self, workload_id: &str) -> Arc<LogChannel> {
        self.channels
            .entry(workload_id.to_string())
            .or_insert_with(|| {
                let (sender, _) =
                    broadcast::channel(pkg_constants::workload::LOG_CHANNEL_CAPACITY);
                Arc::new(LogChannel {
                    sender,
                    recent: Arc::new(RwLock::new(VecDeque::with_capacity(
                        self.replay_capacity,
                    ))),
                })
            })
            .clone()
    }

    /// Frame and publish one line for a workload. Oldest buffered lines
    /// are evicted once the replay capacity is exceeded.
    pub async fn publish(&self, workload_id: &str, raw_line: &str) {
        let framed = frame_line(raw_line);
        let channel = self.channel(workload_id);
        {
            let mut recent = channel.recent.write().await;
            if recent.len() >= self.replay_capacity {
                recent.pop_front();
            }
            recent.push_back(framed.clone());
        }
        // No receivers is fine — the buffer still records the line.
        let _ = channel.sender.send(framed);
    }

    /// Attach a consumer: returns the buffered recent lines and a live
    /// receiver for everything published afterwards.
    pub async fn subscribe(
        &self,
        workload_id: &str,
    ) -> (Vec<String>, broadcast::Receiver<String>) {
        let channel = self.channel(workload_id);
        let receiver = channel.sender.subscribe();
        let recent = channel.recent.read().await.iter().cloned().collect();
        (recent, receiver)
    }
}
