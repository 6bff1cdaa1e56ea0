//! Structured event extraction from workload log output.
//!
//! The upstream log format is not a stable contract — extraction is an
//! ordered list of (pattern, event) matchers so new kinds can be added
//! without touching the consumption loop. Event kinds are mutually
//! exclusive per line: the first relevant match wins.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// A lifecycle event extracted from a single log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A participant connected to the workload.
    Joined(String),
    /// A participant disconnected.
    Left(String),
    /// A participant was granted operator permissions.
    PermissionGranted(String),
    /// A participant's operator permissions were revoked.
    PermissionRevoked(String),
}

type Matcher = (Lazy<Regex>, fn(String) -> LogEvent);

// Revocation is listed before the grant: the grant pattern is a strict
// substring shape of the revocation line's tail. The static owns the
// array — a borrowed slice of `Lazy` values is interior-mutable and
// cannot live behind a `'static` reference.
static MATCHERS: [Matcher; 4] = [
    (
        Lazy::new(|| Regex::new(r"(\w+) joined the game").expect("join pattern")),
        LogEvent::Joined,
    ),
    (
        Lazy::new(|| Regex::new(r"(\w+) left the game").expect("leave pattern")),
        LogEvent::Left,
    ),
    (
        Lazy::new(|| {
            Regex::new(r"Made (\w+) no longer a server operator").expect("revoke pattern")
        }),
        LogEvent::PermissionRevoked,
    ),
    (
        Lazy::new(|| Regex::new(r"Made (\w+) a server operator").expect("grant pattern")),
        LogEvent::PermissionGranted,
    ),
];

/// Run the matchers over a raw log line. Returns the first relevant event
/// or `None` for ordinary output.
pub fn parse_line(line: &str) -> Option<LogEvent> {
    for (pattern, build) in &MATCHERS {
        if let Some(caps) = pattern.captures(line) {
            return Some(build(caps[1].to_string()));
        }
    }
    None
}

/// Per-workload set of currently connected participants, derived entirely
/// from parsed log events and cleared when the workload's process exits.
#[derive(Default)]
pub struct ParticipantRoster {
    inner: DashMap<String, BTreeSet<String>>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, workload_id: &str, name: &str) {
        self.inner
            .entry(workload_id.to_string())
            .or_default()
            .insert(name.to_string());
    }

    pub fn remove(&self, workload_id: &str, name: &str) {
        if let Some(mut set) = self.inner.get_mut(workload_id) {
            set.remove(name);
        }
    }

    /// Sorted snapshot of the currently connected participants.
    pub fn snapshot(&self, workload_id: &str) -> Vec<String> {
        self.inner
            .get(workload_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every participant of a workload (process exit).
    pub fn clear(&self, workload_id: &str) {
        self.inner.remove(workload_id);
    }
}
