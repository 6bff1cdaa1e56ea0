//! Workload supervision constants.

/// Console command sent to a workload's stdin to request an orderly shutdown.
pub const GRACEFUL_STOP_COMMAND: &str = "stop";

/// How long `stop` waits for a graceful exit before force-killing, in seconds.
pub const STOP_TIMEOUT_SECS: u64 = 30;

/// Liveness poll interval while waiting for a graceful exit, in milliseconds.
pub const STOP_POLL_INTERVAL_MS: u64 = 500;

/// Number of recent log lines replayed to a newly attached consumer.
pub const LOG_REPLAY_CAPACITY: usize = 50;

/// Broadcast channel capacity for live log lines.
pub const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Interval between resource usage samples, in seconds.
pub const USAGE_SAMPLE_INTERVAL_SECS: u64 = 5;

/// How many times to retry reading the OS process identifier after spawn.
/// The identifier is not always available synchronously.
pub const PID_RETRY_ATTEMPTS: u32 = 10;

/// Delay between process identifier retries, in milliseconds.
pub const PID_RETRY_DELAY_MS: u64 = 100;
