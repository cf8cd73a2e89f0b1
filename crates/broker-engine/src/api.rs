//! Public API types for the dispatch engine.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a single upstream generation server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Base URL of the upstream server (e.g. `http://127.0.0.1:5000`).
    pub host: String,

    /// Maximum number of concurrent generations on this worker.
    pub capacity: usize,

    /// Heartbeat period in seconds. `0` selects the default (1 s).
    #[serde(default)]
    pub heartbeat: u64,

    /// Per-token stall timeout in seconds. `0` selects the default (10 s).
    ///
    /// The timer is armed per token, not per request, so arbitrarily long
    /// generations are fine as long as the upstream keeps producing.
    #[serde(default)]
    pub timeout: u64,

    /// Whether to probe the upstream with periodic liveness checks.
    #[serde(default = "default_check_alive")]
    pub check_alive: bool,

    /// Consecutive failures before the worker is quarantined. `0` disables
    /// quarantine.
    #[serde(default)]
    pub max_retries: u32,

    /// Ask the restart strategy to restart the upstream on quarantine.
    #[serde(default)]
    pub restart: bool,

    /// Additional headers attached to every upstream generate request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Path of the upstream streaming completion endpoint.
    #[serde(default = "default_generate_endpoint")]
    pub generate_endpoint: String,

    /// Treat upstream chunks as OpenAI-style delta JSON and forward only the
    /// extracted text; `[DONE]` terminates the stream.
    #[serde(default)]
    pub openai: bool,
}

impl WorkerConfig {
    /// Default heartbeat period.
    pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(1);

    /// Default per-token stall timeout.
    pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            capacity: 1,
            heartbeat: 0,
            timeout: 0,
            check_alive: default_check_alive(),
            max_retries: 0,
            restart: false,
            headers: HashMap::new(),
            generate_endpoint: default_generate_endpoint(),
            openai: false,
        }
    }
}

fn default_check_alive() -> bool {
    true
}

fn default_generate_endpoint() -> String {
    "/generate".to_string()
}

/// Failures a worker reports on a job's error channel.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker was marked dead before the job could start.
    #[error("LLM became unresponsive")]
    Unresponsive,

    /// The upstream generate request could not be built or sent.
    #[error("Error prompting LLM")]
    Prompt(#[source] reqwest::Error),

    /// The upstream stream broke or produced an undecodable chunk.
    #[error("Error reading tokens from LLM")]
    Read(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// No token arrived within the stall timeout.
    #[error("LLM timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure to hand a job to the pool.
#[derive(Debug, thiserror::Error)]
pub enum EnlistError {
    /// Every worker is dead or quarantined.
    #[error("could not connect to live LLM server")]
    NoLiveWorker,
}

/// Hook invoked when a worker flagged `restart` trips quarantine.
///
/// The engine only decides *that* a restart is wanted; how the upstream is
/// actually restarted (container orchestrator, process supervisor, nothing)
/// belongs to the embedding application.
pub trait RestartStrategy: Send + Sync + 'static {
    /// Request a restart of the upstream behind `host`.
    fn restart(&self, host: &str);
}

/// Restart strategy that does nothing.
#[derive(Debug, Default)]
pub struct NoopRestart;

impl RestartStrategy for NoopRestart {
    fn restart(&self, _host: &str) {}
}

/// Admission-queue counters for one worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    /// Jobs waiting for admission plus jobs admitted and not yet finished.
    pub size: i64,
    /// Jobs currently holding an admission permit.
    pub released: i64,
}

/// Snapshot of a single worker's counters.
///
/// The host is replaced by the worker's pool index so snapshots can be
/// exposed without leaking upstream addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Worker index in the pool (0-based).
    pub worker: usize,
    /// Whether the worker is currently considered alive.
    pub alive: bool,
    /// Generate tasks started.
    pub requests: u64,
    /// Generate tasks finished (successes + fails + early exits).
    pub finished: u64,
    /// Generations that ran to end-of-stream.
    pub successes: u64,
    /// Generations that failed (transport, read, timeout).
    pub fails: u64,
    /// Generations abandoned by the client before completion.
    pub early: u64,
    /// Generations currently streaming.
    pub running: u64,
    /// Admission-queue counters.
    pub queue: QueueStats,
    /// Mean request time in milliseconds (0 until something finished).
    pub avg_req_time: u64,
    /// Current load: (pending + queued + running) / capacity.
    pub load: f64,
}
