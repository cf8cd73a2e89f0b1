use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::{RestartStrategy, WorkerConfig, WorkerError, WorkerStats};
use crate::job::Job;
use crate::queue::Queue;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness flags share one lock so quarantine, revival and the heartbeat's
/// self-exit cannot race each other.
#[derive(Debug)]
struct Liveness {
    alive: bool,
    check_alive: bool,
    heartbeat_running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    finished: AtomicU64,
    successes: AtomicU64,
    fails: AtomicU64,
    early: AtomicU64,
    running: AtomicU64,
    fail_count: AtomicU32,
    total_req_ms: AtomicU64,
}

/// How a generate task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Upstream reached end-of-stream.
    Success,
    /// The job token was cancelled before completion (client went away).
    Early,
    /// Transport, read or timeout failure.
    Failed,
}

/// One upstream generation server.
pub(crate) struct Worker {
    host: String,
    capacity: usize,
    headers: Vec<(String, String)>,
    generate_endpoint: String,
    openai: bool,
    probe_configured: bool,
    heartbeat: Duration,
    stall_timeout: Duration,
    max_retries: u32,
    restart: Option<Arc<dyn RestartStrategy>>,
    http: reqwest::Client,
    jobs: mpsc::Sender<Job>,
    inbox: Mutex<Option<mpsc::Receiver<Job>>>,
    queue: Queue,
    state: Mutex<Liveness>,
    counters: Counters,
}

impl Worker {
    pub(crate) fn new(
        config: WorkerConfig,
        http: reqwest::Client,
        restart: &Arc<dyn RestartStrategy>,
    ) -> Arc<Self> {
        let capacity = config.capacity.max(1);
        let heartbeat = match config.heartbeat {
            0 => WorkerConfig::DEFAULT_HEARTBEAT,
            secs => Duration::from_secs(secs),
        };
        let stall_timeout = match config.timeout {
            0 => WorkerConfig::DEFAULT_STALL_TIMEOUT,
            secs => Duration::from_secs(secs),
        };

        // The inbound buffer absorbs bursts between the pool and this
        // worker's serialiser.
        let (jobs, inbox) = mpsc::channel(capacity * 2);

        Arc::new(Self {
            host: config.host.trim_end_matches('/').to_string(),
            capacity,
            headers: config.headers.into_iter().collect(),
            generate_endpoint: config.generate_endpoint,
            openai: config.openai,
            probe_configured: config.check_alive,
            heartbeat,
            stall_timeout,
            max_retries: config.max_retries,
            restart: config.restart.then(|| restart.clone()),
            http,
            jobs,
            inbox: Mutex::new(Some(inbox)),
            queue: Queue::new(capacity),
            state: Mutex::new(Liveness {
                alive: true,
                check_alive: config.check_alive,
                heartbeat_running: false,
            }),
            counters: Counters::default(),
        })
    }

    /// Start the serialiser (and the heartbeat, where configured).
    pub(crate) fn start(self: &Arc<Self>) {
        if let Some(inbox) = self.take_inbox() {
            let worker = self.clone();
            tokio::spawn(worker.run(inbox));
        }
        if self.probe_configured {
            self.spawn_heartbeat();
        }
    }

    fn take_inbox(&self) -> Option<mpsc::Receiver<Job>> {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.take()
    }

    fn state(&self) -> MutexGuard<'_, Liveness> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialiser loop: receive one job per iteration and launch exactly one
    /// generate task for it. Never blocks on generation itself.
    async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Job>) {
        while let Some(job) = inbox.recv().await {
            if !self.alive() {
                let _ = job.errors().try_send(WorkerError::Unresponsive);
                job.finish();
                continue;
            }
            let worker = self.clone();
            tokio::spawn(worker.generate(job));
        }
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Job> {
        &self.jobs
    }

    pub(crate) fn alive(&self) -> bool {
        self.state().alive
    }

    /// Force the worker back to life and restart its heartbeat if probing is
    /// configured and none is running.
    pub(crate) fn revive(self: &Arc<Self>) {
        {
            let mut state = self.state();
            state.alive = true;
            if self.probe_configured {
                state.check_alive = true;
            }
        }
        info!(host = %self.host, "worker revived");
        if self.probe_configured {
            self.spawn_heartbeat();
        }
    }

    /// Current load: jobs handed over but not yet picked up, plus jobs in
    /// admission wait, plus jobs streaming, over capacity.
    pub(crate) fn load(&self) -> f64 {
        let inbound = (self.jobs.max_capacity() - self.jobs.capacity()) as f64;
        let queued = self.queue.waiting() as f64;
        let running = self.counters.running.load(Ordering::SeqCst) as f64;
        (inbound + queued + running) / self.capacity as f64
    }

    pub(crate) fn stats(&self, index: usize) -> WorkerStats {
        let finished = self.counters.finished.load(Ordering::SeqCst);
        let total_ms = self.counters.total_req_ms.load(Ordering::SeqCst);
        WorkerStats {
            worker: index,
            alive: self.alive(),
            requests: self.counters.requests.load(Ordering::SeqCst),
            finished,
            successes: self.counters.successes.load(Ordering::SeqCst),
            fails: self.counters.fails.load(Ordering::SeqCst),
            early: self.counters.early.load(Ordering::SeqCst),
            running: self.counters.running.load(Ordering::SeqCst),
            queue: self.queue.stats(),
            avg_req_time: if finished > 0 { total_ms / finished } else { 0 },
            load: self.load(),
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.heartbeat_running {
                return;
            }
            state.heartbeat_running = true;
        }
        let worker = self.clone();
        tokio::spawn(worker.heartbeat());
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.heartbeat);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            {
                let mut state = self.state();
                if !state.check_alive {
                    state.heartbeat_running = false;
                    return;
                }
            }

            let alive = self.probe().await;

            let mut state = self.state();
            if !state.check_alive {
                // Quarantined while the probe was in flight.
                state.heartbeat_running = false;
                return;
            }
            if state.alive != alive {
                if alive {
                    info!(host = %self.host, "worker is responding again");
                } else {
                    warn!(host = %self.host, "worker stopped responding");
                }
                state.alive = alive;
            }
        }
    }

    async fn probe(&self) -> bool {
        match self
            .http
            .get(&self.host)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(res) => res.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    async fn generate(self: Arc<Self>, job: Job) {
        self.counters.requests.fetch_add(1, Ordering::SeqCst);

        if !self.queue.wait(job.token(), &job.id).await {
            self.finalize(&job, None, Exit::Early);
            return;
        }

        self.counters.running.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let exit = self.stream_tokens(&job).await;
        self.finalize(&job, Some(started), exit);
    }

    /// Single bookkeeping exit point for every generate outcome.
    fn finalize(&self, job: &Job, started: Option<Instant>, exit: Exit) {
        debug!(request_id = %job.id, host = %self.host, outcome = ?exit, "generation finished");
        job.finish();

        if let Some(started) = started {
            self.counters.running.fetch_sub(1, Ordering::SeqCst);
            self.counters
                .total_req_ms
                .fetch_add(started.elapsed().as_millis() as u64, Ordering::SeqCst);
        }
        self.counters.finished.fetch_add(1, Ordering::SeqCst);

        match exit {
            Exit::Success => {
                self.counters.successes.fetch_add(1, Ordering::SeqCst);
                self.counters.fail_count.store(0, Ordering::SeqCst);
            }
            Exit::Early => {
                self.counters.early.fetch_add(1, Ordering::SeqCst);
            }
            Exit::Failed => {
                self.counters.fails.fetch_add(1, Ordering::SeqCst);
                let consecutive = self.counters.fail_count.fetch_add(1, Ordering::SeqCst) + 1;
                if self.max_retries > 0 && consecutive >= self.max_retries {
                    self.quarantine();
                }
                // A dead worker starts its streak fresh if it comes back.
                if !self.alive() {
                    self.counters.fail_count.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    fn quarantine(&self) {
        {
            let mut state = self.state();
            if !state.alive && !state.check_alive {
                return;
            }
            state.alive = false;
            state.check_alive = false;
        }
        warn!(
            host = %self.host,
            max_retries = self.max_retries,
            "worker quarantined after consecutive failures"
        );
        if let Some(restart) = &self.restart {
            restart.restart(&self.host);
        }
    }

    async fn stream_tokens(&self, job: &Job) -> Exit {
        if job.token().is_cancelled() {
            return Exit::Early;
        }

        let url = format!("{}{}", self.host, self.generate_endpoint);
        let mut request = self
            .http
            .post(url)
            .header("Cache-Control", "no-cache")
            .header("Accept", "text/event-stream")
            .header("Connection", "keep-alive")
            .body(job.payload.clone());
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let mut response = tokio::select! {
            sent = request.send() => match sent {
                Ok(response) => response,
                Err(err) => {
                    error!(request_id = %job.id, host = %self.host, error = %err, "upstream request failed");
                    let _ = job.errors().try_send(WorkerError::Prompt(err));
                    return Exit::Failed;
                }
            },
            _ = job.token().cancelled() => return Exit::Early,
        };

        loop {
            let chunk = tokio::select! {
                read = tokio::time::timeout(self.stall_timeout, response.chunk()) => match read {
                    Ok(Ok(Some(chunk))) => chunk,
                    Ok(Ok(None)) => return Exit::Success,
                    Ok(Err(err)) => {
                        error!(request_id = %job.id, host = %self.host, error = %err, "upstream stream broke");
                        let _ = job.errors().try_send(WorkerError::Read(err.into()));
                        return Exit::Failed;
                    }
                    Err(_) => {
                        let _ = job.errors().try_send(WorkerError::Timeout(self.stall_timeout));
                        return Exit::Failed;
                    }
                },
                _ = job.token().cancelled() => return Exit::Early,
            };

            let token = if self.openai {
                match extract_delta(&chunk) {
                    Ok(Some(text)) => text,
                    Ok(None) => return Exit::Success,
                    Err(err) => {
                        error!(request_id = %job.id, host = %self.host, error = %err, "undecodable upstream chunk");
                        let _ = job.errors().try_send(WorkerError::Read(err.into()));
                        return Exit::Failed;
                    }
                }
            } else {
                chunk
            };

            if token.is_empty() {
                continue;
            }

            tokio::select! {
                sent = job.output().send(token) => {
                    if sent.is_err() {
                        // Receiver side dropped: the client abandoned the job.
                        return Exit::Early;
                    }
                }
                _ = job.token().cancelled() => return Exit::Early,
                _ = tokio::time::sleep(self.stall_timeout) => {
                    let _ = job.errors().try_send(WorkerError::Timeout(self.stall_timeout));
                    return Exit::Failed;
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaChunk {
    choices: Vec<DeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct DeltaChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: String,
}

/// Extract the delta text from an OpenAI-style streaming chunk.
///
/// Returns `Ok(None)` on the `[DONE]` sentinel. An optional `data:` prefix is
/// stripped before decoding.
fn extract_delta(chunk: &[u8]) -> Result<Option<Bytes>, serde_json::Error> {
    let text = String::from_utf8_lossy(chunk);
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("data:")
        .map(str::trim)
        .unwrap_or(trimmed);
    if trimmed == "[DONE]" {
        return Ok(None);
    }

    let parsed: DeltaChunk = serde_json::from_str(trimmed)?;
    let content: String = parsed
        .choices
        .into_iter()
        .map(|choice| choice.delta.content)
        .collect();
    Ok(Some(Bytes::from(content)))
}
