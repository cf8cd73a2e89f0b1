use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::debug;

use crate::api::{EnlistError, RestartStrategy, WorkerConfig, WorkerStats};
use crate::job::Job;
use crate::worker::Worker;

/// The fixed set of workers the broker dispatches across.
///
/// Indexing is stable for the lifetime of the pool; the revive and stats
/// surfaces address workers by index.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
}

impl WorkerPool {
    /// Build a pool over `configs`. `restart` is invoked for workers flagged
    /// `restart` when they trip quarantine.
    pub fn new(configs: Vec<WorkerConfig>, restart: Arc<dyn RestartStrategy>) -> Self {
        let http = reqwest::Client::new();
        let workers = configs
            .into_iter()
            .map(|config| Worker::new(config, http.clone(), &restart))
            .collect();
        Self { workers }
    }

    /// Start every worker's serialiser (and heartbeat, where configured).
    pub fn run(&self) {
        for worker in &self.workers {
            worker.start();
        }
    }

    /// Hand `job` to the least-loaded live worker.
    ///
    /// The hand-off races the job's request token: a client that disconnects
    /// before the worker picks the job up turns the enlist into a no-op. No
    /// second worker is tried after the pick; the inbound buffer absorbs
    /// pressure and retrying would re-skew the load comparison.
    pub async fn enlist(&self, job: Job) -> Result<(), EnlistError> {
        let Some(worker) = self.pick() else {
            return Err(EnlistError::NoLiveWorker);
        };

        let id = job.id.clone();
        let request_gone = job.request_token().clone();
        tokio::select! {
            _ = request_gone.cancelled() => Ok(()),
            sent = worker.sender().send(job) => match sent {
                Ok(()) => {
                    debug!(request_id = %id, "job enlisted");
                    Ok(())
                }
                // A worker whose serialiser is gone looks dead to callers.
                Err(_) => Err(EnlistError::NoLiveWorker),
            }
        }
    }

    /// Pick the minimum-load live worker, scanning in a uniformly random
    /// order so concurrent callers seeing identical loads do not all pile
    /// onto the same worker.
    fn pick(&self) -> Option<Arc<Worker>> {
        let mut order: Vec<usize> = (0..self.workers.len()).collect();
        order.shuffle(&mut rand::rng());

        let mut best: Option<(f64, &Arc<Worker>)> = None;
        for index in order {
            let worker = &self.workers[index];
            if !worker.alive() {
                continue;
            }
            let load = worker.load();
            match best {
                Some((min, _)) if min <= load => {}
                _ => best = Some((load, worker)),
            }
        }
        best.map(|(_, worker)| worker.clone())
    }

    /// Force worker `index` alive again. Returns `false` when out of range.
    pub fn revive(&self, index: usize) -> bool {
        match self.workers.get(index) {
            Some(worker) => {
                worker.revive();
                true
            }
            None => false,
        }
    }

    /// Per-worker counter snapshots, hosts replaced by index.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .enumerate()
            .map(|(index, worker)| worker.stats(index))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::api::NoopRestart;

    fn pool(configs: Vec<WorkerConfig>) -> WorkerPool {
        WorkerPool::new(configs, Arc::new(NoopRestart))
    }

    fn config(capacity: usize) -> WorkerConfig {
        WorkerConfig {
            host: "http://127.0.0.1:1".to_string(),
            capacity,
            check_alive: false,
            ..WorkerConfig::default()
        }
    }

    fn job(id: &str) -> Job {
        let (job, _monitor) = Job::new(CancellationToken::new(), id, Bytes::new());
        job
    }

    #[tokio::test]
    async fn enlist_fails_with_no_workers() {
        let pool = pool(Vec::new());
        assert!(matches!(
            pool.enlist(job("a")).await,
            Err(EnlistError::NoLiveWorker)
        ));
    }

    #[tokio::test]
    async fn pick_prefers_the_less_loaded_worker() {
        let pool = pool(vec![config(1), config(1)]);

        // Stuff a job into worker 0's inbound channel; its load becomes 1.0.
        pool.workers[0].sender().send(job("a")).await.unwrap();

        for _ in 0..10 {
            let picked = pool.pick().unwrap();
            assert!(Arc::ptr_eq(&picked, &pool.workers[1]));
        }
    }

    #[tokio::test]
    async fn enlist_with_cancelled_request_is_a_noop() {
        let pool = pool(vec![config(1)]);

        let request = CancellationToken::new();
        let (job, _monitor) = Job::new(request.clone(), "gone", Bytes::new());
        request.cancel();

        // Fill the inbound channel so the send arm cannot win the race.
        for id in ["a", "b"] {
            let (filler, _monitor) = Job::new(CancellationToken::new(), id, Bytes::new());
            pool.workers[0].sender().send(filler).await.unwrap();
        }

        assert!(pool.enlist(job).await.is_ok());
    }

    #[tokio::test]
    async fn stats_replace_hosts_with_indices() {
        let pool = pool(vec![config(1), config(2)]);
        let stats = pool.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].worker, 0);
        assert_eq!(stats[1].worker, 1);
    }

    #[tokio::test]
    async fn revive_rejects_out_of_range_indices() {
        let pool = pool(vec![config(1)]);
        assert!(pool.revive(0));
        assert!(!pool.revive(1));
    }
}
