use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::api::QueueStats;

/// Bounded admission slot holder inside a worker.
///
/// `size` counts waiters plus admitted jobs; `released` counts admitted jobs
/// only. A permit is not returned when the admitted caller's future ends but
/// when the job token is cancelled, so a generation that unwinds early still
/// releases its slot.
pub(crate) struct Queue {
    permits: Arc<Semaphore>,
    size: Arc<AtomicI64>,
    released: Arc<AtomicI64>,
}

impl Queue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            size: Arc::new(AtomicI64::new(0)),
            released: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Block until an admission permit is free or `token` is cancelled.
    ///
    /// Returns `false` if cancelled first. On admission a watcher task takes
    /// ownership of the permit and gives it back exactly once, when `token`
    /// is cancelled.
    pub(crate) async fn wait(&self, token: &CancellationToken, id: &str) -> bool {
        self.size.fetch_add(1, Ordering::SeqCst);

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.size.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
            },
            _ = token.cancelled() => {
                self.size.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
        };

        self.released.fetch_add(1, Ordering::SeqCst);
        trace!(request_id = %id, "admitted");

        let token = token.clone();
        let size = self.size.clone();
        let released = self.released.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            released.fetch_sub(1, Ordering::SeqCst);
            size.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
        true
    }

    /// Jobs currently waiting for admission.
    pub(crate) fn waiting(&self) -> i64 {
        let waiting = self.size.load(Ordering::SeqCst) - self.released.load(Ordering::SeqCst);
        waiting.max(0)
    }

    pub(crate) fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.size.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let queue = Queue::new(2);
        let job1 = CancellationToken::new();
        let job2 = CancellationToken::new();

        assert!(queue.wait(&job1, "job1").await);
        assert!(queue.wait(&job2, "job2").await);

        let stats = queue.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.released, 2);
    }

    #[tokio::test]
    async fn third_waiter_blocks_until_a_slot_frees() {
        let queue = Arc::new(Queue::new(2));
        let job1 = CancellationToken::new();
        let job2 = CancellationToken::new();
        let job3 = CancellationToken::new();

        assert!(queue.wait(&job1, "job1").await);
        assert!(queue.wait(&job2, "job2").await);

        let waiter = {
            let queue = queue.clone();
            let job3 = job3.clone();
            tokio::spawn(async move { queue.wait(&job3, "job3").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(queue.waiting(), 1);

        // Finishing job1 hands its permit to the waiter.
        job1.cancel();
        let admitted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(admitted);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_not_admitted() {
        let queue = Arc::new(Queue::new(1));
        let job1 = CancellationToken::new();
        let job2 = CancellationToken::new();

        assert!(queue.wait(&job1, "job1").await);

        let waiter = {
            let queue = queue.clone();
            let job2 = job2.clone();
            tokio::spawn(async move { queue.wait(&job2, "job2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        job2.cancel();
        let admitted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!admitted);

        let stats = queue.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.released, 1);
    }

    #[tokio::test]
    async fn release_is_bound_to_the_token() {
        let queue = Queue::new(1);
        let job = CancellationToken::new();

        assert!(queue.wait(&job, "job").await);
        assert_eq!(queue.stats().released, 1);

        job.cancel();
        // The watcher runs asynchronously; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = queue.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.released, 0);
    }
}
