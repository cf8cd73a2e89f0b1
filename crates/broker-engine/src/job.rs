use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::WorkerError;

const OUTPUT_BUFFER: usize = 100;
const ERROR_BUFFER: usize = 10;

/// One in-flight generation request, as handed to the worker pool.
///
/// A job carries two cancellation tokens: the *request* token, cancelled by
/// the handler when the client goes away, and the *job* token derived from
/// it, which the worker additionally cancels via [`Job::finish`] when the
/// generation ends for any reason. The token and error channels are never
/// closed; completion is signalled by the job token alone.
pub struct Job {
    /// Client-supplied request id, used for correlated logging.
    pub id: String,
    /// Raw request payload, forwarded verbatim upstream.
    pub payload: Bytes,
    request: CancellationToken,
    token: CancellationToken,
    output: mpsc::Sender<Bytes>,
    errors: mpsc::Sender<WorkerError>,
}

/// The handler-side view of a [`Job`]: receivers plus the completion signal.
pub struct JobMonitor {
    /// Generated tokens, in upstream order.
    pub output: mpsc::Receiver<Bytes>,
    /// Failures reported by the owning worker.
    pub errors: mpsc::Receiver<WorkerError>,
    /// Completes when the worker declares the job finished (or the client's
    /// request token is cancelled, since the job token is derived from it).
    pub token: CancellationToken,
}

impl Job {
    /// Create a job below `request`, which the caller cancels when the client
    /// disconnects.
    pub fn new(request: CancellationToken, id: impl Into<String>, payload: Bytes) -> (Self, JobMonitor) {
        let token = request.child_token();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(ERROR_BUFFER);

        let job = Self {
            id: id.into(),
            payload,
            request,
            token: token.clone(),
            output: output_tx,
            errors: error_tx,
        };
        let monitor = JobMonitor {
            output: output_rx,
            errors: error_rx,
            token,
        };
        (job, monitor)
    }

    /// Declare the job finished. Idempotent; every generate exit path calls
    /// this, and the handler treats it as its quit signal.
    pub fn finish(&self) {
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn request_token(&self) -> &CancellationToken {
        &self.request
    }

    pub(crate) fn output(&self) -> &mpsc::Sender<Bytes> {
        &self.output
    }

    pub(crate) fn errors(&self) -> &mpsc::Sender<WorkerError> {
        &self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_is_idempotent() {
        let request = CancellationToken::new();
        let (job, monitor) = Job::new(request, "job1", Bytes::from_static(b"payload"));

        job.finish();
        job.finish();
        assert!(monitor.token.is_cancelled());
    }

    #[tokio::test]
    async fn client_disconnect_cancels_job_token() {
        let request = CancellationToken::new();
        let (job, monitor) = Job::new(request.clone(), "job2", Bytes::new());

        assert!(!job.token().is_cancelled());
        request.cancel();
        assert!(monitor.token.is_cancelled());
        assert!(job.token().is_cancelled());
    }

    #[tokio::test]
    async fn finish_does_not_cancel_request_token() {
        let request = CancellationToken::new();
        let (job, _monitor) = Job::new(request.clone(), "job3", Bytes::new());

        job.finish();
        assert!(!request.is_cancelled());
    }
}
