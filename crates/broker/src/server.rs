use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tokenbroker_engine::{Job, JobMonitor, WorkerPool, WorkerStats};

use crate::auth::AuthGuard;
use crate::middleware::{
    CounterStats, RequestCounter, cors, count_requests, log_http_err, log_requests, protect,
    request_id,
};
use crate::once::{OnceGuard, OnceLease};

/// Request body cap; prompts beyond this are a client error.
const BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Buffer between the relay task and the response body.
const RELAY_BUFFER: usize = 16;

/// Shared state behind the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    /// Dispatch core.
    pub pool: Arc<WorkerPool>,
    /// Global request/finish counters.
    pub counter: Arc<RequestCounter>,
    /// Bearer-token verifier, when configured.
    pub auth: Option<Arc<AuthGuard>>,
    /// Idempotency guard, when configured.
    pub once: Option<Arc<OnceGuard>>,
}

/// Assemble the broker's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/generate",
            post(handle_generate)
                .layer(from_fn_with_state(state.clone(), count_requests))
                .layer(from_fn_with_state(state.clone(), protect)),
        )
        .route("/dashboard", get(handle_dashboard))
        .route("/dashboard-stats", get(handle_dashboard_stats))
        .route("/dashboard-request-counter", get(handle_request_counter))
        .route("/dashboard-revive/{index}", get(handle_revive))
        .layer(from_fn(log_requests))
        .layer(from_fn(cors))
        .with_state(state)
}

/// `POST /generate`: bind the client connection to a generation job and
/// stream tokens back as they arrive.
async fn handle_generate(State(state): State<AppState>, req: Request) -> Response {
    let (mut parts, body) = req.into_parts();
    let id = request_id(&parts.headers);
    let lease = parts.extensions.remove::<Arc<OnceLease>>();

    let payload = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(payload) => payload,
        Err(err) => {
            return log_http_err(
                &id,
                "Failed to read request body",
                Some(&err),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let request_token = CancellationToken::new();
    let (job, monitor) = Job::new(request_token.clone(), id.clone(), payload);

    info!(request_id = %id, "beginning generation job");
    if let Err(err) = state.pool.enlist(job).await {
        return log_http_err(
            &id,
            "Could not connect to LLM",
            Some(&err),
            StatusCode::SERVICE_UNAVAILABLE,
        );
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(RELAY_BUFFER);
    tokio::spawn(relay(monitor, request_token, tx, id, lease));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Pump tokens from the job to the client until the worker declares the job
/// done, an error arrives, or the client disconnects.
///
/// The worker never closes the job's channels; the job token is the quit
/// signal. Dropping the response body closes `tx`, which cancels the request
/// token and tears the whole job down.
async fn relay(
    mut monitor: JobMonitor,
    request: CancellationToken,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    id: String,
    lease: Option<Arc<OnceLease>>,
) {
    // Held until the relay exits: the request id stays claimed for the whole
    // stream, and abandoning the stream always cancels the request token.
    let _lease = lease;
    let _teardown = request.drop_guard();

    loop {
        tokio::select! {
            biased;

            Some(token) = monitor.output.recv() => {
                if tx.send(Ok(token)).await.is_err() {
                    return;
                }
            }
            Some(err) = monitor.errors.recv() => {
                error!(request_id = %id, error = %err, "generation failed");
                let _ = tx.send(Ok(Bytes::from(err.to_string()))).await;
                return;
            }
            _ = monitor.token.cancelled() => {
                // Worker declared done; flush whatever is already buffered.
                while let Ok(token) = monitor.output.try_recv() {
                    if tx.send(Ok(token)).await.is_err() {
                        return;
                    }
                }
                return;
            }
            _ = tx.closed() => return,
        }
    }
}

async fn handle_dashboard() -> Html<&'static str> {
    Html(include_str!("../www/dashboard.html"))
}

async fn handle_dashboard_stats(State(state): State<AppState>) -> Json<Vec<WorkerStats>> {
    Json(state.pool.stats())
}

async fn handle_request_counter(State(state): State<AppState>) -> Json<CounterStats> {
    Json(state.counter.stats())
}

async fn handle_revive(State(state): State<AppState>, Path(index): Path<usize>) -> StatusCode {
    if state.pool.revive(index) {
        info!(worker = index, "revive requested");
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
