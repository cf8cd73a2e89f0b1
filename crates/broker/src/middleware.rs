use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::server::AppState;

/// Global request/finish counters for the generate endpoint.
#[derive(Debug, Default)]
pub struct RequestCounter {
    requests: AtomicI64,
    finished: AtomicI64,
}

/// Snapshot of the global counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterStats {
    /// Generate requests accepted.
    pub requests: i64,
    /// Generate requests answered (in any way).
    pub finished: i64,
}

impl RequestCounter {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read both counters.
    pub fn stats(&self) -> CounterStats {
        CounterStats {
            requests: self.requests.load(Ordering::SeqCst),
            finished: self.finished.load(Ordering::SeqCst),
        }
    }
}

/// The client-supplied correlation id, or empty.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Log and answer an HTTP-level failure, always carrying the request id.
pub fn log_http_err(
    id: &str,
    msg: &str,
    err: Option<&dyn std::fmt::Display>,
    status: StatusCode,
) -> Response {
    match err {
        Some(err) => error!(request_id = %id, error = %err, "{msg}"),
        None => error!(request_id = %id, "{msg}"),
    }
    (status, msg.to_string()).into_response()
}

/// CORS allow-all plus the OPTIONS preflight short-circuit.
pub async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut res = StatusCode::OK.into_response();
        apply_cors(res.headers_mut());
        return res;
    }
    let mut res = next.run(req).await;
    apply_cors(res.headers_mut());
    res
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS, PUT, DELETE"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Accept, Content-Type, Content-Length, Accept-Encoding, X-CSRF-Token, Authorization, X-Request-ID",
        ),
    );
}

/// Request logging with elapsed time, correlated by request id.
pub async fn log_requests(req: Request, next: Next) -> Response {
    let id = request_id(req.headers());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(request_id = %id, method = %method, path = %path, "receiving request");

    let started = Instant::now();
    let res = next.run(req).await;
    info!(
        request_id = %id,
        method = %method,
        path = %path,
        status = %res.status(),
        elapsed = ?started.elapsed(),
        "finished request"
    );
    res
}

/// Auth and idempotency checks in front of the generate handler.
///
/// An acquired idempotency lease travels to the handler through the request
/// extensions so its release can be tied to the end of the token stream
/// rather than to the (much earlier) return of this middleware.
pub async fn protect(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let id = request_id(req.headers());

    if let Some(auth) = &state.auth {
        let token = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !auth.check(token) {
            return log_http_err(&id, "Unauthorized", None, StatusCode::UNAUTHORIZED);
        }
    }

    if let Some(once) = &state.once {
        match once.acquire(&id).await {
            Ok(Some(lease)) => {
                req.extensions_mut().insert(Arc::new(lease));
            }
            Ok(None) => {
                return log_http_err(
                    &id,
                    "Can only access LLM once at a time",
                    None,
                    StatusCode::SERVICE_UNAVAILABLE,
                );
            }
            Err(err) => {
                return log_http_err(
                    &id,
                    "Failed to access cache",
                    Some(&err),
                    StatusCode::INTERNAL_SERVER_ERROR,
                );
            }
        }
    }

    next.run(req).await
}

/// Count requests entering and leaving the generate endpoint.
pub async fn count_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state.counter.requests.fetch_add(1, Ordering::SeqCst);
    let res = next.run(req).await;
    state.counter.finished.fetch_add(1, Ordering::SeqCst);
    res
}
