//! Purpose: HTTP surface of the ordered mock: admin side channel plus the catch-all handler.
//! Exports: `router`, `serve_on`, `MockServer`.
//! Role: Shared by the `restmock serve` binary and the in-process fixture.
//! Invariants: Every non-admin request goes through one `LocalExpectations::handle` call.
//! Invariants: Mismatches answer 500 with an error envelope naming expected vs received.
//! Invariants: The queue lock is never held across an `.await`.
#![allow(clippy::result_large_err)]

use std::collections::BTreeMap;
use std::future::{Future, IntoFuture};
use std::thread::JoinHandle;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use super::client::{ExpectationControl, LocalExpectations};
use super::remote::{EXPECTATIONS_PATH, HEALTH_PATH, MISMATCHES_PATH, RemoteExpectations};
use crate::core::address::ServerAddress;
use crate::core::error::{Error, ErrorKind};
use crate::core::expectation::{ExpectedRequest, Mismatch, ReceivedRequest};

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    expectations: LocalExpectations,
}

pub fn router(expectations: LocalExpectations) -> Router {
    let state = AppState { expectations };
    Router::new()
        .route(HEALTH_PATH, get(healthz))
        .route(
            EXPECTATIONS_PATH,
            get(list_expected)
                .post(set_expected)
                .delete(clear_expected),
        )
        .route(MISMATCHES_PATH, get(list_mismatches))
        .fallback(handle_mock)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    expectations: LocalExpectations,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Error> {
    let app = router(expectations);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .into_future()
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("mock server failed")
                .with_source(err)
        })
}

async fn healthz(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        json!({ "ok": true, "served": state.expectations.served() }),
    )
}

async fn list_expected(State(state): State<AppState>) -> Response {
    match state.expectations.remaining() {
        Ok(remaining) => serialize_response(&remaining),
        Err(err) => error_response(err),
    }
}

async fn set_expected(State(state): State<AppState>, body: Bytes) -> Response {
    let expected: Vec<ExpectedRequest> = match serde_json::from_slice(&body) {
        Ok(expected) => expected,
        Err(err) => {
            return error_response(
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid expectation list: {err}"))
                    .with_hint("POST a JSON array of {\"method\",\"path\",...} objects."),
            );
        }
    };
    let count = expected.len();
    match state.expectations.set_expectations(expected) {
        Ok(()) => json_response(StatusCode::OK, json!({ "ok": true, "queued": count })),
        Err(err) => error_response(err),
    }
}

async fn clear_expected(State(state): State<AppState>) -> Response {
    match state.expectations.clear() {
        Ok(()) => json_response(StatusCode::OK, json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

async fn list_mismatches(State(state): State<AppState>) -> Response {
    match state.expectations.mismatches() {
        Ok(mismatches) => serialize_response(&mismatches),
        Err(err) => error_response(err),
    }
}

async fn handle_mock(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let params: BTreeMap<String, String> = uri
        .query()
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    let mut request = ReceivedRequest::new(method.as_str(), uri.path());
    request.params = params;
    request.body = ReceivedRequest::decode_body(&body);

    match state.expectations.handle(request) {
        Ok(canned) => {
            let status =
                StatusCode::from_u16(canned.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            match canned.body {
                Some(body) => json_response(status, body),
                None => status.into_response(),
            }
        }
        Err(mismatch) => mismatch_response(mismatch),
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    received: Option<ReceivedRequest>,
}

fn json_response(status: StatusCode, payload: Value) -> Response {
    let body = payload.to_string();
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body),
    )
        .into_response()
}

fn serialize_response<T: Serialize>(payload: &T) -> Response {
    match serde_json::to_value(payload) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(err) => error_response(
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode response")
                .with_source(err),
        ),
    }
}

fn envelope_response(status: StatusCode, body: ErrorBody) -> Response {
    match serde_json::to_value(ErrorEnvelope { error: body }) {
        Ok(value) => json_response(status, value),
        Err(_) => status.into_response(),
    }
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::PendingExpectations => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    envelope_response(
        status,
        ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            detail: err.detail().map(str::to_string),
            expected: None,
            received: None,
        },
    )
}

fn mismatch_response(mismatch: Mismatch) -> Response {
    envelope_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorBody {
            kind: format!("{:?}", ErrorKind::ExpectationMismatch),
            message: format!("unexpected request: {}", mismatch.reason),
            hint: Some("The queue was not advanced; clear it to recover.".to_string()),
            detail: None,
            expected: mismatch.expected,
            received: Some(mismatch.received),
        },
    )
}

/// A mock server on a private runtime thread. Stops on `shutdown` or drop.
pub struct MockServer {
    address: ServerAddress,
    expectations: LocalExpectations,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<(), Error>>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("address", &self.address)
            .finish()
    }
}

impl MockServer {
    pub fn start(address: ServerAddress) -> Result<Self, Error> {
        Self::start_with(address, LocalExpectations::new())
    }

    /// Bind synchronously, so the server accepts connections as soon as this returns.
    pub fn start_with(
        address: ServerAddress,
        expectations: LocalExpectations,
    ) -> Result<Self, Error> {
        let listener = std::net::TcpListener::bind(address.socket_addr()).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind mock server on {address}"))
                .with_source(err)
        })?;
        let bound = listener
            .local_addr()
            .map(ServerAddress::from)
            .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("restmock-server")
            .enable_all()
            .build()
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start tokio runtime")
                    .with_source(err)
            })?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let served = expectations.clone();
        let thread = std::thread::Builder::new()
            .name(format!("restmock-{bound}"))
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener).map_err(|err| {
                        Error::new(ErrorKind::Io)
                            .with_message("failed to register listener")
                            .with_source(err)
                    })?;
                    serve_on(listener, served, async {
                        let _ = shutdown_rx.await;
                    })
                    .await
                })
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn server thread")
                    .with_source(err)
            })?;

        tracing::info!(address = %bound, "mock server listening");
        Ok(Self {
            address: bound,
            expectations,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn address(&self) -> ServerAddress {
        self.address
    }

    pub fn base_url(&self) -> String {
        self.address.base_url()
    }

    pub fn expectations(&self) -> &LocalExpectations {
        &self.expectations
    }

    /// Admin client for this server, as another process would see it.
    pub fn remote(&self) -> Result<RemoteExpectations, Error> {
        RemoteExpectations::for_address(self.address)
    }

    pub fn shutdown(mut self) -> Result<(), Error> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), Error> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let result = thread.join().map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("mock server thread panicked")
        })?;
        tracing::info!(address = %self.address, "mock server stopped");
        result
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(error = %err, "mock server shutdown failed");
        }
    }
}
