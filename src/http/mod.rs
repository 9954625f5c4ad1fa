//! Smart-HTTP transport for the gateway.
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /linguist/colors/{language}`
//! - `GET  /{storage}/{repo}/info/refs?service=git-upload-pack|git-receive-pack`
//! - `POST /{storage}/{repo}/git-upload-pack`
//! - `POST /{storage}/{repo}/git-receive-pack` (`X-Gl-Id` required)
//! - `POST /{storage}/{repo}/branches` (JSON, delegated to the sidecar)
//!
//! A call that fails before producing output is answered with the HTTP
//! status of its [`CallStatus`]. Once the first response byte is sent the
//! status line is fixed at 200, so a later failure aborts the body instead.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{future, stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::gateway::{ProtocolGateway, ReceivePack, Service, UploadPack};
use crate::models::call::StreamRequest;
use crate::models::repository::RepositoryRef;
use crate::sidecar::{SidecarOperations, User, UserCreateBranchRequest};
use crate::{linguist, AppError, CallStatus, Result};

/// Response chunks buffered between a call and its HTTP body.
const OUTBOUND_CAPACITY: usize = 16;

/// Largest accepted JSON request body.
const JSON_BODY_LIMIT: usize = 1024 * 1024;

/// Header carrying alternate object directories, comma-separated.
pub const ALTERNATES_HEADER: &str = "x-git-alternate-object-directories";

/// Header carrying the pushing user's identity.
pub const GL_ID_HEADER: &str = "x-gl-id";

/// Header carrying the repository identifier forwarded to hooks.
pub const GL_REPOSITORY_HEADER: &str = "x-gl-repository";

/// Shared state of the HTTP transport.
#[derive(Clone)]
pub struct HttpState {
    /// Streaming protocol gateway.
    pub gateway: Arc<ProtocolGateway>,
    /// Operations delegated to the sidecar.
    pub operations: Arc<SidecarOperations>,
    /// Server shutdown token; every call token is a child of it.
    pub shutdown: CancellationToken,
}

/// HTTP status for a call that failed before producing output.
#[must_use]
pub fn status_code(status: CallStatus) -> StatusCode {
    match status {
        CallStatus::Ok => StatusCode::OK,
        CallStatus::InvalidArgument => StatusCode::BAD_REQUEST,
        CallStatus::NotFound => StatusCode::NOT_FOUND,
        CallStatus::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        CallStatus::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        CallStatus::Cancelled => StatusCode::REQUEST_TIMEOUT,
        CallStatus::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &AppError) -> Response {
    (status_code(err.status()), err.to_string()).into_response()
}

/// Build the router.
pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/linguist/colors/{language}", get(linguist_color))
        .route("/{storage}/{*rest}", get(repo_get).post(repo_post))
        .with_state(state)
}

/// Bind `bind` and serve until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot be bound, or
/// `AppError::Io` if the server fails.
pub async fn serve_http(
    state: Arc<HttpState>,
    bind: SocketAddr,
    ct: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;

    info!(%bind, "starting smart-HTTP transport");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("smart-HTTP transport shut down");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct LanguageColor {
    language: String,
    color: String,
}

async fn linguist_color(Path(language): Path<String>) -> Json<LanguageColor> {
    let color = linguist::color(&language);
    Json(LanguageColor { language, color })
}

/// Extract `name` from a URI query string.
///
/// Returns `None` when the parameter is absent or empty.
fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query().and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_owned())
            .filter(|v| !v.is_empty())
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn repository(storage: String, relative_path: &str, headers: &HeaderMap) -> RepositoryRef {
    let alternates = header_str(headers, ALTERNATES_HEADER)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|dir| !dir.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    RepositoryRef::new(storage, relative_path).with_alternates(alternates)
}

async fn repo_get(
    State(state): State<Arc<HttpState>>,
    Path((storage, rest)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let Some(relative_path) = rest.strip_suffix("/info/refs") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let service = match query_param(&uri, "service")
        .ok_or_else(|| AppError::InvalidArgument("missing service parameter".into()))
        .and_then(|name| Service::parse(&name))
    {
        Ok(service) => service,
        Err(err) => return error_response(&err),
    };

    let repository = repository(storage, relative_path, &headers);
    let cancel = state.shutdown.child_token();
    let gateway = Arc::clone(&state.gateway);
    let call_cancel = cancel.clone();
    let response = stream_call(cancel, move |outbound| async move {
        gateway
            .info_refs(service, repository, outbound, call_cancel)
            .await
    })
    .await;

    with_headers(
        response,
        &format!("application/x-{}-advertisement", service.name()),
    )
}

async fn repo_post(
    State(state): State<Arc<HttpState>>,
    Path((storage, rest)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if let Some(relative_path) = rest.strip_suffix("/git-upload-pack") {
        let header = StreamRequest::header(repository(storage, relative_path, &headers));
        let response = relay(&state, header, body, |gateway, inbound, outbound, cancel| async move {
            gateway.serve(&UploadPack, inbound, outbound, cancel).await
        })
        .await;
        return with_headers(response, "application/x-git-upload-pack-result");
    }

    if let Some(relative_path) = rest.strip_suffix("/git-receive-pack") {
        let mut header = StreamRequest::header(repository(storage, relative_path, &headers));
        header.gl_id = header_str(&headers, GL_ID_HEADER);
        header.gl_repository = header_str(&headers, GL_REPOSITORY_HEADER);
        let response = relay(&state, header, body, |gateway, inbound, outbound, cancel| async move {
            gateway.serve(&ReceivePack, inbound, outbound, cancel).await
        })
        .await;
        return with_headers(response, "application/x-git-receive-pack-result");
    }

    if let Some(relative_path) = rest.strip_suffix("/branches") {
        let repository = repository(storage, relative_path, &headers);
        return create_branch(&state, repository, body).await;
    }

    StatusCode::NOT_FOUND.into_response()
}

#[derive(Debug, Deserialize)]
struct CreateBranchBody {
    branch_name: String,
    start_point: String,
    #[serde(default)]
    user: Option<User>,
}

async fn create_branch(state: &HttpState, repository: RepositoryRef, body: Body) -> Response {
    let raw = match axum::body::to_bytes(body, JSON_BODY_LIMIT).await {
        Ok(raw) => raw,
        Err(err) => {
            return error_response(&AppError::InvalidArgument(format!(
                "unreadable request body: {err}"
            )))
        }
    };
    let parsed: CreateBranchBody = match serde_json::from_slice(&raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(&AppError::InvalidArgument(format!("invalid json: {err}")))
        }
    };

    let request = UserCreateBranchRequest {
        repository,
        branch_name: parsed.branch_name,
        start_point: parsed.start_point,
        user: parsed.user,
    };
    match state.operations.user_create_branch(&request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            warn!(error = %err, branch = %request.branch_name, "branch creation failed");
            error_response(&err)
        }
    }
}

/// Forward the request body as payload messages after `header`.
async fn relay<F, Fut>(state: &HttpState, header: StreamRequest, body: Body, call: F) -> Response
where
    F: FnOnce(
        Arc<ProtocolGateway>,
        stream::BoxStream<'static, Result<StreamRequest>>,
        mpsc::Sender<Bytes>,
        CancellationToken,
    ) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let payload = body.into_data_stream().map(|chunk| {
        chunk
            .map(StreamRequest::data)
            .map_err(|err| AppError::Io(format!("request body: {err}")))
    });
    let inbound = stream::once(future::ready(Ok(header)))
        .chain(payload)
        .boxed();

    let cancel = state.shutdown.child_token();
    let gateway = Arc::clone(&state.gateway);
    let call_cancel = cancel.clone();
    stream_call(cancel, move |outbound| call(gateway, inbound, outbound, call_cancel)).await
}

/// Run a call on its own task and turn its output into a response.
///
/// Waits for the first output chunk or the call's end, whichever comes
/// first, to decide between a streamed 200 and an error status. The call
/// token is cancelled when the response (or its body) is dropped.
async fn stream_call<F, Fut>(cancel: CancellationToken, start: F) -> Response
where
    F: FnOnce(mpsc::Sender<Bytes>) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let guard = cancel.clone().drop_guard();
    let (outbound, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel::<Result<()>>();

    let call = start(outbound);
    tokio::spawn(async move {
        // The receiver is gone only if the client went away.
        let _ = done_tx.send(call.await);
    });

    let Some(first) = rx.recv().await else {
        return match done_rx.await {
            Ok(Ok(())) => StatusCode::OK.into_response(),
            Ok(Err(err)) => error_response(&err),
            Err(_) => error_response(&AppError::Io("call ended without a result".into())),
        };
    };

    Response::new(Body::from_stream(body_stream(first, rx, done_rx, cancel, guard)))
}

struct BodyState {
    pending: Option<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    done: Option<oneshot::Receiver<Result<()>>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

/// Response body fed by a running call.
///
/// Once the call token is cancelled no further chunk is yielded; buffered
/// output is discarded and the body ends with an error.
fn body_stream(
    first: Bytes,
    rx: mpsc::Receiver<Bytes>,
    done_rx: oneshot::Receiver<Result<()>>,
    cancel: CancellationToken,
    guard: DropGuard,
) -> impl futures_util::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let state = BodyState {
        pending: Some(first),
        rx,
        done: Some(done_rx),
        cancel,
        _guard: guard,
    };
    stream::unfold(state, |mut state| async move {
        // Finished, either cleanly or after reporting an error.
        let done = state.done.take()?;

        let next = if state.cancel.is_cancelled() {
            None
        } else if let Some(chunk) = state.pending.take() {
            Some(Some(chunk))
        } else {
            tokio::select! {
                biased;
                () = state.cancel.cancelled() => None,
                chunk = state.rx.recv() => Some(chunk),
            }
        };

        let outcome = match next {
            Some(Some(chunk)) => {
                state.done = Some(done);
                return Some((Ok(chunk), state));
            }
            None => {
                state.rx.close();
                "call cancelled, discarding undelivered output".to_owned()
            }
            Some(None) => match done.await {
                Ok(Ok(())) => return None,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "call ended without a result".to_owned(),
            },
        };
        warn!(error = %outcome, "call failed after streaming started, aborting body");
        Some((Err(std::io::Error::other(outcome)), state))
    })
}

fn with_headers(mut response: Response, content_type: &str) -> Response {
    if response.status() == StatusCode::OK {
        if let Ok(value) = HeaderValue::from_str(content_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }
    response
}
