//! Sidecar client for operations not yet implemented natively.
//!
//! The gateway reaches the sidecar through a narrow request/response
//! contract: one line-delimited JSON request per connection on a local
//! socket, answered by one JSON line. Only [`SidecarTransport`] knows how
//! the exchange happens; everything else works with typed requests.
//!
//! Wire envelope:
//!
//! ```text
//! → {"method":"user_create_branch","repo_path":"/srv/repos/a.git","params":{...}}
//! ← {"ok":true,"data":{...}}
//! ← {"ok":false,"code":"failed_precondition","error":"..."}
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::SidecarConfig;
use crate::models::repository::RepositoryRef;
use crate::storage::RepositoryResolver;
use crate::{AppError, Result};

// ── Envelope ─────────────────────────────────────────────────────────────────

/// Request envelope sent to the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidecarRequest {
    /// Operation name, e.g. `user_create_branch`.
    pub method: String,
    /// Resolved absolute repository path.
    pub repo_path: PathBuf,
    /// Operation parameters.
    pub params: serde_json::Value,
}

/// Response envelope returned by the sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SidecarResponse {
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Operation result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure class on error, e.g. `failed_precondition`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SidecarResponse {
    /// Successful response carrying `data`.
    #[must_use]
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            code: None,
            error: None,
        }
    }

    /// Failed response with a failure class and message.
    #[must_use]
    pub fn failure(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            code: Some(code.into()),
            error: Some(error.into()),
        }
    }

    /// Convert into the operation result, mapping failure classes onto
    /// [`AppError`] variants.
    ///
    /// # Errors
    ///
    /// - `failed_precondition` → `AppError::FailedPrecondition`
    /// - `invalid_argument` → `AppError::InvalidArgument`
    /// - `not_found` → `AppError::NotFound`
    /// - anything else → `AppError::Sidecar`
    pub fn into_result(self) -> Result<serde_json::Value> {
        if self.ok {
            return Ok(self.data.unwrap_or(serde_json::Value::Null));
        }
        let message = self.error.unwrap_or_else(|| "unknown sidecar error".into());
        Err(match self.code.as_deref() {
            Some("failed_precondition") => AppError::FailedPrecondition(message),
            Some("invalid_argument") => AppError::InvalidArgument(message),
            Some("not_found") => AppError::NotFound(message),
            _ => AppError::Sidecar(message),
        })
    }
}

/// Boxed future returned by [`SidecarTransport::exchange`].
pub type ExchangeFuture<'a> = Pin<Box<dyn Future<Output = Result<SidecarResponse>> + Send + 'a>>;

/// One request/response exchange with the sidecar.
pub trait SidecarTransport: Send + Sync {
    /// Send `request` and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sidecar` when the sidecar is unreachable, times
    /// out, or answers with a malformed response.
    fn exchange(&self, request: SidecarRequest) -> ExchangeFuture<'_>;
}

// ── Local socket transport ───────────────────────────────────────────────────

/// Transport over an `interprocess` local socket (Unix socket or named pipe).
#[derive(Debug, Clone)]
pub struct LocalSocketTransport {
    ipc_name: String,
    timeout: Duration,
}

impl LocalSocketTransport {
    /// Create a transport for the socket named `ipc_name`.
    #[must_use]
    pub fn new(ipc_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ipc_name: ipc_name.into(),
            timeout,
        }
    }

    /// Create a transport from the `[sidecar]` configuration table.
    #[must_use]
    pub fn from_config(config: &SidecarConfig) -> Self {
        Self::new(
            config.ipc_name.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }

    async fn round_trip(&self, request: &SidecarRequest) -> Result<SidecarResponse> {
        let name = self
            .ipc_name
            .as_str()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| {
                AppError::Sidecar(format!("invalid sidecar socket name '{}': {err}", self.ipc_name))
            })?;

        let stream = LocalSocketStream::connect(name).await.map_err(|err| {
            AppError::Sidecar(format!("cannot reach sidecar '{}': {err}", self.ipc_name))
        })?;
        let (reader, mut writer) = stream.split();

        let mut line = serde_json::to_string(request)
            .map_err(|err| AppError::Sidecar(format!("cannot encode request: {err}")))?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Sidecar(format!("failed to send request: {err}")))?;

        let mut reader = BufReader::new(reader);
        let mut response = String::new();
        let read = reader
            .read_line(&mut response)
            .await
            .map_err(|err| AppError::Sidecar(format!("failed to read response: {err}")))?;
        if read == 0 {
            return Err(AppError::Sidecar("sidecar closed the connection".into()));
        }

        serde_json::from_str(response.trim())
            .map_err(|err| AppError::Sidecar(format!("malformed sidecar response: {err}")))
    }
}

impl SidecarTransport for LocalSocketTransport {
    fn exchange(&self, request: SidecarRequest) -> ExchangeFuture<'_> {
        Box::pin(async move {
            let span = info_span!("sidecar", method = %request.method, ipc_name = %self.ipc_name);
            async move {
                match tokio::time::timeout(self.timeout, self.round_trip(&request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(timeout = ?self.timeout, "sidecar request timed out");
                        Err(AppError::Sidecar(format!(
                            "sidecar did not answer within {:?}",
                            self.timeout
                        )))
                    }
                }
            }
            .instrument(span)
            .await
        })
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

/// Identity of the user performing a repository mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Account identifier forwarded to hooks.
    pub gl_id: String,
}

/// Request to create a branch at a start point.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCreateBranchRequest {
    /// Target repository.
    pub repository: RepositoryRef,
    /// Name of the branch to create, without `refs/heads/`.
    pub branch_name: String,
    /// Revision the branch starts from.
    pub start_point: String,
    /// Acting user.
    pub user: Option<User>,
}

/// A branch and the commit it points to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    /// Branch name.
    pub name: String,
    /// Object id of the target commit.
    pub target_commit_id: String,
}

/// Result of a branch creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCreateBranchResponse {
    /// The created branch; absent when the sidecar created nothing.
    #[serde(default)]
    pub branch: Option<Branch>,
}

#[derive(Serialize)]
struct CreateBranchParams<'a> {
    branch_name: &'a str,
    start_point: &'a str,
    user: &'a User,
}

/// Operations delegated to the sidecar.
#[derive(Clone)]
pub struct SidecarOperations {
    resolver: Arc<dyn RepositoryResolver>,
    transport: Arc<dyn SidecarTransport>,
}

impl SidecarOperations {
    /// Create the delegating service.
    #[must_use]
    pub fn new(resolver: Arc<dyn RepositoryResolver>, transport: Arc<dyn SidecarTransport>) -> Self {
        Self {
            resolver,
            transport,
        }
    }

    /// Create a branch through the sidecar.
    ///
    /// Arguments are validated before the sidecar is contacted.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidArgument`: empty branch name or start point,
    ///   missing user, or unresolvable repository.
    /// - `AppError::FailedPrecondition` / `AppError::NotFound`: rejected
    ///   by the sidecar.
    /// - `AppError::Sidecar`: transport or internal sidecar failure.
    pub async fn user_create_branch(
        &self,
        request: &UserCreateBranchRequest,
    ) -> Result<UserCreateBranchResponse> {
        if request.start_point.is_empty() {
            return Err(AppError::InvalidArgument("empty start point".into()));
        }
        if request.branch_name.is_empty() {
            return Err(AppError::InvalidArgument("empty branch name".into()));
        }
        let user = request
            .user
            .as_ref()
            .ok_or_else(|| AppError::InvalidArgument("empty user".into()))?;

        let repo_path = self
            .resolver
            .resolve(&request.repository)
            .map_err(|err| match err {
                AppError::NotFound(msg) => {
                    AppError::InvalidArgument(format!("unresolvable repository: {msg}"))
                }
                other => other,
            })?;

        let params = serde_json::to_value(CreateBranchParams {
            branch_name: &request.branch_name,
            start_point: &request.start_point,
            user,
        })
        .map_err(|err| AppError::Sidecar(format!("cannot encode parameters: {err}")))?;

        let data = self
            .transport
            .exchange(SidecarRequest {
                method: "user_create_branch".into(),
                repo_path,
                params,
            })
            .await?
            .into_result()?;

        debug!(branch = %request.branch_name, "sidecar created branch");
        if data.is_null() {
            return Ok(UserCreateBranchResponse::default());
        }
        serde_json::from_value(data)
            .map_err(|err| AppError::Sidecar(format!("unexpected response payload: {err}")))
    }
}
