//! Protocol gateway: one streaming call per git operation.
//!
//! Every call walks the lifecycle
//! `AwaitingHeader → Streaming → Draining → {Done | Failed}`:
//!
//! 1. The header message is validated and its repository resolved; no
//!    process exists before this succeeds.
//! 2. The operation builds its [`ProcessSpec`](crate::process::ProcessSpec)
//!    and the process is started under admission control.
//! 3. The stream bridge relays payload bytes while a separate task waits
//!    for the process to exit.
//! 4. Once all output has been forwarded the exit status is mapped by the
//!    operation into the call's single terminal result.

pub mod operation;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::bridge;
use crate::config::GlobalConfig;
use crate::models::call::{CallState, StreamRequest};
use crate::models::repository::RepositoryRef;
use crate::pktline::{Packet, PktLineCodec};
use crate::process::ProcessRunner;
use crate::storage::RepositoryResolver;
use crate::{AppError, Result};

pub use operation::{AdvertiseRefs, GitOperation, Invocation, ReceivePack, Service, UploadPack};

/// Settings the gateway applies to every call.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Git executable.
    pub git_bin_path: String,
    /// Extra environment variables passed through to git.
    pub env_allowlist: Vec<String>,
    /// Per-call deadline.
    pub call_timeout: Option<Duration>,
}

impl From<&GlobalConfig> for GatewaySettings {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            git_bin_path: config.git_bin_path.clone(),
            env_allowlist: config.env_allowlist.clone(),
            call_timeout: config.call_timeout(),
        }
    }
}

/// Serves git smart-protocol calls by relaying them to git processes.
#[derive(Clone)]
pub struct ProtocolGateway {
    settings: GatewaySettings,
    resolver: Arc<dyn RepositoryResolver>,
    runner: ProcessRunner,
}

/// Lifecycle tracker of one call.
struct Lifecycle {
    state: CallState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: CallState::AwaitingHeader,
        }
    }

    fn advance(&mut self, next: CallState) {
        if self.state.can_transition_to(next) {
            debug!(from = ?self.state, to = ?next, "call state transition");
            self.state = next;
        } else {
            warn!(from = ?self.state, to = ?next, "invalid call state transition ignored");
        }
    }

    /// Record the terminal state for `result` and pass it through.
    fn finish(mut self, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => {
                self.advance(CallState::Done);
                info!("call succeeded");
            }
            Err(err) => {
                self.advance(CallState::Failed);
                info!(status = ?err.status(), error = %err, "call failed");
            }
        }
        result
    }
}

impl ProtocolGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        settings: GatewaySettings,
        resolver: Arc<dyn RepositoryResolver>,
        runner: ProcessRunner,
    ) -> Self {
        Self {
            settings,
            resolver,
            runner,
        }
    }

    /// The process runner shared by every call.
    #[must_use]
    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    /// Serve one `git upload-pack` call.
    ///
    /// # Errors
    ///
    /// See [`ProtocolGateway::serve`].
    pub async fn post_upload_pack<S>(
        &self,
        inbound: S,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: Stream<Item = Result<StreamRequest>> + Send + Unpin + 'static,
    {
        self.serve(&UploadPack, inbound, outbound, cancel).await
    }

    /// Serve one `git receive-pack` call.
    ///
    /// # Errors
    ///
    /// See [`ProtocolGateway::serve`].
    pub async fn post_receive_pack<S>(
        &self,
        inbound: S,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: Stream<Item = Result<StreamRequest>> + Send + Unpin + 'static,
    {
        self.serve(&ReceivePack, inbound, outbound, cancel).await
    }

    /// Serve one bidirectional streaming call for `operation`.
    ///
    /// The first inbound message is the header; later messages carry
    /// payload bytes that are forwarded raw to the process. Response bytes
    /// are sent on `outbound` in process order. The returned value is the
    /// call's single terminal outcome.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidArgument`: missing, malformed or unresolvable
    ///   header; no process is spawned.
    /// - `AppError::ResourceExhausted`: admission ceiling reached.
    /// - `AppError::Spawn`: git could not be started.
    /// - `AppError::Cancelled`: `cancel` fired, the deadline elapsed or the
    ///   peer went away.
    /// - `AppError::ProcessExit`: git exited with an unexpected status.
    pub async fn serve<S>(
        &self,
        operation: &dyn GitOperation,
        mut inbound: S,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        S: Stream<Item = Result<StreamRequest>> + Send + Unpin + 'static,
    {
        let call_id = uuid::Uuid::new_v4();
        let span = info_span!(
            "call",
            %call_id,
            operation = operation.name(),
            storage = tracing::field::Empty,
            relative_path = tracing::field::Empty,
        );

        async move {
            let lifecycle = Lifecycle::new();
            let header = match inbound.next().await {
                Some(Ok(header)) => header,
                Some(Err(err)) => return lifecycle.finish(Err(err)),
                None => {
                    return lifecycle.finish(Err(AppError::InvalidArgument(
                        "empty request stream".into(),
                    )))
                }
            };

            let payload = inbound.map(|message| message.map(|m| m.data));
            self.run_call(lifecycle, operation, header, payload, None, outbound, cancel)
                .await
        }
        .instrument(span)
        .await
    }

    /// Advertise references for `service`.
    ///
    /// Emits the `# service=<name>` preamble and a flush, followed by the
    /// output of `git <service> --stateless-rpc --advertise-refs`.
    ///
    /// # Errors
    ///
    /// Same as [`ProtocolGateway::serve`].
    pub async fn info_refs(
        &self,
        service: Service,
        repository: RepositoryRef,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let operation = AdvertiseRefs { service };
        let call_id = uuid::Uuid::new_v4();
        let span = info_span!(
            "call",
            %call_id,
            operation = operation.name(),
            storage = tracing::field::Empty,
            relative_path = tracing::field::Empty,
        );

        async move {
            let lifecycle = Lifecycle::new();
            let preamble = match service_preamble(service) {
                Ok(preamble) => preamble,
                Err(err) => return lifecycle.finish(Err(err)),
            };
            self.run_call(
                lifecycle,
                &operation,
                StreamRequest::header(repository),
                stream::empty(),
                Some(preamble),
                outbound,
                cancel,
            )
            .await
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_call<P>(
        &self,
        mut lifecycle: Lifecycle,
        operation: &dyn GitOperation,
        header: StreamRequest,
        payload: P,
        preamble: Option<Bytes>,
        outbound: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        P: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
    {
        let repo_path = match self.admit_header(operation, &header) {
            Ok(path) => path,
            Err(err) => return lifecycle.finish(Err(err)),
        };

        let invocation = Invocation {
            git_bin: &self.settings.git_bin_path,
            repo_path: &repo_path,
            header: &header,
            env_allowlist: &self.settings.env_allowlist,
            cancel: cancel.clone(),
            deadline: self.settings.call_timeout,
        };
        let spec = operation.build_spec(&invocation);

        let mut process = match self.runner.start(spec) {
            Ok(process) => process,
            Err(err) => return lifecycle.finish(Err(err)),
        };
        lifecycle.advance(CallState::Streaming);

        let pipes = match process.take_pipes() {
            Ok(pipes) => pipes,
            Err(err) => {
                cancel.cancel();
                if let Err(wait_err) = process.wait().await {
                    debug!(error = %wait_err, "process reaped after setup failure");
                }
                return lifecycle.finish(Err(err));
            }
        };
        let waiter = tokio::spawn(process.wait());

        let delivered = match preamble {
            Some(preamble) => outbound.send(preamble).await.is_ok(),
            None => true,
        };
        let bridged = if delivered {
            bridge::run(
                payload,
                outbound,
                pipes,
                operation.validator(),
                cancel.clone(),
            )
            .await
        } else {
            cancel.cancel();
            Err(AppError::Cancelled("remote peer disconnected".into()))
        };

        // All produced output has been handed to the peer at this point.
        lifecycle.advance(CallState::Draining);
        let exited = waiter
            .await
            .map_err(|err| AppError::Io(format!("process wait task failed: {err}")));

        let result = match (bridged, exited) {
            (Err(err), _) | (Ok(()), Err(err) | Ok(Err(err))) => Err(err),
            (Ok(()), Ok(Ok(exit))) => operation.map_exit(exit),
        };
        let result = match result {
            Ok(()) if cancel.is_cancelled() => {
                Err(AppError::Cancelled("call cancelled".into()))
            }
            other => other,
        };
        lifecycle.finish(result)
    }

    /// Validate the header and resolve its repository.
    fn admit_header(
        &self,
        operation: &dyn GitOperation,
        header: &StreamRequest,
    ) -> Result<std::path::PathBuf> {
        let repository = operation.validate_header(header)?;

        let span = tracing::Span::current();
        span.record("storage", repository.storage_name.as_str());
        span.record("relative_path", repository.relative_path.as_str());

        self.resolver.resolve(repository).map_err(|err| match err {
            AppError::NotFound(msg) => {
                AppError::InvalidArgument(format!("unresolvable repository: {msg}"))
            }
            other => other,
        })
    }
}

/// `# service=<name>\n` followed by a flush.
///
/// # Errors
///
/// Never fails for the supported services; propagates encoder errors.
pub fn service_preamble(service: Service) -> Result<Bytes> {
    let mut codec = PktLineCodec;
    let mut buf = BytesMut::new();
    codec.encode(
        Packet::data(format!("# service={}\n", service.name())),
        &mut buf,
    )?;
    codec.encode(Packet::Flush, &mut buf)?;
    Ok(buf.freeze())
}
