//! Per-operation capabilities of the protocol gateway.
//!
//! Each git operation is a [`GitOperation`]: it validates the header
//! message, builds the process invocation, and maps the exit status. The
//! gateway selects one implementation per call and never branches on the
//! operation kind itself.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::{AcceptAll, FirstMessageValidator, PktLineShape};
use crate::models::call::StreamRequest;
use crate::models::repository::RepositoryRef;
use crate::process::{ProcessExit, ProcessSpec};
use crate::storage::confined_relative_path;
use crate::{AppError, Result};

/// Environment variable git reads alternate object directories from.
pub const ALTERNATES_ENV: &str = "GIT_ALTERNATE_OBJECT_DIRECTORIES";

/// Exit code of `git upload-pack` after a shallow negotiation that ended
/// without a pack request.
pub const UPLOAD_PACK_SHALLOW_EXIT: i32 = 128;

/// Everything an operation needs to describe its process.
#[derive(Debug)]
pub struct Invocation<'a> {
    /// Git executable.
    pub git_bin: &'a str,
    /// Resolved absolute repository path.
    pub repo_path: &'a Path,
    /// Validated header message.
    pub header: &'a StreamRequest,
    /// Operator-configured environment pass-through.
    pub env_allowlist: &'a [String],
    /// Call cancellation token.
    pub cancel: CancellationToken,
    /// Per-call deadline.
    pub deadline: Option<Duration>,
}

impl Invocation<'_> {
    /// Base specification shared by every operation: git as the program,
    /// the repository as working directory, the allowed environment and
    /// alternate object directories.
    #[must_use]
    pub fn base_spec(&self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(self.git_bin, self.repo_path, self.cancel.clone())
            .inherit_allowed_env(self.env_allowlist)
            .deadline(self.deadline);

        let alternates = self
            .header
            .repository
            .as_ref()
            .map(|repo| repo.alternate_object_directories.as_slice())
            .unwrap_or_default();
        if !alternates.is_empty() {
            let joined = alternates
                .iter()
                .map(|dir| self.repo_path.join(dir).to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(":");
            spec = spec.env(ALTERNATES_ENV, joined);
        }
        spec
    }

    /// The repository path as a process argument.
    #[must_use]
    pub fn repo_arg(&self) -> String {
        self.repo_path.to_string_lossy().into_owned()
    }
}

/// Capability set of one git operation.
pub trait GitOperation: Send + Sync {
    /// Operation name used in logs, e.g. `upload-pack`.
    fn name(&self) -> &'static str;

    /// Check the header message and return the repository it names.
    ///
    /// The default requires a repository, a payload-free header and
    /// well-formed alternate object directories.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` when the header is unusable.
    fn validate_header<'a>(&self, header: &'a StreamRequest) -> Result<&'a RepositoryRef> {
        let repository = header
            .repository
            .as_ref()
            .ok_or_else(|| AppError::InvalidArgument("empty repository".into()))?;
        if !header.data.is_empty() {
            return Err(AppError::InvalidArgument(
                "non-empty data in first request message".into(),
            ));
        }
        validate_alternates(&repository.alternate_object_directories)?;
        Ok(repository)
    }

    /// Build the process invocation.
    fn build_spec(&self, invocation: &Invocation<'_>) -> ProcessSpec;

    /// Map a completed process to the call outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ProcessExit` for any status other than success.
    fn map_exit(&self, exit: ProcessExit) -> Result<()> {
        if exit.code() == Some(0) {
            Ok(())
        } else {
            Err(exit.into_error())
        }
    }

    /// Validator applied to the first inbound payload message.
    fn validator(&self) -> Arc<dyn FirstMessageValidator> {
        Arc::new(PktLineShape)
    }
}

/// Alternates are joined onto the repository path, so each must stay
/// inside it and must not contain the `:` list separator.
fn validate_alternates(alternates: &[String]) -> Result<()> {
    for dir in alternates {
        if dir.contains(':') {
            return Err(AppError::InvalidArgument(format!(
                "invalid alternate object directory {dir:?}"
            )));
        }
        confined_relative_path(dir).map_err(|err| {
            AppError::InvalidArgument(format!("invalid alternate object directory: {err}"))
        })?;
    }
    Ok(())
}

// ── Operations ───────────────────────────────────────────────────────────────

/// `git upload-pack`: serves fetches and clones.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadPack;

impl GitOperation for UploadPack {
    fn name(&self) -> &'static str {
        "upload-pack"
    }

    fn build_spec(&self, invocation: &Invocation<'_>) -> ProcessSpec {
        invocation
            .base_spec()
            .arg("upload-pack")
            .arg("--stateless-rpc")
            .arg(invocation.repo_arg())
    }

    fn map_exit(&self, exit: ProcessExit) -> Result<()> {
        match exit.code() {
            Some(0) => Ok(()),
            Some(UPLOAD_PACK_SHALLOW_EXIT) => {
                // A deepen request answered with shallow lines only.
                info!(
                    code = UPLOAD_PACK_SHALLOW_EXIT,
                    "upload-pack exited after shallow negotiation, treating as success"
                );
                Ok(())
            }
            _ => Err(exit.into_error()),
        }
    }
}

/// `git receive-pack`: accepts pushes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceivePack;

impl GitOperation for ReceivePack {
    fn name(&self) -> &'static str {
        "receive-pack"
    }

    fn validate_header<'a>(&self, header: &'a StreamRequest) -> Result<&'a RepositoryRef> {
        let repository = UploadPack.validate_header(header)?;
        match header.gl_id.as_deref() {
            Some(gl_id) if !gl_id.is_empty() => Ok(repository),
            _ => Err(AppError::InvalidArgument("empty gl_id".into())),
        }
    }

    fn build_spec(&self, invocation: &Invocation<'_>) -> ProcessSpec {
        let mut spec = invocation
            .base_spec()
            .arg("receive-pack")
            .arg("--stateless-rpc")
            .arg(invocation.repo_arg());

        if let Some(gl_id) = &invocation.header.gl_id {
            spec = spec.env("GL_ID", gl_id);
        }
        if let Some(gl_repository) = &invocation.header.gl_repository {
            spec = spec.env("GL_REPOSITORY", gl_repository);
        }
        spec
    }
}

/// Services that advertise references over smart HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    /// `git-upload-pack`
    UploadPack,
    /// `git-receive-pack`
    ReceivePack,
}

impl Service {
    /// Parse the `service` query parameter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for any other service name.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-receive-pack" => Ok(Self::ReceivePack),
            other => Err(AppError::InvalidArgument(format!(
                "unsupported service '{other}'"
            ))),
        }
    }

    /// Name as used on the wire, e.g. `git-upload-pack`.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// git subcommand implementing the service.
    #[must_use]
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

/// Reference advertisement for `GET .../info/refs`.
#[derive(Debug, Clone, Copy)]
pub struct AdvertiseRefs {
    /// Service whose references are advertised.
    pub service: Service,
}

impl GitOperation for AdvertiseRefs {
    fn name(&self) -> &'static str {
        match self.service {
            Service::UploadPack => "info-refs-upload-pack",
            Service::ReceivePack => "info-refs-receive-pack",
        }
    }

    fn build_spec(&self, invocation: &Invocation<'_>) -> ProcessSpec {
        invocation
            .base_spec()
            .arg(self.service.subcommand())
            .arg("--stateless-rpc")
            .arg("--advertise-refs")
            .arg(invocation.repo_arg())
    }

    fn validator(&self) -> Arc<dyn FirstMessageValidator> {
        Arc::new(AcceptAll)
    }
}
