//! Error types shared across the gateway.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Terminal status of a call, reported exactly once per call.
///
/// Mirrors the coarse outcome classes a remote caller can act upon; the
/// HTTP transport maps each class onto a response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    /// The call completed and every response byte was delivered.
    Ok,
    /// The request was malformed or referenced an unresolvable repository.
    InvalidArgument,
    /// A referenced entity does not exist.
    NotFound,
    /// The request was well-formed but the repository state rejects it.
    FailedPrecondition,
    /// The concurrency ceiling was reached; retry later.
    ResourceExhausted,
    /// The call was cancelled or its deadline elapsed.
    Cancelled,
    /// Any other failure: spawn errors, unexpected exit codes, I/O errors.
    Internal,
}

/// Application error enumeration covering all gateway failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed request, unresolvable repository, or non-empty header payload.
    InvalidArgument(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Malformed pkt-line length or truncated packet.
    Protocol(String),
    /// The external process could not be started.
    Spawn(String),
    /// Call token cancelled, deadline exceeded, or peer disconnected.
    Cancelled(String),
    /// Admission ceiling of concurrently running processes reached.
    ResourceExhausted(String),
    /// The external process exited with an unexpected status.
    ProcessExit {
        /// Exit code, `None` when the process was terminated by a signal.
        code: Option<i32>,
        /// Tail of the process's standard error stream.
        stderr: String,
    },
    /// Repository state rejected an otherwise valid request.
    FailedPrecondition(String),
    /// The sidecar could not be reached or answered with an internal failure.
    Sidecar(String),
    /// File-system or stream I/O failure.
    Io(String),
}

impl AppError {
    /// Terminal call status this error is reported as.
    #[must_use]
    pub fn status(&self) -> CallStatus {
        match self {
            Self::InvalidArgument(_) => CallStatus::InvalidArgument,
            Self::NotFound(_) => CallStatus::NotFound,
            Self::FailedPrecondition(_) => CallStatus::FailedPrecondition,
            Self::ResourceExhausted(_) => CallStatus::ResourceExhausted,
            Self::Cancelled(_) => CallStatus::Cancelled,
            Self::Config(_)
            | Self::Protocol(_)
            | Self::Spawn(_)
            | Self::ProcessExit { .. }
            | Self::Sidecar(_)
            | Self::Io(_) => CallStatus::Internal,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::ProcessExit { code, stderr } => {
                match code {
                    Some(code) => write!(f, "process exited with code {code}")?,
                    None => write!(f, "process terminated by signal")?,
                }
                if stderr.is_empty() {
                    Ok(())
                } else {
                    write!(f, ": {stderr}")
                }
            }
            Self::FailedPrecondition(msg) => write!(f, "failed precondition: {msg}"),
            Self::Sidecar(msg) => write!(f, "sidecar: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
