//! Inbound call messages and the per-call lifecycle.

use bytes::Bytes;

use super::repository::RepositoryRef;

/// One inbound message of a bidirectional streaming call.
///
/// The first message of a call is the header: it carries the repository
/// (and any operation-specific identity fields) and an empty payload. Every
/// later message carries payload bytes only; header fields on later
/// messages are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    /// Repository the call operates on; required on the header message.
    pub repository: Option<RepositoryRef>,
    /// Identity of the pushing user, required by receive-pack.
    pub gl_id: Option<String>,
    /// Repository identifier forwarded to hooks by receive-pack.
    pub gl_repository: Option<String>,
    /// Raw payload bytes; must be empty on the header message.
    pub data: Bytes,
}

impl StreamRequest {
    /// Build a header message for `repository`.
    #[must_use]
    pub fn header(repository: RepositoryRef) -> Self {
        Self {
            repository: Some(repository),
            ..Self::default()
        }
    }

    /// Build a payload message.
    #[must_use]
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Attach the pushing user's identity.
    #[must_use]
    pub fn with_gl_id(mut self, gl_id: impl Into<String>) -> Self {
        self.gl_id = Some(gl_id.into());
        self
    }
}

/// Lifecycle state of a single streaming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for and validating the header message.
    AwaitingHeader,
    /// The process is running and both copy loops are active.
    Streaming,
    /// The process exited; remaining output is being delivered.
    Draining,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
}

impl CallState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: CallState) -> bool {
        matches!(
            (self, next),
            (
                CallState::AwaitingHeader,
                CallState::Streaming | CallState::Failed
            ) | (
                CallState::Streaming,
                CallState::Draining | CallState::Failed
            ) | (CallState::Draining, CallState::Done | CallState::Failed)
        )
    }

    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Done | CallState::Failed)
    }
}
