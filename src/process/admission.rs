//! Admission control for concurrently running processes.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::warn;

use crate::{AppError, Result};

/// Bounded counter of simultaneously running processes.
///
/// Admission never waits: once the ceiling is reached new calls are
/// rejected with `AppError::ResourceExhausted` so the caller applies
/// backpressure instead of the server queueing processes without bound.
#[derive(Debug, Clone)]
pub struct Admission {
    slots: Arc<Semaphore>,
    limit: usize,
}

/// Proof of admission; the slot is released when the permit is dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    /// Create an admission counter with `limit` slots.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Claim a slot without waiting.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when every slot is taken.
    pub fn try_admit(&self) -> Result<AdmissionPermit> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) => {
                warn!(limit = self.limit, "process admission ceiling reached");
                Err(AppError::ResourceExhausted(format!(
                    "concurrent process limit reached ({}/{})",
                    self.limit, self.limit
                )))
            }
            Err(TryAcquireError::Closed) => Err(AppError::ResourceExhausted(
                "process admission closed".into(),
            )),
        }
    }

    /// Number of slots currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.limit - self.slots.available_permits()
    }

    /// Configured ceiling.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }
}
