//! External process lifecycle.
//!
//! One process per call, bound to the call's cancellation token:
//! - `spec`: the validated invocation with an explicit environment.
//! - `admission`: the bounded counter limiting concurrently running processes.
//! - `runner`: spawning, exit reaping, and signal escalation on cancellation.

pub mod admission;
pub mod runner;
pub mod spec;

pub use admission::{Admission, AdmissionPermit};
pub use runner::{ManagedProcess, ProcessExit, ProcessRunner};
pub use spec::ProcessSpec;
