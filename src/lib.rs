#![forbid(unsafe_code)]

//! `git-gateway` relays Git smart-protocol streams between remote callers
//! and locally spawned git processes.

pub mod bridge;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod http;
pub mod linguist;
pub mod models;
pub mod pktline;
pub mod process;
pub mod sidecar;
pub mod storage;

pub use config::GlobalConfig;
pub use errors::{AppError, CallStatus, Result};
