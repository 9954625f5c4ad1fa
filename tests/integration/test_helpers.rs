//! Shared helpers for integration tests.
//!
//! Builds scratch repositories with the real `git` binary, gateways wired
//! to them, and drivers that run a call to completion while collecting
//! every response byte.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use git_gateway::config::StorageConfig;
use git_gateway::gateway::{GatewaySettings, GitOperation, ProtocolGateway};
use git_gateway::models::call::StreamRequest;
use git_gateway::process::ProcessRunner;
use git_gateway::storage::StorageResolver;
use git_gateway::Result;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Storage name used by every fixture.
pub const STORAGE: &str = "default";

/// Relative path of the fixture repository inside its storage.
pub const REPO: &str = "repo.git";

/// Whether a usable `git` binary is on `PATH`.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Skip the calling test when git is missing.
macro_rules! require_git {
    () => {
        if !super::test_helpers::git_available() {
            eprintln!("git not available, skipping");
            return;
        }
    };
}
pub(crate) use require_git;

/// Run git in `dir` and return trimmed stdout, panicking on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(["-c", "user.name=Gateway Test", "-c", "user.email=test@example.com"])
        .args(["-c", "init.defaultBranch=main", "-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8(out.stdout).expect("utf8").trim().to_owned()
}

/// A storage holding one bare repository with two commits on `main`.
pub struct Fixture {
    /// Keeps the scratch directory alive.
    pub root: TempDir,
    /// Storage root.
    pub storage: PathBuf,
    /// Older commit, an ancestor of `second`.
    pub first: String,
    /// Tip of `main`.
    pub second: String,
}

impl Fixture {
    /// Absolute path of the bare repository.
    pub fn repo_path(&self) -> PathBuf {
        self.storage.join(REPO)
    }
}

/// Create the fixture repository.
pub fn fixture() -> Fixture {
    let root = tempfile::tempdir().expect("tempdir");
    let work = root.path().join("work");
    std::fs::create_dir(&work).expect("work dir");

    git(&work, &["init", "-q"]);
    git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);

    std::fs::write(work.join("README.md"), "# fixture\n").expect("write");
    git(&work, &["add", "README.md"]);
    git(&work, &["commit", "-q", "-m", "first"]);
    let first = git(&work, &["rev-parse", "HEAD"]);

    std::fs::write(work.join("main.rs"), "fn main() {}\n").expect("write");
    git(&work, &["add", "main.rs"]);
    git(&work, &["commit", "-q", "-m", "second"]);
    let second = git(&work, &["rev-parse", "HEAD"]);

    let storage = root.path().join("storage");
    std::fs::create_dir(&storage).expect("storage dir");
    git(
        root.path(),
        &["clone", "-q", "--bare", work.to_str().expect("utf8"), storage.join(REPO).to_str().expect("utf8")],
    );

    Fixture {
        storage: storage.canonicalize().expect("canonical storage"),
        root,
        first,
        second,
    }
}

/// Gateway over `storage` admitting `max_processes` concurrent processes.
pub fn gateway(storage: &Path, max_processes: usize) -> ProtocolGateway {
    let resolver = Arc::new(StorageResolver::new(vec![StorageConfig {
        name: STORAGE.into(),
        path: storage.to_path_buf(),
    }]));
    ProtocolGateway::new(
        GatewaySettings {
            git_bin_path: "git".into(),
            env_allowlist: Vec::new(),
            call_timeout: None,
        },
        resolver,
        ProcessRunner::new(max_processes, Duration::from_secs(2)),
    )
}

/// Run one call to completion and collect its response bytes.
pub async fn run_call<S>(
    gateway: &ProtocolGateway,
    operation: &dyn GitOperation,
    inbound: S,
    cancel: CancellationToken,
) -> (Result<()>, Vec<u8>)
where
    S: Stream<Item = Result<StreamRequest>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let collector = tokio::spawn(collect(rx));
    let result = gateway.serve(operation, inbound, tx, cancel).await;
    let output = collector.await.expect("collector task");
    (result, output)
}

/// Drain `rx` into one buffer.
pub async fn collect(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

/// Inbound stream made of `messages`.
pub fn messages(
    messages: Vec<StreamRequest>,
) -> futures_util::stream::Iter<std::vec::IntoIter<Result<StreamRequest>>> {
    futures_util::stream::iter(messages.into_iter().map(Ok).collect::<Vec<_>>())
}
