//! Bidirectional stream bridge between a remote call and a process.
//!
//! Two copy loops run as separate tasks sharing the call's cancellation
//! token:
//! - inbound: remote messages → process stdin, half-closing stdin at the
//!   end of the inbound stream.
//! - outbound: process stdout → remote peer, in exactly the order written.
//!
//! The first inbound message is checked by a [`FirstMessageValidator`]
//! before any byte reaches the process. Inbound bytes are otherwise
//! forwarded raw; pkt-line validity of the payload is left to the process.

use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Size of a single read from the process's standard output.
pub const OUTPUT_CHUNK_BYTES: usize = 32 * 1024;

// ── Validation ───────────────────────────────────────────────────────────────

/// Inspects the first inbound message before anything is written to the process.
pub trait FirstMessageValidator: Send + Sync {
    /// Accept or reject the first non-empty inbound message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` to reject the call.
    fn validate(&self, first: &[u8]) -> Result<()>;
}

impl<F> FirstMessageValidator for F
where
    F: Fn(&[u8]) -> Result<()> + Send + Sync,
{
    fn validate(&self, first: &[u8]) -> Result<()> {
        self(first)
    }
}

/// Accepts any first message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl FirstMessageValidator for AcceptAll {
    fn validate(&self, _first: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Requires the first message to open with a hexadecimal length field.
///
/// Only the shape is checked: the leading bytes (up to four, as many as the
/// message holds) must be hexadecimal digits. The packet itself is not
/// decoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct PktLineShape;

impl FirstMessageValidator for PktLineShape {
    fn validate(&self, first: &[u8]) -> Result<()> {
        let prefix = &first[..first.len().min(4)];
        if prefix.iter().all(u8::is_ascii_hexdigit) {
            Ok(())
        } else {
            Err(AppError::InvalidArgument(format!(
                "request does not start with a pkt-line length: {:?}",
                String::from_utf8_lossy(prefix)
            )))
        }
    }
}

// ── Bridge ───────────────────────────────────────────────────────────────────

/// The standard streams of one process, detached for bridging.
#[derive(Debug)]
pub struct ProcessPipes<W, R> {
    /// Process standard input.
    pub stdin: W,
    /// Process standard output.
    pub stdout: R,
}

/// Run both copy loops until they finish or one of them fails.
///
/// Returns once the process has closed its output and the inbound side has
/// ended. Closing the output also stops the inbound loop: nothing reads
/// the remaining input. Any failure, or cancellation of `cancel`, stops
/// both loops; the first error observed from either direction is
/// returned.
///
/// # Errors
///
/// - `AppError::InvalidArgument`: the validator rejected the first message.
/// - `AppError::Cancelled`: `cancel` fired or the remote peer went away.
/// - `AppError::Io`: reading or writing a process stream failed.
pub async fn run<S, W, R>(
    inbound: S,
    outbound: mpsc::Sender<Bytes>,
    pipes: ProcessPipes<W, R>,
    validator: Arc<dyn FirstMessageValidator>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Bytes>> + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
    R: AsyncRead + Send + Unpin + 'static,
{
    let first_error: Arc<Mutex<Option<AppError>>> = Arc::new(Mutex::new(None));
    let ProcessPipes { stdin, stdout } = pipes;
    let input_done = cancel.child_token();

    let input = {
        let first_error = Arc::clone(&first_error);
        let cancel = cancel.clone();
        let input_done = input_done.clone();
        tokio::spawn(async move {
            let result =
                pump_inbound(inbound, stdin, validator.as_ref(), &cancel, &input_done).await;
            if let Err(err) = result {
                record(&first_error, err);
                cancel.cancel();
            }
        })
    };

    let output = {
        let first_error = Arc::clone(&first_error);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = pump_outbound(stdout, &outbound, &cancel).await;
            match result {
                Ok(()) => input_done.cancel(),
                Err(err) => {
                    record(&first_error, err);
                    cancel.cancel();
                }
            }
        })
    };

    let (input, output) = tokio::join!(input, output);
    for joined in [input, output] {
        if let Err(err) = joined {
            record(&first_error, AppError::Io(format!("copy task failed: {err}")));
            cancel.cancel();
        }
    }

    let first = first_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Keep only the first error reported by either loop.
fn record(slot: &Mutex<Option<AppError>>, err: AppError) {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.is_none() {
        debug!(error = %err, "bridge direction failed");
        *guard = Some(err);
    }
}

async fn pump_inbound<S, W>(
    mut inbound: S,
    mut stdin: W,
    validator: &dyn FirstMessageValidator,
    cancel: &CancellationToken,
    input_done: &CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut validated = false;

    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(AppError::Cancelled("call cancelled".into())),
            () = input_done.cancelled() => {
                debug!("process closed its output, stopping inbound copy");
                return Ok(());
            }
            item = inbound.next() => item,
        };

        let chunk = match item {
            None => break,
            Some(Err(err)) => return Err(err),
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => chunk,
        };

        if !validated {
            validator.validate(&chunk)?;
            validated = true;
        }

        let written = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(AppError::Cancelled("call cancelled".into())),
            written = stdin.write_all(&chunk) => written,
        };

        match written {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                // The process stopped reading; its exit status decides the call.
                debug!("process closed its input early");
                return Ok(());
            }
            Err(err) => return Err(AppError::Io(format!("write to process stdin failed: {err}"))),
        }
    }

    // Half-close: the process sees end-of-input while output keeps flowing.
    if let Err(err) = stdin.shutdown().await {
        if err.kind() != ErrorKind::BrokenPipe {
            warn!(%err, "failed to close process stdin");
        }
    }
    drop(stdin);
    Ok(())
}

async fn pump_outbound<R>(
    mut stdout: R,
    outbound: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_BYTES];

    loop {
        let read = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(AppError::Cancelled("call cancelled".into())),
            read = stdout.read(&mut buf) => read,
        };

        let n = read.map_err(|err| AppError::Io(format!("read from process stdout failed: {err}")))?;
        if n == 0 {
            return Ok(());
        }

        let permit = tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(AppError::Cancelled("call cancelled".into())),
            permit = outbound.reserve() => permit
                .map_err(|_| AppError::Cancelled("remote peer disconnected".into()))?,
        };
        permit.send(Bytes::copy_from_slice(&buf[..n]));
    }
}
