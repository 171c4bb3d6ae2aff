//! Chunked transfer of one byte stream to one remote path over a text-only
//! command channel.
//!
//! The stream is cut into chunks small enough that one base64-encoded chunk
//! plus its command wrapper fits the host's envelope budget. Chunks are
//! written in order to a staging file next to the destination, each with an
//! explicit offset, and the staging file is renamed onto the destination once
//! the stream is exhausted. The destination therefore only ever holds the old
//! content or the complete new content.

use crate::channel::{run_within, CommandOutput, RemoteShell};
use crate::dialect::Dialect;
use crate::error::{LeakKind, ResourceLeak, TransferError};
use crate::logger::{Logger, NoopLogger};
use crate::protocol::{self, timeouts, COMMAND_OVERHEAD_BYTES, RAW_QUANTUM};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Raw bytes per chunk for a given envelope budget.
///
/// Largest multiple of 3 not above `(envelope - overhead) * den / num`.
pub fn chunk_size(envelope_bytes: usize, dialect: Dialect) -> Result<usize, TransferError> {
    let (num, den) = dialect.expansion();
    let usable = envelope_bytes.saturating_sub(COMMAND_OVERHEAD_BYTES);
    let raw = usable.saturating_mul(den) / num;
    let raw = raw - raw % RAW_QUANTUM;
    if raw == 0 {
        return Err(TransferError::ChunkSize {
            budget: envelope_bytes,
        });
    }
    Ok(raw)
}

/// Retry behaviour for transient channel failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per command, first one included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: timeouts::MAX_ATTEMPTS,
            base_delay_ms: timeouts::RETRY_BASE_MS,
            max_delay_ms: timeouts::RETRY_MAX_MS,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the base delay.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Everything a transfer needs besides the shell and the stream.
#[derive(Clone)]
pub struct TransferParams {
    pub dialect: Dialect,
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub operation_timeout: Duration,
    /// Surface stderr of successful commands
    pub debug: bool,
    pub cancel: CancellationToken,
    pub logger: Arc<dyn Logger>,
}

impl TransferParams {
    pub fn new(dialect: Dialect, chunk_size: usize) -> Self {
        Self {
            dialect,
            chunk_size,
            retry: RetryPolicy::default(),
            operation_timeout: Duration::from_millis(timeouts::OPERATION_MS),
            debug: false,
            cancel: CancellationToken::new(),
            logger: Arc::new(NoopLogger),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub destination: String,
    pub bytes: u64,
    pub chunks: u64,
}

/// Per-call state of one transfer; lives exactly as long as the call.
struct TransferSession<'a> {
    shell: &'a mut dyn RemoteShell,
    params: &'a TransferParams,
    destination: &'a str,
    staging: String,
    sequence: u64,
    offset: u64,
    // something may exist at the staging path
    touched: bool,
}

impl<'a> TransferSession<'a> {
    fn begin(
        shell: &'a mut dyn RemoteShell,
        params: &'a TransferParams,
        destination: &'a str,
    ) -> Result<Self, TransferError> {
        if params.chunk_size == 0 {
            return Err(TransferError::ChunkSize { budget: 0 });
        }
        let token = Uuid::new_v4().simple().to_string();
        let staging = params.dialect.staging_path(destination, &token);
        if staging.len() > protocol::MAX_REMOTE_PATH_LEN {
            return Err(TransferError::PathTooLong {
                path: destination.to_string(),
                len: staging.len(),
                limit: protocol::MAX_REMOTE_PATH_LEN,
            });
        }
        Ok(Self {
            shell,
            params,
            destination,
            staging,
            sequence: 0,
            offset: 0,
            touched: false,
        })
    }

    async fn append(&mut self, chunk: &[u8]) -> Result<(), TransferError> {
        let encoded = STANDARD.encode(chunk);
        let command = self
            .params
            .dialect
            .append_command(&self.staging, self.offset, &encoded, self.sequence == 0);
        self.touched = true;
        self.run(&command, None).await?;

        self.offset += chunk.len() as u64;
        self.params
            .logger
            .chunk_sent(self.destination, self.sequence, chunk.len() as u64);
        self.sequence += 1;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), TransferError> {
        let empty = self.sequence == 0;
        let command = self
            .params
            .dialect
            .finalize_command(&self.staging, self.destination, empty);
        // recreating an empty staging file is safe to repeat; a rename is not
        let retry = (!empty).then(|| {
            self.params
                .dialect
                .finalize_retry_command(&self.staging, self.destination)
        });
        self.touched = true;
        self.run(&command, retry.as_deref()).await?;
        self.touched = false;
        Ok(())
    }

    /// One command with cancellation, timeout and retry applied. Attempts
    /// after the first run `retry_command` when given.
    async fn run(&mut self, command: &str, retry_command: Option<&str>) -> Result<CommandOutput, TransferError> {
        let params = self.params;
        let destination = self.destination;
        let max_attempts = params.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if params.cancel.is_cancelled() {
                return Err(cancelled(destination));
            }
            attempt += 1;
            let command = match retry_command {
                Some(retry) if attempt > 1 => retry,
                _ => command,
            };

            let outcome = tokio::select! {
                _ = params.cancel.cancelled() => return Err(cancelled(destination)),
                r = run_within(&mut *self.shell, command, params.operation_timeout) => r,
            };

            match outcome {
                Ok(output) if output.success() => {
                    if params.debug && !output.stderr.trim().is_empty() {
                        warn!("{} chunk {} stderr: {}", self.destination, self.sequence, output.stderr.trim());
                    }
                    return Ok(output);
                }
                Ok(output) => {
                    return Err(TransferError::Permanent {
                        path: self.destination.to_string(),
                        reason: format!("exit status {}: {}", output.exit_code, output.stderr.trim()),
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = params.retry.delay_after(attempt);
                    warn!(
                        "{} chunk {}: {e}; retrying in {:?} (attempt {}/{})",
                        self.destination,
                        self.sequence,
                        delay,
                        attempt + 1,
                        max_attempts
                    );
                    tokio::select! {
                        _ = params.cancel.cancelled() => return Err(cancelled(destination)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(TransferError::Transient {
                        path: self.destination.to_string(),
                        sequence: self.sequence,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) if e.is_connection() => {
                    return Err(TransferError::Connection {
                        path: self.destination.to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(TransferError::Permanent {
                        path: self.destination.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn leak(&self) -> Option<ResourceLeak> {
        self.touched.then(|| ResourceLeak {
            kind: LeakKind::RemoteStaging,
            path: self.staging.clone(),
        })
    }
}

fn cancelled(destination: &str) -> TransferError {
    TransferError::Cancelled {
        path: destination.to_string(),
    }
}

/// Move the complete contents of `source` to `destination`.
pub async fn transfer<R>(
    shell: &mut dyn RemoteShell,
    params: &TransferParams,
    destination: &str,
    mut source: R,
) -> Result<TransferStats, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut session = TransferSession::begin(shell, params, destination)?;
    params.logger.start_transfer(destination);
    debug!(
        "{destination}: staging at {} in chunks of {} bytes",
        session.staging, params.chunk_size
    );

    let result = pump(&mut session, &mut source).await;
    match result {
        Ok(()) => {
            let stats = TransferStats {
                destination: destination.to_string(),
                bytes: session.offset,
                chunks: session.sequence,
            };
            params.logger.transfer_done(destination, stats.bytes, stats.chunks);
            Ok(stats)
        }
        Err(e) => {
            if let Some(leak) = session.leak() {
                warn!("{leak}");
                params.logger.leak(&leak);
            }
            params.logger.error("transfer", destination, &e.to_string());
            Err(e)
        }
    }
}

async fn pump<R>(session: &mut TransferSession<'_>, source: &mut R) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = session.params.chunk_size;
    let mut buffer = Vec::with_capacity(chunk_size);

    loop {
        buffer.clear();
        // fill a whole chunk unless the stream ends first
        let read = (&mut *source)
            .take(chunk_size as u64)
            .read_to_end(&mut buffer)
            .await
            .map_err(|source| TransferError::Source {
                path: session.destination.to_string(),
                source,
            })?;
        if read == 0 {
            break;
        }
        session.append(&buffer).await?;
        if read < chunk_size {
            break;
        }
    }

    session.finalize().await
}
