//! Session entry point: owns the remote host, the configuration and the
//! capability snapshot, and routes copies to the right strategy.

use crate::archive::archive;
use crate::capabilities::{probe, CapabilitySnapshot};
use crate::channel::{open_shell_within, RemoteHost};
use crate::config::ClientConfig;
use crate::error::{Error, LeakKind, ResourceLeak, Result};
use crate::listing::{self, FileItem};
use crate::logger::{Logger, NoopLogger};
use crate::transfer::{self, chunk_size, TransferParams, TransferStats};
use crate::walker;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Totals for one `copy` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub bytes: u64,
    pub chunks: u64,
    pub elapsed: Duration,
}

pub struct Client<H> {
    host: H,
    config: ClientConfig,
    snapshot: OnceCell<CapabilitySnapshot>,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
}

impl<H: RemoteHost> Client<H> {
    pub fn new(host: H, config: ClientConfig) -> Self {
        Self {
            host,
            config,
            snapshot: OnceCell::new(),
            logger: Arc::new(NoopLogger),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Cancelling this token stops every transfer of the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Host limits, probed on first use and cached for the session.
    ///
    /// Connection failures are always fatal. Other probe failures fall back
    /// to an all-zero snapshot unless `strict_probe` is set.
    pub async fn capabilities(&self) -> Result<&CapabilitySnapshot> {
        self.snapshot
            .get_or_try_init(|| async {
                let options = self.config.probe_options();
                match probe(&self.host, self.config.dialect, &options).await {
                    Ok(snapshot) => Ok(snapshot),
                    Err(e) if self.config.strict_probe || e.is_connection() => Err(Error::Probe(e)),
                    Err(e) => {
                        warn!("capability probe failed ({e}); continuing with defaults");
                        Ok(CapabilitySnapshot::default())
                    }
                }
            })
            .await
    }

    /// Raw bytes per chunk for this session.
    pub async fn chunk_size(&self) -> Result<usize> {
        let snapshot = self.capabilities().await?;
        let dialect = self.config.dialect;
        let mut envelope = match snapshot.envelope_bytes() {
            0 => dialect.default_envelope_bytes(),
            n => n,
        };
        if let Some(cap) = self.config.max_envelope_bytes {
            envelope = envelope.min(cap);
        }
        Ok(chunk_size(envelope, dialect)?)
    }

    async fn transfer_params(&self) -> Result<TransferParams> {
        let chunk_size = self.chunk_size().await?;
        let snapshot = self.capabilities().await?;
        let operation_timeout = match snapshot.operation_timeout() {
            Some(host) => host.min(self.config.operation_timeout()),
            None => self.config.operation_timeout(),
        };
        Ok(TransferParams {
            dialect: self.config.dialect,
            chunk_size,
            retry: self.config.retry.clone(),
            operation_timeout,
            debug: self.config.debug,
            cancel: self.cancel.clone(),
            logger: self.logger.clone(),
        })
    }

    /// Copy a local file or directory to `remote`.
    ///
    /// A directory lands as one zip at `remote` unless `archive_directories`
    /// is off, in which case its files are mirrored under `remote`.
    pub async fn copy(&self, local: &Path, remote: &str) -> Result<CopyStats> {
        let started = Instant::now();
        let remote = self.config.dialect.normalize_path(remote);
        let meta = tokio::fs::metadata(local).await.map_err(|source| Error::Local {
            op: "stat",
            path: local.to_path_buf(),
            source,
        })?;
        let params = self.transfer_params().await?;
        info!("copying {} to {remote}", local.display());

        let mut stats = if !meta.is_dir() {
            let t = self.send_path(&params, local, &remote).await?;
            one_file(&t)
        } else if self.config.archive_directories {
            self.copy_archived(&params, local, &remote).await?
        } else {
            let limit = self.capabilities().await?.parallelism(self.config.max_parallel);
            let params = &params;
            let walked = walker::walk(local, &remote, self.config.dialect, limit, move |_, dest, file| async move {
                self.send(params, &dest, file).await
            })
            .await?;
            CopyStats {
                files: walked.files,
                bytes: walked.bytes,
                chunks: walked.chunks,
                elapsed: Duration::ZERO,
            }
        };

        stats.elapsed = started.elapsed();
        self.logger
            .done(stats.files, stats.bytes, stats.elapsed.as_secs_f64());
        Ok(stats)
    }

    async fn copy_archived(&self, params: &TransferParams, local: &Path, remote: &str) -> Result<CopyStats> {
        let root = local.to_path_buf();
        let zip = tokio::task::spawn_blocking(move || archive(&root))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
            .map_err(|source| Error::Archive {
                path: local.to_path_buf(),
                source,
            })?;
        debug!("temp archive: {}", zip.display());

        let sent = self.send_path(params, &zip, remote).await;
        if let Err(e) = tokio::fs::remove_file(&zip).await {
            let leak = ResourceLeak {
                kind: LeakKind::LocalArchive,
                path: zip.display().to_string(),
            };
            warn!("{leak}: {e}");
            self.logger.leak(&leak);
        }
        Ok(one_file(&sent?))
    }

    /// Stream `source` to `remote` as one file.
    pub async fn write<R>(&self, remote: &str, source: R) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
    {
        let params = self.transfer_params().await?;
        let remote = self.config.dialect.normalize_path(remote);
        self.send(&params, &remote, source).await
    }

    /// Children of the remote directory `remote`.
    pub async fn list(&self, remote: &str) -> Result<Vec<FileItem>> {
        let remote = self.config.dialect.normalize_path(remote);
        let mut shell = open_shell_within(&self.host, self.config.connect_timeout())
            .await
            .map_err(Error::Connection)?;
        let listed = listing::list(
            shell.as_mut(),
            self.config.dialect,
            &remote,
            self.config.operation_timeout(),
        )
        .await;
        listed.map_err(|source| Error::List { path: remote, source })
    }

    async fn send_path(&self, params: &TransferParams, local: &Path, remote: &str) -> Result<TransferStats> {
        let file = tokio::fs::File::open(local).await.map_err(|source| Error::Local {
            op: "open",
            path: local.to_path_buf(),
            source,
        })?;
        self.send(params, remote, file).await
    }

    // one shell per transfer, dropped when it finishes
    async fn send<R>(&self, params: &TransferParams, remote: &str, source: R) -> Result<TransferStats>
    where
        R: AsyncRead + Unpin,
    {
        let mut shell = open_shell_within(&self.host, self.config.connect_timeout())
            .await
            .map_err(Error::Connection)?;
        Ok(transfer::transfer(shell.as_mut(), params, remote, source).await?)
    }
}

fn one_file(t: &TransferStats) -> CopyStats {
    CopyStats {
        files: 1,
        bytes: t.bytes,
        chunks: t.chunks,
        elapsed: Duration::ZERO,
    }
}
