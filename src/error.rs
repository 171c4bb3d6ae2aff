//! Error taxonomy shared by every component

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by a remote channel implementation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("remote operation timed out after {0:?}")]
    OperationTimeout(Duration),
    /// Busy server, dropped response, quota momentarily exhausted.
    #[error("transient channel failure: {0}")]
    Transient(String),
    /// Authorization failures and other refusals that retrying cannot fix.
    #[error("remote refused the command: {0}")]
    Refused(String),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::OperationTimeout(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConnectTimeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe step `{step}` failed")]
    Channel {
        step: &'static str,
        #[source]
        source: ChannelError,
    },
    #[error("probe step `{step}` exited with status {code}: {stderr}")]
    Status {
        step: &'static str,
        code: i32,
        stderr: String,
    },
    #[error("couldn't parse `{step}` output: {reason}")]
    Parse { step: &'static str, reason: String },
}

impl ProbeError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Channel { source, .. } if source.is_connection())
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("envelope budget of {budget} bytes leaves no room for a chunk")]
    ChunkSize { budget: usize },
    #[error("staging path for {path} is {len} bytes, limit is {limit}")]
    PathTooLong {
        path: String,
        len: usize,
        limit: usize,
    },
    #[error("chunk {sequence} of {path} still failing after {attempts} attempts")]
    Transient {
        path: String,
        sequence: u64,
        attempts: u32,
        #[source]
        source: ChannelError,
    },
    #[error("remote rejected write to {path}: {reason}")]
    Permanent { path: String, reason: String },
    #[error("connection lost while writing {path}")]
    Connection {
        path: String,
        #[source]
        source: ChannelError,
    },
    #[error("couldn't read source stream for {path}")]
    Source {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("transfer to {path} cancelled")]
    Cancelled { path: String },
}

impl TransferError {
    /// True for failures a later attempt of the whole operation may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[derive(Debug, Error)]
pub enum ListError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("listing exited with status {code}: {stderr}")]
    Status { code: i32, stderr: String },
    #[error("listing line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{op} {path}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("walking directory tree")]
    Walk(#[from] walkdir::Error),
    #[error("writing archive entry {name}")]
    Zip {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("{path} has no usable base name")]
    NoBaseName { path: PathBuf },
}

/// Top-level error returned by [`crate::Client`] operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("couldn't open a remote shell")]
    Connection(#[source] ChannelError),
    #[error("capability probe failed")]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("listing {path} failed")]
    List {
        path: String,
        #[source]
        source: ListError,
    },
    #[error("archiving {path} failed")]
    Archive {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },
    #[error("{op} {path}")]
    Local {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("walking {path} failed")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Config { path: PathBuf, reason: String },
    #[error("background task failed: {0}")]
    Task(String),
}

/// What kind of temporary artifact was left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakKind {
    LocalArchive,
    RemoteStaging,
}

/// Non-fatal warning: a temporary artifact could not be removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLeak {
    pub kind: LeakKind,
    pub path: String,
}

impl fmt::Display for ResourceLeak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LeakKind::LocalArchive => write!(f, "local archive left at {}", self.path),
            LeakKind::RemoteStaging => write!(f, "remote staging file left at {}", self.path),
        }
    }
}
