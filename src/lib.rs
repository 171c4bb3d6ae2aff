//! shellcp library
//!
//! Push files and directory trees to a host that only offers a remote
//! command channel, by streaming base64 chunks through shell commands.

pub mod archive;
pub mod capabilities;
pub mod channel;
pub mod client;
pub mod config;
pub mod dialect;
pub mod error;
pub mod listing;
pub mod logger;
pub mod protocol;
pub mod transfer;
pub mod walker;

pub use capabilities::CapabilitySnapshot;
pub use channel::{CommandOutput, ProcessHost, RemoteHost, RemoteShell};
pub use client::{Client, CopyStats};
pub use config::ClientConfig;
pub use dialect::Dialect;
pub use error::{ChannelError, Error, Result};
pub use listing::FileItem;
pub use transfer::{RetryPolicy, TransferStats};
