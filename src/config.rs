//! Session configuration, loadable from TOML.

use crate::capabilities::ProbeOptions;
use crate::dialect::Dialect;
use crate::error::Error;
use crate::protocol::{timeouts, DEBUG_ENV, DEFAULT_MAX_PARALLEL};
use crate::transfer::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub dialect: Dialect,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub retry: RetryPolicy,
    /// Upper bound on concurrent transfers in direct mode
    pub max_parallel: usize,
    /// Cap on the envelope budget, below whatever the host reports
    pub max_envelope_bytes: Option<usize>,
    /// Copy directories as one zip instead of file by file
    pub archive_directories: bool,
    /// Fail on any probe error instead of falling back to defaults
    pub strict_probe: bool,
    pub debug: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            connect_timeout_ms: timeouts::CONNECT_MS,
            operation_timeout_ms: timeouts::OPERATION_MS,
            retry: RetryPolicy::default(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            max_envelope_bytes: None,
            archive_directories: true,
            strict_probe: false,
            debug: debug_from_env(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Local {
            op: "read config",
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            debug: self.debug,
            connect_timeout: self.connect_timeout(),
            operation_timeout: self.operation_timeout(),
        }
    }
}

/// `SHELLCP_DEBUG` set to anything but empty, `0` or `false`.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "" | "0" | "false"))
        .unwrap_or(false)
}
