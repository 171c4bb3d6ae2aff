//! Read-only remote directory listing.

use crate::channel::{run_within, RemoteShell};
use crate::dialect::Dialect;
use crate::error::ListError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileItem {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: DateTime<Utc>,
}

/// List the direct children of `path`, in the order the remote prints them.
pub async fn list(
    shell: &mut dyn RemoteShell,
    dialect: Dialect,
    path: &str,
    timeout: Duration,
) -> Result<Vec<FileItem>, ListError> {
    let output = run_within(shell, &dialect.list_command(path), timeout).await?;
    if !output.success() {
        return Err(ListError::Status {
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    parse_listing(&output.stdout)
}

/// Parse `<kind>\t<size>\t<mtime>\t<name>` records. Output holding a NUL
/// is split on NUL only, so names keep their newlines; otherwise each line is
/// one record.
pub fn parse_listing(text: &str) -> Result<Vec<FileItem>, ListError> {
    let records: Box<dyn Iterator<Item = &str> + '_> = if text.contains('\0') {
        Box::new(text.split('\0'))
    } else {
        Box::new(text.lines().map(|l| l.trim_end_matches('\r')))
    };

    let mut items = Vec::new();
    for (idx, line) in records.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let err = |reason: String| ListError::Parse { line: idx + 1, reason };

        let mut fields = line.splitn(4, '\t');
        let (Some(kind), Some(size), Some(mtime), Some(name)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(err(format!("expected 4 tab-separated fields in {line:?}")));
        };

        let mut kind_chars = kind.chars();
        let is_dir = match (kind_chars.next(), kind_chars.next()) {
            (Some(k), None) => k == 'd',
            _ => return Err(err(format!("bad entry kind {kind:?}"))),
        };
        let size = size
            .trim()
            .parse::<u64>()
            .map_err(|e| err(format!("bad size {size:?}: {e}")))?;
        // fractional seconds are dropped
        let secs = mtime.split('.').next().unwrap_or_default();
        let secs = secs
            .trim()
            .parse::<i64>()
            .map_err(|e| err(format!("bad mtime {mtime:?}: {e}")))?;
        let modified = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| err(format!("mtime {secs} out of range")))?;
        if name.is_empty() {
            return Err(err("empty name".into()));
        }

        items.push(FileItem {
            name: name.to_string(),
            size,
            is_dir,
            modified,
        });
    }
    Ok(items)
}
