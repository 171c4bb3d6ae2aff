//! Direct-mode directory copy: one transfer per local file, mirrored under a
//! remote root.

use crate::dialect::Dialect;
use crate::error::{Error, Result};
use crate::protocol::SKIPPED_FILE_NAME;
use crate::transfer::TransferStats;
use futures::stream::{self, StreamExt, TryStreamExt};
use log::debug;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// A local file and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub local: PathBuf,
    pub remote: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub files: u64,
    pub bytes: u64,
    pub chunks: u64,
}

impl WalkStats {
    fn add(mut self, t: &TransferStats) -> Self {
        self.files += 1;
        self.bytes += t.bytes;
        self.chunks += t.chunks;
        self
    }
}

/// Every file under `root` except directories and Finder metadata, with its
/// remote destination under `dest_root`. Sorted by path.
pub fn enumerate(root: &Path, dest_root: &str, dialect: Dialect) -> Result<Vec<WalkEntry>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|source| Error::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        let ft = entry.file_type();
        if ft.is_dir() || entry.file_name() == SKIPPED_FILE_NAME {
            continue;
        }
        // links are followed when opened; only ones that lead to a file count
        if ft.is_symlink() && !entry.path().is_file() {
            debug!("walk: skipping {}", entry.path().display());
            continue;
        }

        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        entries.push(WalkEntry {
            local: entry.path().to_path_buf(),
            remote: dialect.join(dest_root, parts.iter().map(String::as_str)),
        });
    }
    Ok(entries)
}

/// Send every file under `root` through `transfer_fn`, at most `limit` at a
/// time. The first failure aborts the walk.
pub async fn walk<F, Fut>(
    root: &Path,
    dest_root: &str,
    dialect: Dialect,
    limit: usize,
    transfer_fn: F,
) -> Result<WalkStats>
where
    F: Fn(PathBuf, String, tokio::fs::File) -> Fut,
    Fut: Future<Output = Result<TransferStats>>,
{
    let root_buf = root.to_path_buf();
    let dest = dest_root.to_string();
    let entries = tokio::task::spawn_blocking(move || enumerate(&root_buf, &dest, dialect))
        .await
        .map_err(|e| Error::Task(e.to_string()))??;
    debug!(
        "walk: {} files under {} ({} at a time)",
        entries.len(),
        root.display(),
        limit.max(1)
    );

    let transfer_fn = &transfer_fn;
    stream::iter(entries)
        .map(|entry| async move {
            let file = tokio::fs::File::open(&entry.local)
                .await
                .map_err(|source| Error::Local {
                    op: "open",
                    path: entry.local.clone(),
                    source,
                })?;
            transfer_fn(entry.local, entry.remote, file).await
        })
        .buffer_unordered(limit.max(1))
        .try_fold(WalkStats::default(), |acc, t| async move { Ok(acc.add(&t)) })
        .await
}
