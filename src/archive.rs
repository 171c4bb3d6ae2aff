//! Package a local directory tree into one deflated zip in the temp dir.

use crate::error::ArchiveError;
use crate::protocol::{ARCHIVE_PREFIX, ARCHIVE_SUFFIX};
use log::debug;
use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Zip `root` into a fresh `shellcp-*.zip` under the OS temp dir and return
/// its path. The caller owns (and deletes) the file; nothing is left behind
/// when this fails.
pub fn archive(root: &Path) -> Result<PathBuf, ArchiveError> {
    let base = base_name(root)?;
    let tmp = tempfile::Builder::new()
        .prefix(ARCHIVE_PREFIX)
        .suffix(ARCHIVE_SUFFIX)
        .tempfile()
        .map_err(|source| ArchiveError::Io {
            op: "create archive in",
            path: std::env::temp_dir(),
            source,
        })?;
    let path = tmp.path().to_path_buf();

    let mut zip = ZipWriter::new(tmp);
    write_tree(&mut zip, root, &base)?;
    let tmp = zip.finish().map_err(|source| ArchiveError::Zip {
        name: path.display().to_string(),
        source,
    })?;

    debug!("archived {} into {}", root.display(), path.display());
    tmp.into_temp_path().keep().map_err(|e| ArchiveError::Io {
        op: "keep archive",
        path,
        source: e.error,
    })
}

fn write_tree<W: Write + Seek>(zip: &mut ZipWriter<W>, root: &Path, base: &str) -> Result<(), ArchiveError> {
    let dir_options = FileOptions::default();
    let file_options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let name = entry_name(base, root, entry.path());
        let ft = entry.file_type();

        if ft.is_dir() {
            zip.add_directory(name.as_str(), dir_options)
                .map_err(|source| ArchiveError::Zip { name, source })?;
        } else if ft.is_file() || (ft.is_symlink() && entry.path().is_file()) {
            // links to files are stored as the file they lead to
            let mut file = File::open(entry.path()).map_err(|source| ArchiveError::Io {
                op: "open",
                path: entry.path().to_path_buf(),
                source,
            })?;
            let len = file
                .metadata()
                .map_err(|source| ArchiveError::Io {
                    op: "stat",
                    path: entry.path().to_path_buf(),
                    source,
                })?
                .len();
            let options = file_options.large_file(len >= u64::from(u32::MAX));
            zip.start_file(name.as_str(), options)
                .map_err(|source| ArchiveError::Zip { name, source })?;
            io::copy(&mut file, zip).map_err(|source| ArchiveError::Io {
                op: "read",
                path: entry.path().to_path_buf(),
                source,
            })?;
        } else {
            debug!("archive: skipping special file {}", entry.path().display());
        }
    }
    Ok(())
}

/// `<base>/<relative path>` with forward slashes; directories get a trailing
/// slash from `add_directory`.
fn entry_name(base: &str, root: &Path, path: &Path) -> String {
    let mut name = base.to_string();
    if let Ok(rel) = path.strip_prefix(root) {
        for part in rel.components() {
            if let Component::Normal(part) = part {
                name.push('/');
                name.push_str(&part.to_string_lossy());
            }
        }
    }
    name
}

fn base_name(root: &Path) -> Result<String, ArchiveError> {
    let named = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
    };
    // `.` and `dir/..` only have a name once resolved
    named(root)
        .or_else(|| root.canonicalize().ok().as_deref().and_then(named))
        .ok_or_else(|| ArchiveError::NoBaseName {
            path: root.to_path_buf(),
        })
}
