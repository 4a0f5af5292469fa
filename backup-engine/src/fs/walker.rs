//! Stable directory traversal.
//!
//! Entries come back in lexicographic order of their path components so that
//! archives and checksums built from a walk are reproducible.

use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::utils::errors::{EngineError, IoContext, Result};

/// One entry discovered below the walk root
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: PathBuf,

    /// File size in bytes (0 for directories)
    pub size: u64,

    pub is_dir: bool,

    /// Depth below the root; direct children are 1, a file root is 0
    pub depth: usize,
}

impl FileInfo {
    /// Build from a walk entry. Symlinks to files resolve to their target.
    /// Broken links and links to directories are errors naming the link.
    fn from_entry(entry: &DirEntry, root: &Path) -> Result<Self> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let (size, is_dir) = if entry.path_is_symlink() {
            let resolved = std::fs::metadata(&path).at_path("failed to resolve symlink", &path)?;
            if resolved.is_dir() {
                return Err(EngineError::io_at(
                    "cannot back up symlink",
                    &path,
                    io::Error::other("links to directories are not followed"),
                ));
            }
            (resolved.len(), false)
        } else {
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                (0, true)
            } else {
                (metadata.len(), false)
            }
        };

        Ok(Self {
            path,
            relative_path,
            size,
            is_dir,
            depth: entry.depth(),
        })
    }

    /// Relative path with `/` separators, as stored inside archives.
    pub fn archive_name(&self) -> String {
        self.relative_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Walk `root` and hand every entry below it to `callback`, directories
/// included, in sorted order. The root directory itself is not reported;
/// a plain file root is reported once under its own name.
pub fn walk_sorted<F>(root: &Path, mut callback: F) -> Result<()>
where
    F: FnMut(&FileInfo) -> Result<()>,
{
    let metadata = std::fs::metadata(root).at_path("failed to stat", root)?;
    if !metadata.is_dir() {
        let name = root.file_name().map(PathBuf::from).unwrap_or_else(|| root.to_path_buf());
        return callback(&FileInfo {
            path: root.to_path_buf(),
            relative_path: name,
            size: metadata.len(),
            is_dir: false,
            depth: 0,
        });
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry?;
        callback(&FileInfo::from_entry(&entry, root)?)?;
    }

    Ok(())
}

/// Collect every entry below `root` in sorted order.
pub fn walk_directory(root: &Path) -> Result<Vec<FileInfo>> {
    let mut entries = Vec::new();
    walk_sorted(root, |info| {
        entries.push(info.clone());
        Ok(())
    })?;
    Ok(entries)
}

/// Calculate total size of all files below `root`. A plain file is its own total.
pub fn calculate_total_size(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    walk_sorted(root, |info| {
        if !info.is_dir {
            total += info.size;
        }
        Ok(())
    })?;
    Ok(total)
}
