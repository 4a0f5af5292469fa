//! Verbatim mirror of the source tree.

use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use super::ArchiveSink;
use crate::fs::walker::FileInfo;
use crate::utils::errors::{IoContext, Result};

pub struct RawSink {
    root: PathBuf,
}

impl RawSink {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl ArchiveSink for RawSink {
    fn add_dir(&mut self, entry: &FileInfo) -> Result<()> {
        let target = self.root.join(&entry.relative_path);
        fs::create_dir_all(&target).at_path("failed to create directory", &target)
    }

    fn add_file(&mut self, entry: &FileInfo, metadata: &Metadata, reader: &mut dyn Read) -> Result<()> {
        let target = self.root.join(&entry.relative_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).at_path("failed to create directory", parent)?;
        }
        let mut out = File::create(&target).at_path("failed to create", &target)?;
        io::copy(reader, &mut out).at_path("failed to copy to", &target)?;
        fs::set_permissions(&target, metadata.permissions()).at_path("failed to set permissions on", &target)
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        Ok(self.root)
    }
}
