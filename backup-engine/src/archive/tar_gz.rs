//! gzip-compressed tar sink.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{File, Metadata};
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Builder, Header};

use super::ArchiveSink;
use crate::fs::walker::FileInfo;
use crate::utils::errors::{IoContext, Result};

pub struct TarGzSink {
    path: PathBuf,
    builder: Builder<GzEncoder<File>>,
}

impl TarGzSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).at_path("failed to create", path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.follow_symlinks(false);
        Ok(Self {
            path: path.to_path_buf(),
            builder,
        })
    }
}

impl ArchiveSink for TarGzSink {
    fn add_dir(&mut self, entry: &FileInfo) -> Result<()> {
        self.builder
            .append_dir(entry.archive_name(), &entry.path)
            .at_path("failed to archive directory", &entry.path)
    }

    fn add_file(&mut self, entry: &FileInfo, metadata: &Metadata, reader: &mut dyn Read) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_metadata(metadata);
        header.set_size(metadata.len());
        self.builder
            .append_data(&mut header, entry.archive_name(), reader)
            .at_path("failed to archive", &entry.path)
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        let path = self.path;
        let encoder = self
            .builder
            .into_inner()
            .at_path("failed to finalize tar", &path)?;
        encoder.finish().at_path("failed to finalize gzip", &path)?;
        Ok(path)
    }
}
