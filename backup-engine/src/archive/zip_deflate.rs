//! Deflate zip sink.

use chrono::{DateTime, Datelike, Local, Timelike};
use std::fs::{File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::ArchiveSink;
use crate::fs::walker::FileInfo;
use crate::utils::errors::{EngineError, IoContext, Result};

pub struct ZipSink {
    path: PathBuf,
    writer: ZipWriter<File>,
}

impl ZipSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).at_path("failed to create", path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: ZipWriter::new(file),
        })
    }
}

fn zip_error(path: &Path, err: zip::result::ZipError) -> EngineError {
    EngineError::io_at("failed to write zip entry for", path, io::Error::other(err))
}

/// DOS timestamps cover 1980..=2107; anything outside falls back to the epoch.
fn modified_time(metadata: &Metadata) -> zip::DateTime {
    metadata
        .modified()
        .ok()
        .map(DateTime::<Local>::from)
        .and_then(|t| {
            zip::DateTime::from_date_and_time(
                u16::try_from(t.year()).ok()?,
                t.month() as u8,
                t.day() as u8,
                t.hour() as u8,
                t.minute() as u8,
                t.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

impl ArchiveSink for ZipSink {
    // Directories are implied by entry paths.
    fn add_dir(&mut self, _entry: &FileInfo) -> Result<()> {
        Ok(())
    }

    fn add_file(&mut self, entry: &FileInfo, metadata: &Metadata, reader: &mut dyn Read) -> Result<()> {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(modified_time(metadata))
            .large_file(metadata.len() >= u32::MAX as u64);

        self.writer
            .start_file(entry.archive_name(), options)
            .map_err(|e| zip_error(&entry.path, e))?;
        io::copy(reader, &mut self.writer).at_path("failed to archive", &entry.path)?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        let path = self.path;
        self.writer.finish().map_err(|e| zip_error(&path, e))?;
        Ok(path)
    }
}
