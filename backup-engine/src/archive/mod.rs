//! Local archiver: renders a source tree into a destination as a gzip tar,
//! a deflate zip, or a verbatim mirror.
//!
//! A failure aborts immediately; whatever was already written is left in
//! place.

pub mod raw;
pub mod tar_gz;
pub mod zip_deflate;

use std::fs::{self, File, Metadata};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::broadcast::ProgressTracker;
use crate::checksum::{file_checksum, tree_checksum};
use crate::config::EngineConfig;
use crate::fs::walker::{calculate_total_size, walk_sorted, FileInfo};
use crate::models::{ArchiveFormat, RunStatus};
use crate::transfer::{ByteCounter, ProgressMeter};
use crate::utils::errors::{EngineError, IoContext, Result};

pub use raw::RawSink;
pub use tar_gz::TarGzSink;
pub use zip_deflate::ZipSink;

/// Destination of one archiving pass.
pub trait ArchiveSink {
    fn add_dir(&mut self, entry: &FileInfo) -> Result<()>;

    fn add_file(&mut self, entry: &FileInfo, metadata: &Metadata, reader: &mut dyn Read) -> Result<()>;

    /// Flush everything and return the path the digest is taken over.
    fn finish(self: Box<Self>) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy)]
pub struct ArchiveOptions {
    /// Force the run to 100% once the last byte is written
    pub finalize_progress: bool,

    /// Run total to report against instead of `processed + source size`
    pub projected_total: Option<u64>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            finalize_progress: true,
            projected_total: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    /// `backup.tar` / `backup.zip`, or the mirror root for raw
    pub artifact: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    /// Source bytes copied in this pass
    pub bytes_copied: u64,
}

fn open_sink(format: ArchiveFormat, destination: &Path) -> Result<Box<dyn ArchiveSink>> {
    Ok(match format {
        ArchiveFormat::Tar => Box::new(TarGzSink::create(&destination.join("backup.tar"))?),
        ArchiveFormat::Zip => Box::new(ZipSink::create(&destination.join("backup.zip"))?),
        ArchiveFormat::Raw => Box::new(RawSink::new(destination)),
    })
}

/// Archive `source` into `destination` in `format`, reporting through
/// `tracker`. Bytes are counted on top of what the run has already processed.
pub fn create_backup(
    source: &Path,
    destination: &Path,
    format: ArchiveFormat,
    tracker: &mut ProgressTracker,
    config: &EngineConfig,
    options: ArchiveOptions,
) -> Result<ArchiveOutcome> {
    tracker.set_current_file(None);
    tracker.set_message("Scanning files...");
    tracker.publish()?;

    let source_size = calculate_total_size(source)?;
    let offset = tracker.bytes_processed();
    tracker.set_total_bytes(options.projected_total.unwrap_or(offset + source_size));
    tracker.set_message(match format {
        ArchiveFormat::Raw => "Copying files...",
        _ => "Archiving files...",
    });
    tracker.publish()?;

    info!(
        source = %source.display(),
        destination = %destination.display(),
        format = %format,
        bytes = source_size,
        "Archiving"
    );

    fs::create_dir_all(destination).at_path("failed to create destination directory", destination)?;
    let mut sink = open_sink(format, destination)?;
    let mut meter = ProgressMeter::from_config(Some(source_size), config);

    walk_sorted(source, |entry| {
        if entry.is_dir {
            return sink.add_dir(entry);
        }

        let file = File::open(&entry.path).at_path("failed to open", &entry.path)?;
        let metadata = file.metadata().at_path("failed to stat", &entry.path)?;
        tracker.set_current_file(Some(entry.archive_name()));

        let mut publish_error: Option<EngineError> = None;
        {
            let mut counted = ByteCounter::new(file, |n| {
                if let Some(sample) = meter.advance(n) {
                    tracker.apply_sample(offset, sample);
                    if let Err(e) = tracker.publish() {
                        publish_error.get_or_insert(e);
                    }
                }
            });
            sink.add_file(entry, &metadata, &mut counted)?;
        }
        match publish_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })?;

    let artifact = sink.finish()?;
    let bytes_copied = meter.processed();
    debug!(artifact = %artifact.display(), bytes = bytes_copied, "Archive written");

    let sample = meter.sample();
    tracker.apply_sample(offset, sample);
    tracker.set_current_file(None);
    if options.finalize_progress {
        tracker.update(100, RunStatus::Running, "Calculating checksum...")?;
    } else {
        tracker.set_message("Calculating checksum...");
        tracker.publish()?;
    }

    let (size_bytes, checksum) = match format {
        ArchiveFormat::Raw => (source_size, tree_checksum(&artifact)?),
        _ => {
            let size = fs::metadata(&artifact).at_path("failed to stat", &artifact)?.len();
            (size, file_checksum(&artifact)?)
        }
    };

    Ok(ArchiveOutcome {
        artifact,
        size_bytes,
        checksum,
        bytes_copied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ObserverSet;
    use crate::models::BackupDefinition;
    use crate::store::{BackupStore, MemoryStore};
    use flate2::read::GzDecoder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fixture() -> anyhow::Result<(TempDir, PathBuf)> {
        let dir = TempDir::new()?;
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("nested"))?;
        fs::write(source.join("a.txt"), b"alpha")?;
        fs::write(source.join("nested/b.bin"), vec![0xABu8; 4096])?;
        Ok((dir, source))
    }

    fn tracker_for(format: ArchiveFormat) -> anyhow::Result<(Arc<MemoryStore>, ProgressTracker)> {
        let store = Arc::new(MemoryStore::new());
        let def = BackupDefinition::new("t", "/src", "/dst", format, vec![]);
        store.insert_definition(def.clone());
        let tracker = ProgressTracker::start(store.clone(), ObserverSet::new(), &def.id)?;
        Ok((store, tracker))
    }

    #[test]
    fn test_tar_backup_is_readable() -> anyhow::Result<()> {
        let (dir, source) = fixture()?;
        let dest = dir.path().join("out");
        let (_store, mut tracker) = tracker_for(ArchiveFormat::Tar)?;

        let outcome = create_backup(
            &source,
            &dest,
            ArchiveFormat::Tar,
            &mut tracker,
            &EngineConfig::default(),
            ArchiveOptions::default(),
        )?;

        assert_eq!(outcome.artifact, dest.join("backup.tar"));
        assert_eq!(outcome.checksum, file_checksum(&outcome.artifact)?);
        assert_eq!(outcome.bytes_copied, 5 + 4096);
        assert_eq!(tracker.state().progress, 100);

        let mut archive = ::tar::Archive::new(GzDecoder::new(File::open(&outcome.artifact)?));
        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            let name = entry.path()?.to_string_lossy().trim_end_matches('/').to_string();
            names.push(name);
        }
        names.sort();
        assert_eq!(names, vec!["a.txt", "nested", "nested/b.bin"]);
        Ok(())
    }

    #[test]
    fn test_zip_backup_is_readable() -> anyhow::Result<()> {
        let (dir, source) = fixture()?;
        let dest = dir.path().join("out");
        let (_store, mut tracker) = tracker_for(ArchiveFormat::Zip)?;

        let outcome = create_backup(
            &source,
            &dest,
            ArchiveFormat::Zip,
            &mut tracker,
            &EngineConfig::default(),
            ArchiveOptions::default(),
        )?;

        let mut archive = ::zip::ZipArchive::new(File::open(&outcome.artifact)?)?;
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        archive.by_name("a.txt")?.read_to_string(&mut content)?;
        assert_eq!(content, "alpha");
        Ok(())
    }

    #[test]
    fn test_raw_backup_mirrors_tree() -> anyhow::Result<()> {
        let (dir, source) = fixture()?;
        let dest = dir.path().join("mirror");
        let (store, mut tracker) = tracker_for(ArchiveFormat::Raw)?;

        let outcome = create_backup(
            &source,
            &dest,
            ArchiveFormat::Raw,
            &mut tracker,
            &EngineConfig::default(),
            ArchiveOptions::default(),
        )?;

        assert_eq!(fs::read(dest.join("nested/b.bin"))?, vec![0xABu8; 4096]);
        assert_eq!(outcome.size_bytes, 5 + 4096);
        assert_eq!(outcome.checksum, tree_checksum(&dest)?);

        let stored = store.find_run_state(tracker.run_id())?.unwrap();
        assert_eq!(stored.message, "Calculating checksum...");
        assert_eq!(stored.bytes_processed, 5 + 4096);
        Ok(())
    }

    #[test]
    fn test_bytes_offset_by_earlier_targets() -> anyhow::Result<()> {
        let (dir, source) = fixture()?;
        let (_store, mut tracker) = tracker_for(ArchiveFormat::Raw)?;
        tracker.advance_to(1000);

        create_backup(
            &source,
            &dir.path().join("second"),
            ArchiveFormat::Raw,
            &mut tracker,
            &EngineConfig::default(),
            ArchiveOptions {
                finalize_progress: false,
                projected_total: None,
            },
        )?;

        assert_eq!(tracker.bytes_processed(), 1000 + 5 + 4096);
        assert_eq!(tracker.state().total_bytes, Some(1000 + 5 + 4096));
        Ok(())
    }

    #[test]
    fn test_single_file_source_in_every_format() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("dump.sql");
        fs::write(&source, vec![b'x'; 50_000])?;

        for format in [ArchiveFormat::Tar, ArchiveFormat::Zip, ArchiveFormat::Raw] {
            let dest = dir.path().join(format!("out-{}", format));
            let (_store, mut tracker) = tracker_for(format)?;
            let outcome = create_backup(
                &source,
                &dest,
                format,
                &mut tracker,
                &EngineConfig::default(),
                ArchiveOptions::default(),
            )?;

            assert_eq!(outcome.bytes_copied, 50_000, "{}", format);
            assert_eq!(tracker.bytes_processed(), 50_000, "{}", format);

            match format {
                ArchiveFormat::Tar => {
                    let mut archive = ::tar::Archive::new(GzDecoder::new(File::open(&outcome.artifact)?));
                    let mut entries = Vec::new();
                    for entry in archive.entries()? {
                        let entry = entry?;
                        entries.push((entry.path()?.to_string_lossy().to_string(), entry.size()));
                    }
                    assert_eq!(entries, vec![("dump.sql".to_string(), 50_000)]);
                }
                ArchiveFormat::Zip => {
                    let mut archive = ::zip::ZipArchive::new(File::open(&outcome.artifact)?)?;
                    assert_eq!(archive.len(), 1);
                    assert_eq!(archive.by_name("dump.sql")?.size(), 50_000);
                }
                ArchiveFormat::Raw => {
                    assert_eq!(fs::read(dest.join("dump.sql"))?.len(), 50_000);
                    assert_eq!(outcome.checksum, file_checksum(&source)?);
                }
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_fails_backup() -> anyhow::Result<()> {
        let (dir, source) = fixture()?;
        let real = dir.path().join("real");
        fs::create_dir_all(&real)?;
        fs::write(real.join("data.txt"), b"data")?;
        std::os::unix::fs::symlink("../real", source.join("linked"))?;

        let (_store, mut tracker) = tracker_for(ArchiveFormat::Raw)?;
        let err = create_backup(
            &source,
            &dir.path().join("mirror"),
            ArchiveFormat::Raw,
            &mut tracker,
            &EngineConfig::default(),
            ArchiveOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("linked"));
        Ok(())
    }

    #[test]
    fn test_missing_source_is_io_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (_store, mut tracker) = tracker_for(ArchiveFormat::Tar)?;
        let err = create_backup(
            &dir.path().join("absent"),
            &dir.path().join("out"),
            ArchiveFormat::Tar,
            &mut tracker,
            &EngineConfig::default(),
            ArchiveOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "io");
        Ok(())
    }
}
