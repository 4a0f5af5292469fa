//! Remote transfer driver: pushes a backup to an SSH host with rsync.
//!
//! Raw backups push the source tree directly. Tar and zip backups are built
//! in a scratch directory first and the single artifact is pushed; progress
//! runs across both phases as one total.

pub mod rsync;
pub mod ssh;

use std::path::Path;
use tracing::info;

use crate::archive::{self, ArchiveOptions};
use crate::broadcast::ProgressTracker;
use crate::checksum::tree_checksum;
use crate::config::EngineConfig;
use crate::fs::walker::calculate_total_size;
use crate::models::{ArchiveFormat, BackupDefinition, RunStatus, TargetHost};
use crate::transfer::ProgressMeter;
use crate::utils::errors::{IoContext, Result};
use crate::utils::format::{format_bytes, format_speed};

pub use rsync::{find_in_path, parse_progress_line, OutputStream, RsyncTransfer, TransferSample};
pub use ssh::{validate_remote, SshCredentials};

/// What a remote target ended up holding
#[derive(Debug, Clone)]
pub struct RemoteOutcome {
    pub size_bytes: u64,
    pub checksum: String,
}

const DEFAULT_TRANSFER: &str = "rsync";

/// Push `definition` to `target`, whose credentials were already validated.
///
/// `pending_after` is the byte estimate for targets still queued after this
/// one; it stays in the reported total so the percentage never tops out early.
pub fn run_remote_backup(
    definition: &BackupDefinition,
    target: &TargetHost,
    creds: &SshCredentials,
    tracker: &mut ProgressTracker,
    config: &EngineConfig,
    pending_after: u64,
) -> Result<RemoteOutcome> {
    let transfer = target
        .transfer_type
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TRANSFER);
    if transfer != DEFAULT_TRANSFER {
        let progress = tracker.state().progress;
        tracker.update(
            progress,
            RunStatus::Running,
            format!("Transfer type '{}' selected; falling back to rsync", transfer),
        )?;
    }

    let source = Path::new(&definition.source);
    match definition.format {
        ArchiveFormat::Raw => push_tree(source, &definition.destination, creds, tracker, config, pending_after),
        format => push_archive(
            source,
            format,
            &definition.destination,
            creds,
            tracker,
            config,
            pending_after,
        ),
    }
}

fn push_tree(
    source: &Path,
    destination: &str,
    creds: &SshCredentials,
    tracker: &mut ProgressTracker,
    config: &EngineConfig,
    pending_after: u64,
) -> Result<RemoteOutcome> {
    let total = calculate_total_size(source)?;
    let offset = tracker.bytes_processed();
    tracker.set_total_bytes(offset + total + pending_after);

    if source.is_dir() {
        // Trailing "/." copies the directory's contents rather than the directory.
        let source_arg = format!("{}/.", source.display());
        transfer(&source_arg, destination, total, offset, creds, tracker, config)?;
    } else {
        let remote_dir = format!("{}/", destination.trim_end_matches('/'));
        let source_arg = source.display().to_string();
        transfer(&source_arg, &remote_dir, total, offset, creds, tracker, config)?;
    }

    tracker.set_message("Calculating checksum...");
    tracker.publish()?;
    Ok(RemoteOutcome {
        size_bytes: total,
        checksum: tree_checksum(source)?,
    })
}

fn push_archive(
    source: &Path,
    format: ArchiveFormat,
    destination: &str,
    creds: &SshCredentials,
    tracker: &mut ProgressTracker,
    config: &EngineConfig,
    pending_after: u64,
) -> Result<RemoteOutcome> {
    let scratch_dir = config.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let scratch = tempfile::Builder::new()
        .prefix("backup-")
        .tempdir_in(&scratch_dir)
        .at_path("failed to create temporary directory in", &scratch_dir)?;

    let source_size = calculate_total_size(source)?;
    let offset = tracker.bytes_processed();
    let progress = tracker.state().progress;
    tracker.update(progress, RunStatus::Running, "Archiving locally...")?;

    // Until the artifact exists, assume it is about as large as the source.
    let archived = archive::create_backup(
        source,
        scratch.path(),
        format,
        tracker,
        config,
        ArchiveOptions {
            finalize_progress: false,
            projected_total: Some(offset + source_size * 2 + pending_after),
        },
    )?;

    let transfer_offset = tracker.bytes_processed();
    tracker.set_total_bytes(transfer_offset + archived.size_bytes + pending_after);

    let artifact = archived.artifact.display().to_string();
    // Trailing slash makes rsync create the directory and keep the file name.
    let remote_dir = format!("{}/", destination.trim_end_matches('/'));
    transfer(&artifact, &remote_dir, archived.size_bytes, transfer_offset, creds, tracker, config)?;

    Ok(RemoteOutcome {
        size_bytes: archived.size_bytes,
        checksum: archived.checksum,
    })
}

/// Run rsync, mapping its cumulative byte counts onto the run total from
/// `offset`. Counts are clamped to `expected` bytes.
fn transfer(
    source_arg: &str,
    destination: &str,
    expected: u64,
    offset: u64,
    creds: &SshCredentials,
    tracker: &mut ProgressTracker,
    config: &EngineConfig,
) -> Result<()> {
    tracker.set_current_file(Some("overall".to_string()));
    tracker.set_message("Transferring to remote...");
    tracker.publish()?;

    info!(
        host = %creds.host,
        source = %source_arg,
        destination = %destination,
        bytes = expected,
        "Starting rsync"
    );

    let mut meter = ProgressMeter::from_config(Some(expected), config);
    let rsync = RsyncTransfer::new(config, creds, source_arg, destination);
    rsync.run(|stream, line| {
        match parse_progress_line(line) {
            Some(sample) => {
                if meter.advance_to(sample.bytes.min(expected)).is_some() {
                    tracker.advance_to(offset + meter.processed());
                    tracker.set_rates(Some(sample.speed_bps), sample.eta_seconds);
                    tracker.publish()?;
                }
            }
            None if stream == OutputStream::Stdout => {
                tracker.set_message(line);
                tracker.publish()?;
            }
            None => tracing::debug!(line = %line, "rsync"),
        }
        Ok(())
    })?;

    tracker.advance_to(offset + expected);
    tracker.set_rates(tracker.state().speed_bps, Some(0));
    tracker.set_message("Transfer completed");
    tracker.publish()?;
    info!(
        host = %creds.host,
        transferred = %format_bytes(expected),
        speed = %format_speed(tracker.state().speed_bps.unwrap_or(0)),
        "rsync finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ObserverSet;
    use crate::store::{BackupStore, MemoryStore};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Stand-in for rsync that prints progress and exits with `code`.
    fn fake_rsync(dir: &Path, code: i32) -> anyhow::Result<PathBuf> {
        let path = dir.join(format!("fake-rsync-{}", code));
        let script = format!(
            "#!/bin/sh\n\
             printf 'sending incremental file list\\n'\n\
             printf '          1  10%%    1.00kB/s    0:00:09\\r'\n\
             printf '          5  50%%    2.00kB/s    0:00:02\\r'\n\
             echo 'rsync: simulated stderr' >&2\n\
             exit {}\n",
            code
        );
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        definition: BackupDefinition,
        target: TargetHost,
        creds: SshCredentials,
    }

    fn fixture(format: ArchiveFormat) -> anyhow::Result<Fixture> {
        let dir = TempDir::new()?;
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("sub"))?;
        fs::write(source.join("one.txt"), vec![1u8; 3000])?;
        fs::write(source.join("sub/two.txt"), vec![2u8; 5000])?;
        fs::create_dir_all(dir.path().join("scratch"))?;

        let store = Arc::new(MemoryStore::new());
        let target = TargetHost::remote("r1", "nas", "nas.local", "bk", "/keys/id", 22);
        store.insert_host(target.clone());
        let definition = BackupDefinition::new(
            "remote",
            source.to_string_lossy(),
            "/srv/backups",
            format,
            vec!["r1".into()],
        );
        store.insert_definition(definition.clone());
        let creds = SshCredentials::from_host(&target)?;

        Ok(Fixture {
            dir,
            store,
            definition,
            target,
            creds,
        })
    }

    fn config_for(fx: &Fixture, code: i32) -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig {
            rsync_binary: fake_rsync(fx.dir.path(), code)?.to_string_lossy().into_owned(),
            temp_dir: Some(fx.dir.path().join("scratch")),
            progress_bytes_step: 1,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn test_archive_push_combines_phases() -> anyhow::Result<()> {
        let fx = fixture(ArchiveFormat::Tar)?;
        let config = config_for(&fx, 0)?;
        let observers = ObserverSet::new();
        let (_id, mut rx) = observers.subscribe_channel();
        let mut tracker = ProgressTracker::start(fx.store.clone(), observers, &fx.definition.id)?;

        let outcome = run_remote_backup(&fx.definition, &fx.target, &fx.creds, &mut tracker, &config, 0)?;
        assert!(outcome.size_bytes > 0);
        assert_eq!(outcome.checksum.len(), 64);

        // Archive bytes first, then the artifact on top.
        assert_eq!(tracker.bytes_processed(), 8000 + outcome.size_bytes);
        assert_eq!(tracker.state().total_bytes, Some(8000 + outcome.size_bytes));
        assert_eq!(tracker.state().current_file.as_deref(), Some("overall"));

        let mut last_bytes = 0;
        let mut last_progress = 0;
        while let Ok(view) = rx.try_recv() {
            assert!(view.bytes_processed >= last_bytes);
            assert!(view.progress >= last_progress);
            assert!(view.progress <= 100);
            last_bytes = view.bytes_processed;
            last_progress = view.progress;
        }

        let scratch_left = fs::read_dir(fx.dir.path().join("scratch"))?.count();
        assert_eq!(scratch_left, 0, "scratch directory removed");
        Ok(())
    }

    #[test]
    fn test_failed_push_cleans_up_and_reports_stderr() -> anyhow::Result<()> {
        let fx = fixture(ArchiveFormat::Zip)?;
        let config = config_for(&fx, 23)?;
        let mut tracker = ProgressTracker::start(fx.store.clone(), ObserverSet::new(), &fx.definition.id)?;

        let err = run_remote_backup(&fx.definition, &fx.target, &fx.creds, &mut tracker, &config, 0).unwrap_err();
        assert_eq!(err.kind(), "transfer");
        assert!(err.to_string().contains("simulated stderr"));
        assert_eq!(fs::read_dir(fx.dir.path().join("scratch"))?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_raw_push_uses_source_checksum_and_downgrade_notice() -> anyhow::Result<()> {
        let mut fx = fixture(ArchiveFormat::Raw)?;
        fx.target.transfer_type = Some("scp".to_string());
        let config = config_for(&fx, 0)?;
        let observers = ObserverSet::new();
        let (_id, mut rx) = observers.subscribe_channel();
        let mut tracker = ProgressTracker::start(fx.store.clone(), observers, &fx.definition.id)?;

        let outcome = run_remote_backup(&fx.definition, &fx.target, &fx.creds, &mut tracker, &config, 0)?;
        assert_eq!(outcome.size_bytes, 8000);

        let mut messages = Vec::new();
        while let Ok(view) = rx.try_recv() {
            messages.push(view.message);
        }
        assert!(messages.contains(&"Transfer type 'scp' selected; falling back to rsync".to_string()));
        assert_eq!(outcome.checksum, tree_checksum(Path::new(&fx.definition.source))?);

        let stored = fx.store.find_run_state(tracker.run_id())?.unwrap();
        assert_eq!(stored.bytes_processed, 8000);
        assert_eq!(stored.progress, 100);
        Ok(())
    }

    #[test]
    fn test_single_file_raw_push() -> anyhow::Result<()> {
        let mut fx = fixture(ArchiveFormat::Raw)?;
        let file = fx.dir.path().join("dump.sql");
        fs::write(&file, vec![9u8; 1200])?;
        fx.definition.source = file.to_string_lossy().into_owned();
        let config = config_for(&fx, 0)?;
        let mut tracker = ProgressTracker::start(fx.store.clone(), ObserverSet::new(), &fx.definition.id)?;

        let outcome = run_remote_backup(&fx.definition, &fx.target, &fx.creds, &mut tracker, &config, 0)?;
        assert_eq!(outcome.size_bytes, 1200);
        assert_eq!(outcome.checksum, crate::checksum::file_checksum(&file)?);
        assert_eq!(tracker.bytes_processed(), 1200);
        Ok(())
    }

    #[test]
    fn test_pending_targets_hold_percentage_below_full() -> anyhow::Result<()> {
        for format in [ArchiveFormat::Raw, ArchiveFormat::Tar] {
            let fx = fixture(format)?;
            let config = config_for(&fx, 0)?;
            let observers = ObserverSet::new();
            let (_id, mut rx) = observers.subscribe_channel();
            let mut tracker = ProgressTracker::start(fx.store.clone(), observers, &fx.definition.id)?;

            run_remote_backup(&fx.definition, &fx.target, &fx.creds, &mut tracker, &config, 8000)?;

            let total = tracker.state().total_bytes.unwrap_or(0);
            assert_eq!(total, tracker.bytes_processed() + 8000, "{}", format);
            assert!(tracker.state().progress < 100, "{}", format);
            while let Ok(view) = rx.try_recv() {
                assert!(view.progress < 100, "{}: {}", format, view.message);
            }
        }
        Ok(())
    }
}
