//! Execution orchestrator.
//!
//! Drives a backup definition through `pending -> running -> completed |
//! failed`, one target at a time, and recovers records left `running` by a
//! process that died mid-run.
//!
//! Each run executes on the blocking pool under a supervising task. The run
//! owns its tracker, so persistence and broadcast for one run are strictly
//! sequential; different definitions run fully in parallel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveOptions};
use crate::broadcast::{resolve_view, Observer, ObserverId, ObserverSet, ProgressTracker};
use crate::config::EngineConfig;
use crate::fs::walker::calculate_total_size;
use crate::models::{
    AuditEntry, BackupDefinition, DefinitionStatus, LogLevel, ProgressView, RunState, RunStatus, TargetHost,
};
use crate::remote::{self, SshCredentials};
use crate::store::BackupStore;
use crate::utils::errors::{EngineError, Result};
use crate::utils::format::{format_bytes, format_duration};

/// Acknowledgement returned as soon as a run has been launched
#[derive(Debug, Clone, Serialize)]
pub struct RunStarted {
    pub run_id: String,
    pub definition_id: String,
    pub started_at: DateTime<Utc>,
}

/// What the recovery scan changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub definitions_reset: usize,
    pub runs_failed: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.definitions_reset == 0 && self.runs_failed == 0
    }
}

/// Size and digest of the last target written
#[derive(Debug, Clone)]
struct TargetOutcome {
    size_bytes: u64,
    checksum: String,
}

/// A terminal failure with the message shown to users
struct RunFailure {
    message: String,
    error: EngineError,
}

impl RunFailure {
    fn new(message: impl Into<String>, error: EngineError) -> Self {
        Self {
            message: message.into(),
            error,
        }
    }

    /// The error's own text is already specific enough.
    fn plain(error: EngineError) -> Self {
        Self::new(error.to_string(), error)
    }
}

impl From<EngineError> for RunFailure {
    fn from(error: EngineError) -> Self {
        Self::plain(error)
    }
}

struct Inner {
    store: Arc<dyn BackupStore>,
    observers: ObserverSet,
    config: EngineConfig,
    /// Definitions with a run executing in this process
    executing: Mutex<HashSet<String>>,
}

/// Entry point for starting, observing and recovering backup runs.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn BackupStore>, observers: ObserverSet, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                observers,
                config,
                executing: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn observers(&self) -> &ObserverSet {
        &self.inner.observers
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.inner.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: &ObserverId) -> bool {
        self.inner.observers.unsubscribe(id)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| EngineError::Store(anyhow::anyhow!("blocking task failed: {}", e)))?
    }

    /// Validate and launch a run of `definition_id`, returning once the run's
    /// state has been persisted and announced. The run itself continues in
    /// the background.
    ///
    /// Rejected with `AlreadyRunning`, and nothing is written, while another
    /// run of the same definition is live.
    pub async fn execute_async(&self, definition_id: &str, executed_by: Option<String>) -> Result<RunStarted> {
        // Claim the id before touching the store; the lock is not held
        // across store I/O.
        if !self.inner.executing.lock().await.insert(definition_id.to_string()) {
            return Err(EngineError::AlreadyRunning(format!(
                "Backup {} is already running",
                definition_id
            )));
        }

        // Launch on its own task so a dropped caller cannot strand the claim.
        let this = self.clone();
        let id = definition_id.to_string();
        tokio::spawn(async move { this.launch(id, executed_by).await })
            .await
            .map_err(|e| EngineError::Store(anyhow::anyhow!("launch task failed: {}", e)))?
    }

    async fn launch(&self, definition_id: String, executed_by: Option<String>) -> Result<RunStarted> {
        let id = definition_id.clone();
        let begun = self
            .blocking(move |inner| inner.begin_run(&id, executed_by))
            .await;
        let (definition, state) = match begun {
            Ok(begun) => begun,
            Err(e) => {
                self.inner.executing.lock().await.remove(&definition_id);
                return Err(e);
            }
        };

        let started = RunStarted {
            run_id: state.id.clone(),
            definition_id: definition.id.clone(),
            started_at: state.created_at,
        };
        self.supervise(definition, state);
        Ok(started)
    }

    /// Run the body on the blocking pool. A panic there resets the
    /// definition to `pending` instead of leaving it `running` forever.
    fn supervise(&self, definition: BackupDefinition, state: RunState) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let definition_id = definition.id.clone();
            let run_id = state.id.clone();

            let body = {
                let inner = Arc::clone(&inner);
                tokio::task::spawn_blocking(move || inner.run(definition, state))
            };

            if let Err(e) = body.await {
                error!(definition_id = %definition_id, run_id = %run_id, error = %e, "Backup task aborted");
                let reason = if e.is_panic() {
                    "Backup execution aborted unexpectedly".to_string()
                } else {
                    format!("Backup execution aborted: {}", e)
                };
                let cleanup = {
                    let inner = Arc::clone(&inner);
                    let definition_id = definition_id.clone();
                    tokio::task::spawn_blocking(move || inner.reset_after_abort(&definition_id, &run_id, &reason))
                };
                match cleanup.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(definition_id = %definition_id, error = %e, "Failed to reset aborted backup"),
                    Err(e) => error!(definition_id = %definition_id, error = %e, "Reset task aborted"),
                }
            }

            inner.executing.lock().await.remove(&definition_id);
        });
    }

    /// Whether a run of `definition_id` is executing in this process.
    pub async fn is_executing(&self, definition_id: &str) -> bool {
        self.inner.executing.lock().await.contains(definition_id)
    }

    /// Fail every `running` record nobody is updating anymore and reset its
    /// definition to `pending`. Runs executing in this process are left alone.
    /// Safe to call repeatedly.
    pub async fn recover_interrupted_runs(&self) -> Result<RecoveryReport> {
        let executing = self.inner.executing.lock().await.clone();
        let report = self.blocking(move |inner| inner.recover_all(&executing)).await?;
        if !report.is_empty() {
            info!(
                definitions_reset = report.definitions_reset,
                runs_failed = report.runs_failed,
                "Recovered interrupted backups"
            );
        }
        Ok(report)
    }

    /// Most recent run-state of a definition.
    pub async fn latest_progress(&self, definition_id: &str) -> Result<RunState> {
        let id = definition_id.to_string();
        self.blocking(move |inner| {
            inner.store.latest_run_state(&id)?.ok_or_else(|| {
                EngineError::NotFound(format!("No progress found for backup {}", id))
            })
        })
        .await
    }

    /// Run-states that are running, failed or completed.
    pub async fn active_or_recent(&self) -> Result<Vec<RunState>> {
        self.blocking(|inner| Ok(inner.store.find_run_states_by_status(&RunStatus::VISIBLE)?))
            .await
    }

    /// Same as [`active_or_recent`](Self::active_or_recent), joined with
    /// definitions and hosts. States whose definition is gone are dropped.
    pub async fn active_or_recent_views(&self) -> Result<Vec<ProgressView>> {
        self.blocking(|inner| {
            let mut views = Vec::new();
            for state in inner.store.find_run_states_by_status(&RunStatus::VISIBLE)? {
                if let Some(view) = resolve_view(inner.store.as_ref(), &state)? {
                    views.push(view);
                }
            }
            Ok(views)
        })
        .await
    }
}

impl Inner {
    fn tracker_for(&self, state: RunState) -> ProgressTracker {
        ProgressTracker::attach(Arc::clone(&self.store), self.observers.clone(), state)
    }

    fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.store.append_audit(&entry) {
            warn!(error = %e, message = %entry.message, "Failed to write audit entry");
        }
    }

    /// The start transition. Everything before the first write is a pure
    /// check, so a rejected start leaves the store untouched.
    fn begin_run(&self, definition_id: &str, executed_by: Option<String>) -> Result<(BackupDefinition, RunState)> {
        let mut definition = self
            .store
            .find_definition(definition_id)?
            .ok_or_else(|| EngineError::NotFound(format!("Backup {} not found", definition_id)))?;

        let window = self.config.stale_after();
        let now = Utc::now();
        let latest = self.store.latest_run_state(definition_id)?;
        if let Some(state) = latest.as_ref().filter(|s| s.is_live(window, now)) {
            return Err(EngineError::AlreadyRunning(format!(
                "Backup {} is already running (run {})",
                definition.name, state.id
            )));
        }

        let stale = latest.filter(|s| s.status == RunStatus::Running);
        if definition.status == DefinitionStatus::Running || stale.is_some() {
            let reason = EngineError::StaleState(format!(
                "backup {} is marked running but its run has not been updated for over {}s",
                definition.name,
                window.as_secs()
            ));
            warn!(definition_id = %definition.id, reason = %reason, "Recovering before new run");
            self.recover_definition(&mut definition, stale, &reason)?;
        }

        definition.status = DefinitionStatus::Running;
        definition.started_at = Some(now);
        definition.completed_at = None;
        definition.duration_sec = 0;
        definition.executed_by = executed_by;
        self.store.save_definition(&definition)?;

        let tracker = ProgressTracker::start(Arc::clone(&self.store), self.observers.clone(), &definition.id)?;
        let state = tracker.state().clone();

        self.audit(
            AuditEntry::new(LogLevel::Info, format!("Backup {} started", definition.name))
                .for_backup(&definition.id)
                .with_metadata(serde_json::json!({
                    "run_id": state.id,
                    "executed_by": definition.executed_by,
                })),
        );
        info!(definition_id = %definition.id, run_id = %state.id, "Backup run started");

        Ok((definition, state))
    }

    /// Put a definition abandoned mid-run back to `pending` and fail its
    /// orphaned run-state, if any.
    fn recover_definition(
        &self,
        definition: &mut BackupDefinition,
        stale: Option<RunState>,
        reason: &EngineError,
    ) -> Result<bool> {
        let mut failed_run = false;
        if let Some(state) = stale {
            let run_id = state.id.clone();
            let mut tracker = self.tracker_for(state);
            let progress = tracker.state().progress;
            tracker.update(
                progress,
                RunStatus::Failed,
                "Backup interrupted: no progress reported within the staleness window; marked as failed",
            )?;
            failed_run = true;
            info!(definition_id = %definition.id, run_id = %run_id, "Stale run marked failed");
        }

        if definition.status == DefinitionStatus::Running {
            definition.status = DefinitionStatus::Pending;
            self.store.save_definition(definition)?;
        }

        self.audit(
            AuditEntry::new(
                LogLevel::Warn,
                format!("Backup {} was interrupted and has been reset", definition.name),
            )
            .for_backup(&definition.id)
            .with_metadata(serde_json::json!({
                "error_kind": reason.kind(),
                "reason": reason.to_string(),
            })),
        );
        Ok(failed_run)
    }

    fn recover_all(&self, executing: &HashSet<String>) -> Result<RecoveryReport> {
        let window = self.config.stale_after();
        let now = Utc::now();
        let mut report = RecoveryReport::default();
        let mut handled = HashSet::new();

        for state in self.store.find_run_states_by_status(&[RunStatus::Running])? {
            if executing.contains(&state.definition_id) || !state.is_stale(window, now) {
                continue;
            }
            // Only the newest state of a definition says whether it is live.
            let latest = self.store.latest_run_state(&state.definition_id)?;
            if latest.as_ref().is_some_and(|l| l.id != state.id && l.is_live(window, now)) {
                continue;
            }

            let reason = EngineError::StaleState(format!(
                "run {} last updated at {}",
                state.id, state.updated_at
            ));
            match self.store.find_definition(&state.definition_id)? {
                Some(mut definition) => {
                    let was_running = definition.status == DefinitionStatus::Running;
                    if self.recover_definition(&mut definition, Some(state), &reason)? {
                        report.runs_failed += 1;
                    }
                    if was_running {
                        report.definitions_reset += 1;
                    }
                    handled.insert(definition.id);
                }
                None => {
                    let mut tracker = self.tracker_for(state);
                    let progress = tracker.state().progress;
                    tracker.update(progress, RunStatus::Failed, "Backup interrupted; definition no longer exists")?;
                    report.runs_failed += 1;
                }
            }
        }

        for mut definition in self.store.find_definitions_by_status(DefinitionStatus::Running)? {
            if executing.contains(&definition.id) || handled.contains(&definition.id) {
                continue;
            }
            let latest = self.store.latest_run_state(&definition.id)?;
            if latest.as_ref().is_some_and(|s| s.is_live(window, now)) {
                continue;
            }
            let stale = latest.filter(|s| s.status == RunStatus::Running);
            let reason = EngineError::StaleState(format!("backup {} has no live run", definition.name));
            if self.recover_definition(&mut definition, stale, &reason)? {
                report.runs_failed += 1;
            }
            report.definitions_reset += 1;
        }

        Ok(report)
    }

    /// Body of one run. Every outcome is persisted here; nothing is returned.
    fn run(&self, definition: BackupDefinition, state: RunState) {
        let mut tracker = self.tracker_for(state);
        match self.run_targets(&definition, &mut tracker) {
            Ok(outcome) => {
                if let Err(e) = self.finish_success(&definition, &mut tracker, outcome) {
                    error!(definition_id = %definition.id, error = %e, "Failed to record completed backup");
                    self.finish_failure(
                        &definition,
                        &mut tracker,
                        RunFailure::new(format!("Failed to record backup result: {}", e), e),
                    );
                }
            }
            Err(failure) => self.finish_failure(&definition, &mut tracker, failure),
        }
    }

    fn resolve_targets(&self, definition: &BackupDefinition) -> std::result::Result<Vec<TargetHost>, RunFailure> {
        if definition.host_ids.is_empty() {
            return Ok(vec![TargetHost::local("local", "local")]);
        }
        match self.store.resolve_hosts(&definition.host_ids).map_err(EngineError::Store)? {
            Ok(hosts) => Ok(hosts),
            Err(missing) => Err(RunFailure::plain(EngineError::Validation(format!(
                "Target server {} not found",
                missing
            )))),
        }
    }

    /// Validate every target, then back up to each in order. The first
    /// failure ends the run.
    fn run_targets(
        &self,
        definition: &BackupDefinition,
        tracker: &mut ProgressTracker,
    ) -> std::result::Result<TargetOutcome, RunFailure> {
        let targets = self.resolve_targets(definition)?;

        let source = Path::new(&definition.source);
        if !source.exists() {
            return Err(RunFailure::plain(EngineError::Validation(format!(
                "Source path does not exist: {}",
                definition.source
            ))));
        }

        let mut credentials: Vec<Option<SshCredentials>> = Vec::with_capacity(targets.len());
        for target in &targets {
            if !target.is_remote() {
                credentials.push(None);
                continue;
            }
            tracker.update(
                tracker.state().progress,
                RunStatus::Running,
                format!("Validating remote server {}...", target.label()),
            )?;
            let creds = remote::validate_remote(target, &self.config).map_err(|e| {
                RunFailure::new(
                    format!("Remote server {} validation failed: {}", target.label(), e),
                    e,
                )
            })?;
            credentials.push(Some(creds));
        }

        if credentials.iter().any(Option::is_some) && remote::find_in_path(&self.config.rsync_binary).is_none() {
            return Err(RunFailure::plain(EngineError::Validation(format!(
                "{} command not found in PATH",
                self.config.rsync_binary
            ))));
        }

        // Every target reports against the copies still to come so the
        // percentage keeps climbing from one target to the next.
        let source_size = calculate_total_size(source)?;
        let mut outcome = None;
        let last = targets.len() - 1;
        for (index, (target, creds)) in targets.iter().zip(credentials).enumerate() {
            info!(
                definition_id = %definition.id,
                target = %target.label(),
                remote = target.is_remote(),
                "Backing up to target"
            );
            let pending_after = source_size * (last - index) as u64;
            outcome = Some(match creds {
                None => {
                    let options = ArchiveOptions {
                        finalize_progress: index == last,
                        projected_total: Some(tracker.bytes_processed() + source_size + pending_after),
                    };
                    let archived = archive::create_backup(
                        source,
                        Path::new(&definition.destination),
                        definition.format,
                        tracker,
                        &self.config,
                        options,
                    )
                    .map_err(|e| {
                        RunFailure::new(format!("Local backup failed on {}: {}", target.label(), e), e)
                    })?;
                    TargetOutcome {
                        size_bytes: archived.size_bytes,
                        checksum: archived.checksum,
                    }
                }
                Some(creds) => {
                    let pushed = remote::run_remote_backup(definition, target, &creds, tracker, &self.config, pending_after)
                        .map_err(|e| {
                            RunFailure::new(format!("Remote backup to {} failed: {}", target.label(), e), e)
                        })?;
                    TargetOutcome {
                        size_bytes: pushed.size_bytes,
                        checksum: pushed.checksum,
                    }
                }
            });
        }

        // `targets` is never empty, so neither is `outcome`.
        outcome.ok_or_else(|| RunFailure::plain(EngineError::Validation("No backup targets".to_string())))
    }

    /// Re-read the definition so fields edited during the run survive.
    fn reload(&self, definition: &BackupDefinition) -> BackupDefinition {
        match self.store.find_definition(&definition.id) {
            Ok(Some(fresh)) => fresh,
            Ok(None) => definition.clone(),
            Err(e) => {
                warn!(definition_id = %definition.id, error = %e, "Failed to reload definition");
                definition.clone()
            }
        }
    }

    fn elapsed_secs(definition: &BackupDefinition, now: DateTime<Utc>) -> u64 {
        definition
            .started_at
            .map(|started| now.signed_duration_since(started).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    fn finish_success(
        &self,
        definition: &BackupDefinition,
        tracker: &mut ProgressTracker,
        outcome: TargetOutcome,
    ) -> Result<()> {
        let now = Utc::now();
        let mut updated = self.reload(definition);
        updated.status = DefinitionStatus::Completed;
        updated.size_bytes = outcome.size_bytes;
        updated.checksum = Some(outcome.checksum);
        updated.completed_at = Some(now);
        updated.duration_sec = Self::elapsed_secs(definition, now);
        self.store.save_definition(&updated)?;

        self.audit(
            AuditEntry::new(LogLevel::Info, format!("Backup {} completed successfully", updated.name))
                .for_backup(&updated.id)
                .with_metadata(serde_json::json!({
                    "run_id": tracker.run_id(),
                    "duration_secs": updated.duration_sec,
                    "size_bytes": updated.size_bytes,
                })),
        );

        tracker.set_current_file(None);
        tracker.set_rates(tracker.state().speed_bps, Some(0));
        tracker.update(100, RunStatus::Completed, "Backup completed successfully")?;
        info!(
            definition_id = %updated.id,
            run_id = %tracker.run_id(),
            size = %format_bytes(updated.size_bytes),
            duration = %format_duration(updated.duration_sec),
            "Backup completed"
        );
        Ok(())
    }

    fn finish_failure(&self, definition: &BackupDefinition, tracker: &mut ProgressTracker, failure: RunFailure) {
        error!(
            definition_id = %definition.id,
            run_id = %tracker.run_id(),
            kind = failure.error.kind(),
            error = %failure.error,
            "Backup failed"
        );

        let progress = tracker.state().progress;
        if let Err(e) = tracker.update(progress, RunStatus::Failed, failure.message.clone()) {
            error!(run_id = %tracker.run_id(), error = %e, "Failed to persist failed run state");
        }

        let now = Utc::now();
        let mut updated = self.reload(definition);
        updated.status = DefinitionStatus::Failed;
        updated.completed_at = Some(now);
        updated.duration_sec = Self::elapsed_secs(definition, now);
        if let Err(e) = self.store.save_definition(&updated) {
            error!(definition_id = %updated.id, error = %e, "Failed to persist failed backup");
        }

        self.audit(
            AuditEntry::new(LogLevel::Error, failure.message)
                .for_backup(&updated.id)
                .with_metadata(serde_json::json!({
                    "run_id": tracker.run_id(),
                    "error_kind": failure.error.kind(),
                    "duration_secs": updated.duration_sec,
                })),
        );
    }

    /// Cleanup after the run body died without recording an outcome.
    fn reset_after_abort(&self, definition_id: &str, run_id: &str, reason: &str) -> Result<()> {
        if let Some(state) = self.store.find_run_state(run_id)? {
            if !state.status.is_terminal() {
                let mut tracker = self.tracker_for(state);
                let progress = tracker.state().progress;
                tracker.update(progress, RunStatus::Failed, reason)?;
            }
        }

        if let Some(mut definition) = self.store.find_definition(definition_id)? {
            definition.status = DefinitionStatus::Pending;
            self.store.save_definition(&definition)?;
            self.audit(
                AuditEntry::new(LogLevel::Error, format!("Backup {}: {}", definition.name, reason))
                    .for_backup(definition_id)
                    .with_metadata(serde_json::json!({ "run_id": run_id, "error_kind": "aborted" })),
            );
        }
        Ok(())
    }
}
