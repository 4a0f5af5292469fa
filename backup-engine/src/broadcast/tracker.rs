//! Canonical in-flight state of one run.
//!
//! Single writer: the run that owns the tracker. Every publish stamps the
//! state, persists it and only then broadcasts, so observers always see what
//! the store holds.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

use super::observers::ObserverSet;
use crate::models::{ProgressView, RunState, RunStatus};
use crate::store::BackupStore;
use crate::transfer::RateSample;
use crate::utils::errors::Result;

pub struct ProgressTracker {
    store: Arc<dyn BackupStore>,
    observers: ObserverSet,
    state: RunState,
}

impl ProgressTracker {
    /// Create, persist and announce a fresh `running` state for `definition_id`.
    pub fn start(store: Arc<dyn BackupStore>, observers: ObserverSet, definition_id: &str) -> Result<Self> {
        let state = RunState::started(definition_id);
        store.create_run_state(&state)?;
        let tracker = Self {
            store,
            observers,
            state,
        };
        tracker.broadcast();
        Ok(tracker)
    }

    /// Take over an already persisted state without announcing it.
    pub fn attach(store: Arc<dyn BackupStore>, observers: ObserverSet, state: RunState) -> Self {
        Self {
            store,
            observers,
            state,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn run_id(&self) -> &str {
        &self.state.id
    }

    pub fn bytes_processed(&self) -> u64 {
        self.state.bytes_processed
    }

    /// Set percent, status and message, then publish.
    ///
    /// Percent is clamped to 100 and never moves backwards within a run.
    pub fn update(&mut self, percent: u8, status: RunStatus, message: impl Into<String>) -> Result<()> {
        self.state.progress = self.state.progress.max(percent.min(100));
        self.state.status = status;
        self.state.message = message.into();
        self.publish()
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.state.message = message.into();
    }

    pub fn set_current_file(&mut self, file: Option<String>) {
        self.state.current_file = file;
    }

    pub fn set_total_bytes(&mut self, total: u64) {
        self.state.total_bytes = Some(total);
        self.recompute_percent();
    }

    /// Move the processed counter forward. Smaller values are ignored.
    pub fn advance_to(&mut self, processed: u64) {
        self.state.bytes_processed = self.state.bytes_processed.max(processed);
        self.recompute_percent();
    }

    pub fn set_rates(&mut self, speed_bps: Option<u64>, eta_seconds: Option<u64>) {
        self.state.speed_bps = speed_bps;
        self.state.eta_seconds = eta_seconds;
    }

    /// Apply a meter sample taken over a phase that started at `offset` bytes.
    pub fn apply_sample(&mut self, offset: u64, sample: RateSample) {
        self.advance_to(offset + sample.processed);
        let eta = if sample.speed_bps > 0 {
            self.state
                .total_bytes
                .map(|total| total.saturating_sub(self.state.bytes_processed) / sample.speed_bps)
        } else {
            None
        };
        self.set_rates(Some(sample.speed_bps), eta);
    }

    fn recompute_percent(&mut self) {
        if let Some(total) = self.state.total_bytes.filter(|&t| t > 0) {
            let pct = (self.state.bytes_processed.saturating_mul(100) / total).min(100) as u8;
            self.state.progress = self.state.progress.max(pct);
        }
    }

    /// Stamp, persist, broadcast.
    pub fn publish(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        self.store.save_run_state(&self.state)?;
        debug!(
            run_id = %self.state.id,
            progress = self.state.progress,
            bytes = self.state.bytes_processed,
            "Progress published"
        );
        self.broadcast();
        Ok(())
    }

    /// Re-resolve the denormalized view from the store and push it to every
    /// observer. Best-effort: resolution failures are logged, not returned.
    pub fn broadcast(&self) {
        if self.observers.is_empty() {
            return;
        }
        match resolve_view(self.store.as_ref(), &self.state) {
            Ok(Some(view)) => {
                self.observers.broadcast(&view);
            }
            Ok(None) => warn!(
                run_id = %self.state.id,
                definition_id = %self.state.definition_id,
                "Backup definition vanished; progress not broadcast"
            ),
            Err(e) => warn!(run_id = %self.state.id, error = %e, "Failed to resolve progress view"),
        }
    }
}

/// Join a run-state with its definition and the definition's hosts.
/// `None` when the definition no longer exists; unknown hosts are skipped.
pub fn resolve_view(store: &dyn BackupStore, state: &RunState) -> anyhow::Result<Option<ProgressView>> {
    let definition = match store.find_definition(&state.definition_id)? {
        Some(definition) => definition,
        None => return Ok(None),
    };

    let mut servers = Vec::with_capacity(definition.host_ids.len());
    for id in &definition.host_ids {
        if let Some(host) = store.find_host(id)? {
            servers.push(host);
        }
    }

    Ok(Some(ProgressView::new(state, definition, servers)))
}
