use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use super::definition::BackupDefinition;
use super::host::TargetHost;
use crate::utils::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Statuses surfaced by the "active or recent" listing.
    pub const VISIBLE: [RunStatus; 3] = [RunStatus::Running, RunStatus::Failed, RunStatus::Completed];
}

impl FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(EngineError::Validation(format!("Unknown run status: {}", other))),
        }
    }
}

/// Mutable record of one execution attempt.
///
/// `total_bytes`, `speed_bps` and `eta_seconds` stay `None` until they have
/// actually been computed; `Some(0)` means "computed as zero".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub id: String,
    #[serde(rename = "backup_id")]
    pub definition_id: String,
    pub status: RunStatus,
    pub progress: u8,
    pub message: String,
    pub current_file: Option<String>,
    pub bytes_processed: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn started(definition_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            definition_id: definition_id.into(),
            status: RunStatus::Running,
            progress: 0,
            message: "Starting backup...".to_string(),
            current_file: None,
            bytes_processed: 0,
            total_bytes: None,
            speed_bps: None,
            eta_seconds: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the state is `running` but has not been touched within `window`.
    pub fn is_stale(&self, window: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        self.status == RunStatus::Running
            && age.to_std().map(|age| age > window).unwrap_or(false)
    }

    /// Running and recently updated.
    pub fn is_live(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Running && !self.is_stale(window, now)
    }
}

/// The message pushed to observers: a run-state joined with its definition
/// and the resolved target hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressView {
    pub id: String,
    pub backup_id: String,
    pub backup: BackupDefinition,
    pub servers: Vec<TargetHost>,
    pub status: RunStatus,
    pub progress: u8,
    pub message: String,
    pub current_file: Option<String>,
    pub bytes_processed: u64,
    pub total_bytes: Option<u64>,
    pub speed_bps: Option<u64>,
    pub eta_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressView {
    pub fn new(state: &RunState, backup: BackupDefinition, servers: Vec<TargetHost>) -> Self {
        Self {
            id: state.id.clone(),
            backup_id: state.definition_id.clone(),
            backup,
            servers,
            status: state.status,
            progress: state.progress,
            message: state.message.clone(),
            current_file: state.current_file.clone(),
            bytes_processed: state.bytes_processed,
            total_bytes: state.total_bytes,
            speed_bps: state.speed_bps,
            eta_seconds: state.eta_seconds,
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_state() {
        let state = RunState::started("def-1");
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.progress, 0);
        assert_eq!(state.message, "Starting backup...");
        assert!(state.total_bytes.is_none());
        assert!(state.speed_bps.is_none());
    }

    #[test]
    fn test_staleness_window() {
        let mut state = RunState::started("def-1");
        let window = Duration::from_secs(60);
        let now = Utc::now();

        assert!(state.is_live(window, now));

        state.updated_at = now - chrono::Duration::seconds(61);
        assert!(state.is_stale(window, now));
        assert!(!state.is_live(window, now));

        state.status = RunStatus::Failed;
        assert!(!state.is_stale(window, now), "only running states go stale");
    }

    #[test]
    fn test_unknown_optional_fields_serialize_as_null() {
        let state = RunState::started("def-1");
        let value = serde_json::to_value(&state).unwrap();
        assert!(value["total_bytes"].is_null());
        assert!(value["eta_seconds"].is_null());
        assert_eq!(value["backup_id"], "def-1");
    }
}
