use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::utils::errors::EngineError;

/// How the source tree is rendered at the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    /// gzip-compressed tar, written as `<dest>/backup.tar`
    Tar,
    /// deflate zip, written as `<dest>/backup.zip`
    Zip,
    /// verbatim mirror of the tree under `<dest>`
    Raw,
}

impl ArchiveFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Raw => "raw",
        }
    }

    /// File name of the single artifact, `None` for raw mirrors.
    pub fn artifact_name(&self) -> Option<&'static str> {
        match self {
            ArchiveFormat::Tar => Some("backup.tar"),
            ArchiveFormat::Zip => Some("backup.zip"),
            ArchiveFormat::Raw => None,
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tar" => Ok(ArchiveFormat::Tar),
            "zip" => Ok(ArchiveFormat::Zip),
            "raw" => Ok(ArchiveFormat::Raw),
            other => Err(EngineError::Validation(format!(
                "Unsupported archive format: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefinitionStatus::Pending => "pending",
            DefinitionStatus::Running => "running",
            DefinitionStatus::Completed => "completed",
            DefinitionStatus::Failed => "failed",
        }
    }
}

impl FromStr for DefinitionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DefinitionStatus::Pending),
            "running" => Ok(DefinitionStatus::Running),
            "completed" => Ok(DefinitionStatus::Completed),
            "failed" => Ok(DefinitionStatus::Failed),
            other => Err(EngineError::Validation(format!(
                "Unknown backup status: {}",
                other
            ))),
        }
    }
}

/// A declarative backup: what to copy, where, in which format, to which hosts.
///
/// The engine treats the descriptive fields as read-only during a run and
/// writes back only the derived ones (status, size, checksum, timestamps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDefinition {
    pub id: String,
    pub name: String,
    pub source: String,
    pub destination: String,
    #[serde(rename = "file_type")]
    pub format: ArchiveFormat,
    #[serde(rename = "server_ids")]
    pub host_ids: Vec<String>,
    /// Declared execution type (e.g. "full"); informational only
    #[serde(rename = "type")]
    pub execution_type: String,
    pub status: DefinitionStatus,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_sec: u64,
    pub executed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupDefinition {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        format: ArchiveFormat,
        host_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            source: source.into(),
            destination: destination.into(),
            format,
            host_ids,
            execution_type: "full".to_string(),
            status: DefinitionStatus::Pending,
            size_bytes: 0,
            checksum: None,
            started_at: None,
            completed_at: None,
            duration_sec: 0,
            executed_by: None,
            created_at: now,
            updated_at: now,
        }
    }
}
