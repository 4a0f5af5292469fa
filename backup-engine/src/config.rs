//! Configuration for the backup engine.
//!
//! Loads from a TOML file; every field has a default so a partial file
//! (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// A `running` run-state older than this is presumed orphaned by a crash
    pub stale_after_secs: u64,

    /// Emit a progress update after this many new bytes (default: 1 MiB)
    pub progress_bytes_step: u64,

    /// ...or after this much wall-clock time, whichever comes first
    pub progress_interval_ms: u64,

    /// Timeout for pre-flight TCP probes and the SSH handshake
    pub connect_timeout_secs: u64,

    /// Ports tried to tell "host down" from "SSH port closed"
    pub probe_ports: Vec<u16>,

    /// Delta-transfer utility, resolved on PATH unless absolute
    pub rsync_binary: String,

    /// Remote shell handed to rsync via `-e`
    pub ssh_binary: String,

    /// Where remote tar/zip runs stage their artifact (None = system temp)
    pub temp_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60,
            progress_bytes_step: 1024 * 1024,
            progress_interval_ms: 1000,
            connect_timeout_secs: 5,
            probe_ports: vec![22, 80, 443],
            rsync_binary: "rsync".to_string(),
            ssh_binary: "ssh".to_string(),
            temp_dir: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
