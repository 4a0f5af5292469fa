//! Error taxonomy for the backup engine.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad or missing inputs, reported before any data moves.
    #[error("{0}")]
    Validation(String),

    /// Unreachable host or failed credentialed handshake.
    #[error("{0}")]
    Connectivity(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit or broken pipe from the transfer subprocess.
    #[error("{0}")]
    Transfer(String),

    /// A `running` record nobody is updating anymore. Never surfaced to callers.
    #[error("stale run state: {0}")]
    StaleState(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps an I/O error with the path it happened on.
    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        EngineError::io(format!("{} {}", action, path.display()), source)
    }

    /// Stable tag recorded in audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Connectivity(_) => "connectivity",
            EngineError::Io { .. } => "io",
            EngineError::Transfer(_) => "transfer",
            EngineError::StaleState(_) => "stale_state",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyRunning(_) => "already_running",
            EngineError::Store(_) => "store",
        }
    }
}

/// Extension for attaching a path to raw `io::Result`s.
pub trait IoContext<T> {
    fn at_path(self, action: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at_path(self, action: &str, path: &Path) -> Result<T> {
        self.map_err(|e| EngineError::io_at(action, path, e))
    }
}

impl From<walkdir::Error> for EngineError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(Path::to_path_buf).unwrap_or_else(PathBuf::new);
        let source = err
            .into_io_error()
            .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
        EngineError::io_at("failed to walk", &path, source)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
