use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::utils::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Local,
    Remote,
}

impl HostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostKind::Local => "local",
            HostKind::Remote => "remote",
        }
    }
}

impl FromStr for HostKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(HostKind::Local),
            "remote" => Ok(HostKind::Remote),
            other => Err(EngineError::Validation(format!("Unknown host type: {}", other))),
        }
    }
}

/// A destination a definition runs against. Read-only during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHost {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: HostKind,
    pub host: String,
    pub ssh_user: Option<String>,
    pub ssh_key_path: Option<String>,
    pub ssh_port: Option<u16>,
    pub transfer_type: Option<String>,
}

impl TargetHost {
    pub fn local(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: HostKind::Local,
            host: "localhost".to_string(),
            ssh_user: None,
            ssh_key_path: None,
            ssh_port: None,
            transfer_type: None,
        }
    }

    pub fn remote(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        ssh_user: impl Into<String>,
        ssh_key_path: impl Into<String>,
        ssh_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: HostKind::Remote,
            host: host.into(),
            ssh_user: Some(ssh_user.into()),
            ssh_key_path: Some(ssh_key_path.into()),
            ssh_port: Some(ssh_port),
            transfer_type: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.kind == HostKind::Remote
    }

    /// Label used in status messages: the name, falling back to the address.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.host
        } else {
            &self.name
        }
    }
}
