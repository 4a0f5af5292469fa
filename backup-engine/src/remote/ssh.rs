//! Pre-flight checks for remote targets.
//!
//! Everything here runs before any data moves: credential completeness, the
//! key file, a bounded TCP connect and a public-key SSH login that is closed
//! straight away.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::models::TargetHost;
use crate::utils::errors::{EngineError, Result};

/// Validated connection details of a remote target.
#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub host: String,
    pub user: String,
    pub key_path: PathBuf,
    pub port: u16,
}

impl SshCredentials {
    /// Extract credentials, failing when any field is missing or empty.
    pub fn from_host(target: &TargetHost) -> Result<Self> {
        let user = target.ssh_user.as_deref().map(str::trim).unwrap_or_default();
        let key = target.ssh_key_path.as_deref().map(str::trim).unwrap_or_default();
        let port = target.ssh_port.unwrap_or(0);

        let mut missing = Vec::new();
        if target.host.trim().is_empty() {
            missing.push("host");
        }
        if user.is_empty() {
            missing.push("user");
        }
        if key.is_empty() {
            missing.push("key path");
        }
        if port == 0 {
            missing.push("port");
        }
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "SSH configuration incomplete for {}: missing {}",
                target.label(),
                missing.join(", ")
            )));
        }

        Ok(Self {
            host: target.host.trim().to_string(),
            user: user.to_string(),
            key_path: PathBuf::from(key),
            port,
        })
    }

    /// `user@host:path` as rsync expects it.
    pub fn remote_spec(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, path)
    }
}

/// Run every pre-flight check for `target`.
pub fn validate_remote(target: &TargetHost, config: &EngineConfig) -> Result<SshCredentials> {
    let creds = SshCredentials::from_host(target)?;

    if !creds.key_path.is_file() {
        return Err(EngineError::Validation(format!(
            "SSH key not found for {}: {}",
            target.label(),
            creds.key_path.display()
        )));
    }

    let timeout = config.connect_timeout();
    let stream = connect(&creds.host, creds.port, timeout).map_err(|e| {
        let reason = diagnose_unreachable(&creds.host, creds.port, &config.probe_ports, timeout)
            .unwrap_or_else(|| format!("host unreachable ({})", e));
        EngineError::Connectivity(format!(
            "cannot connect to remote server {}: {}",
            creds.host, reason
        ))
    })?;

    check_login(&creds, stream, timeout)?;
    info!(host = %creds.host, port = creds.port, user = %creds.user, "Remote target validated");
    Ok(creds)
}

fn resolve(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    Ok((host, port).to_socket_addrs()?.collect())
}

/// TCP connect with a bounded timeout, trying every resolved address.
fn connect(host: &str, port: u16, timeout: Duration) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in resolve(host, port)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {}", host))
    }))
}

/// When the SSH port refuses, see whether anything else answers.
fn diagnose_unreachable(host: &str, ssh_port: u16, probe_ports: &[u16], timeout: Duration) -> Option<String> {
    for &port in probe_ports.iter().filter(|&&p| p != ssh_port) {
        if connect(host, port, timeout).is_ok() {
            debug!(host = %host, port, "Probe port answered");
            return Some(format!("host is up but SSH port {} is closed", ssh_port));
        }
    }
    None
}

/// Handshake and authenticate with the private key, then hang up.
fn check_login(creds: &SshCredentials, stream: TcpStream, timeout: Duration) -> Result<()> {
    let auth_failed = |e: ssh2::Error| {
        EngineError::Connectivity(format!(
            "SSH authentication failed for {}@{}:{}: {}",
            creds.user, creds.host, creds.port, e
        ))
    };

    let mut sess = ssh2::Session::new().map_err(auth_failed)?;
    sess.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    sess.set_tcp_stream(stream);
    sess.handshake().map_err(auth_failed)?;
    sess.userauth_pubkey_file(&creds.user, None, &creds.key_path, None)
        .map_err(auth_failed)?;

    if !sess.authenticated() {
        return Err(EngineError::Connectivity(format!(
            "SSH authentication failed for {}@{}:{}",
            creds.user, creds.host, creds.port
        )));
    }

    let _ = sess.disconnect(None, "pre-flight check", None);
    Ok(())
}
