//! rsync subprocess driver and its `--info=progress2` line parser.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, warn};

use super::ssh::SshCredentials;
use crate::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};

/// One parsed progress line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSample {
    pub bytes: u64,
    pub percent: u8,
    pub speed_bps: u64,
    pub eta_seconds: Option<u64>,
}

/// Parse a line shaped like `1,238,099  42%  146.38kB/s  0:00:08 ...`.
///
/// The four fields may appear anywhere in the line; anything else around
/// them is ignored. Rates use 1024-based multipliers.
pub fn parse_progress_line(line: &str) -> Option<TransferSample> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    tokens.windows(4).find_map(|w| {
        Some(TransferSample {
            bytes: parse_bytes(w[0])?,
            percent: parse_percent(w[1])?,
            speed_bps: parse_rate(w[2])?,
            eta_seconds: Some(parse_eta(w[3])?),
        })
    })
}

fn parse_bytes(token: &str) -> Option<u64> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit() || c == ',') {
        return None;
    }
    token.replace(',', "").parse().ok()
}

fn parse_percent(token: &str) -> Option<u8> {
    let pct: u16 = token.strip_suffix('%')?.parse().ok()?;
    Some(pct.min(100) as u8)
}

fn parse_rate(token: &str) -> Option<u64> {
    const UNITS: [(&str, u64); 5] = [
        ("GB/s", 1024 * 1024 * 1024),
        ("MB/s", 1024 * 1024),
        ("kB/s", 1024),
        ("KB/s", 1024),
        ("B/s", 1),
    ];
    UNITS.iter().find_map(|(suffix, multiplier)| {
        let value: f64 = token.strip_suffix(suffix)?.parse().ok()?;
        (value >= 0.0).then(|| (value * *multiplier as f64) as u64)
    })
}

fn parse_eta(token: &str) -> Option<u64> {
    let mut parts = token.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Locate `binary` on PATH. Paths with a separator are checked as given.
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|full| full.is_file())
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// An rsync push from a local path to a remote one over SSH.
pub struct RsyncTransfer {
    binary: String,
    args: Vec<String>,
}

impl RsyncTransfer {
    pub fn new(config: &EngineConfig, creds: &SshCredentials, source: &str, destination: &str) -> Self {
        let remote_shell = format!(
            "{} -i '{}' -p {} -o StrictHostKeyChecking=no -o BatchMode=yes",
            config.ssh_binary,
            creds.key_path.display(),
            creds.port
        );
        Self {
            binary: config.rsync_binary.clone(),
            args: vec![
                "-az".to_string(),
                "--info=progress2".to_string(),
                "-e".to_string(),
                remote_shell,
                source.to_string(),
                creds.remote_spec(destination),
            ],
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Run to completion, handing every output line to `on_line` in arrival
    /// order. A non-zero exit is a transfer error carrying the last stderr
    /// line. If `on_line` fails the process is killed.
    pub fn run<F>(&self, on_line: F) -> Result<()>
    where
        F: FnMut(OutputStream, &str) -> Result<()>,
    {
        run_streaming(OsStr::new(&self.binary), &self.args, on_line)
    }
}

pub(crate) fn run_streaming<F>(program: &OsStr, args: &[String], mut on_line: F) -> Result<()>
where
    F: FnMut(OutputStream, &str) -> Result<()>,
{
    debug!(program = ?program, args = ?args, "Spawning transfer process");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::io(format!("failed to start {}", program.to_string_lossy()), e))?;

    let (tx, rx) = mpsc::channel();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump_lines(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump_lines(stderr, OutputStream::Stderr, tx.clone()));
    }
    drop(tx);

    let mut last_stderr = None;
    let mut callback_error = None;
    for (stream, line) in rx {
        if stream == OutputStream::Stderr {
            last_stderr = Some(line.clone());
        }
        if callback_error.is_none() {
            if let Err(e) = on_line(stream, &line) {
                warn!(error = %e, "Aborting transfer process");
                let _ = child.kill();
                callback_error = Some(e);
            }
        }
    }

    for pump in pumps {
        let _ = pump.join();
    }
    let status = child
        .wait()
        .map_err(|e| EngineError::io("failed to wait for transfer process", e))?;

    if let Some(e) = callback_error {
        return Err(e);
    }
    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = last_stderr.map(|l| format!(": {}", l)).unwrap_or_default();
        return Err(EngineError::Transfer(format!(
            "{} exited with status {}{}",
            Path::new(program).display(),
            code,
            detail
        )));
    }
    Ok(())
}

/// Read `reader` to EOF, sending each non-empty line. Both `\r` and `\n`
/// end a line since progress meters rewrite in place.
fn pump_lines<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        let mut line = Vec::new();
        let flush = |line: &mut Vec<u8>| {
            let text = String::from_utf8_lossy(line).trim().to_string();
            line.clear();
            if text.is_empty() {
                return true;
            }
            tx.send((stream, text)).is_ok()
        };

        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &b in &chunk[..n] {
                if b == b'\r' || b == b'\n' {
                    if !flush(&mut line) {
                        return;
                    }
                } else {
                    line.push(b);
                }
            }
        }
        flush(&mut line);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress2_line() {
        let sample = parse_progress_line("      1,238,099  42%  146.38kB/s    0:00:08 (xfr#5, to-chk=169/396)").unwrap();
        assert_eq!(sample.bytes, 1_238_099);
        assert_eq!(sample.percent, 42);
        assert_eq!(sample.speed_bps, (146.38 * 1024.0) as u64);
        assert_eq!(sample.eta_seconds, Some(8));
    }

    #[test]
    fn test_parse_rate_units() {
        let line = |rate: &str| format!("100 1% {} 1:02:03", rate);
        assert_eq!(parse_progress_line(&line("10.00B/s")).unwrap().speed_bps, 10);
        assert_eq!(parse_progress_line(&line("2.00KB/s")).unwrap().speed_bps, 2048);
        assert_eq!(parse_progress_line(&line("1.50MB/s")).unwrap().speed_bps, 1_572_864);
        assert_eq!(parse_progress_line(&line("1.00GB/s")).unwrap().speed_bps, 1 << 30);
        assert_eq!(parse_progress_line(&line("1.00GB/s")).unwrap().eta_seconds, Some(3723));
    }

    #[test]
    fn test_non_progress_lines_are_ignored() {
        assert!(parse_progress_line("sending incremental file list").is_none());
        assert!(parse_progress_line("rsync error: some files could not be transferred").is_none());
        assert!(parse_progress_line("100 42% fast 0:00:01").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
        assert!(find_in_path("/bin/definitely-not-here").is_none());
    }

    #[test]
    fn test_rsync_arguments() {
        let creds = SshCredentials {
            host: "nas".into(),
            user: "bk".into(),
            key_path: PathBuf::from("/keys/id_ed25519"),
            port: 2222,
        };
        let transfer = RsyncTransfer::new(&EngineConfig::default(), &creds, "/data/.", "/srv/backup");
        assert_eq!(
            transfer.args(),
            &[
                "-az",
                "--info=progress2",
                "-e",
                "ssh -i '/keys/id_ed25519' -p 2222 -o StrictHostKeyChecking=no -o BatchMode=yes",
                "/data/.",
                "bk@nas:/srv/backup",
            ]
        );
    }

    #[test]
    fn test_streaming_splits_carriage_returns() -> anyhow::Result<()> {
        let mut lines = Vec::new();
        run_streaming(
            OsStr::new("sh"),
            &["-c".to_string(), "printf 'a\\rb\\nc'; printf 'err\\n' >&2".to_string()],
            |stream, line| {
                lines.push((stream, line.to_string()));
                Ok(())
            },
        )?;

        let stdout: Vec<&str> = lines
            .iter()
            .filter(|(s, _)| *s == OutputStream::Stdout)
            .map(|(_, l)| l.as_str())
            .collect();
        assert_eq!(stdout, vec!["a", "b", "c"]);
        assert!(lines.contains(&(OutputStream::Stderr, "err".to_string())));
        Ok(())
    }

    #[test]
    fn test_nonzero_exit_carries_last_stderr_line() {
        let err = run_streaming(
            OsStr::new("sh"),
            &["-c".to_string(), "echo 'rsync: connection unexpectedly closed' >&2; exit 12".to_string()],
            |_, _| Ok(()),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "transfer");
        let msg = err.to_string();
        assert!(msg.contains("status 12"));
        assert!(msg.contains("connection unexpectedly closed"));
    }
}
