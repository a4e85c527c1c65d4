//! Dual-sided, append-only audit trail (§4.5).

use std::fs::{self, OpenOptions};
use std::io::{BufRead, Write as _};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::time;

/// Recommended size cap before truncation-from-head kicks in (≈10 MiB).
pub const DEFAULT_CAP_BYTES: u64 = 10 * 1024 * 1024;

/// One protocol event, per the fixed kind/field table in §4.5.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AuditEvent<'a> {
    /// Guest: a request was enqueued.
    Submit { cid: &'a str, bytes_in: usize },
    /// Control: a pending request was fetched.
    Recv {
        cid: &'a str,
        domain: &'a str,
        bytes_in: usize,
    },
    /// Control: HMAC verification succeeded.
    AuthOk { cid: &'a str, domain: &'a str },
    /// Control: HMAC verification failed.
    AuthFail { cid: &'a str, domain: &'a str },
    /// Control: no key on file for the domain.
    AuthDeny { cid: &'a str, domain: &'a str },
    /// Control: the command began executing.
    Exec {
        cid: &'a str,
        domain: &'a str,
        cmd_preview: &'a str,
    },
    /// Control: the command finished.
    Done {
        cid: &'a str,
        domain: &'a str,
        exit_code: i32,
        duration_ms: u64,
        truncated_out: bool,
        truncated_err: bool,
    },
    /// Control: the command hit the wall-clock timeout.
    Timeout {
        cid: &'a str,
        domain: &'a str,
        duration_ms: u64,
    },
    /// Either side: a non-protocol failure occurred.
    Error {
        cid: Option<&'a str>,
        domain: Option<&'a str>,
        reason: &'a str,
    },
    /// Guest: a result bundle was observed and consumed.
    Result {
        cid: &'a str,
        exit_code: i32,
        duration_ms: u64,
    },
}

impl AuditEvent<'_> {
    /// Truncates `s` to at most 120 bytes on a char boundary, and strips
    /// newlines so the line-oriented log format cannot be corrupted.
    #[must_use]
    pub fn sanitize_preview(raw: &str) -> String {
        let single_line: String = raw.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }).collect();
        let mut end = single_line.len().min(120);
        while end > 0 && !single_line.is_char_boundary(end) {
            end -= 1;
        }
        single_line[..end].to_owned()
    }

    fn render(&self) -> String {
        match *self {
            Self::Submit { cid, bytes_in } => {
                format!("SUBMIT cid={cid} bytes_in={bytes_in}")
            }
            Self::Recv {
                cid,
                domain,
                bytes_in,
            } => format!("RECV cid={cid} domain={domain} bytes_in={bytes_in}"),
            Self::AuthOk { cid, domain } => format!("AUTH-OK cid={cid} domain={domain}"),
            Self::AuthFail { cid, domain } => format!("AUTH-FAIL cid={cid} domain={domain}"),
            Self::AuthDeny { cid, domain } => format!("AUTH-DENY cid={cid} domain={domain}"),
            Self::Exec {
                cid,
                domain,
                cmd_preview,
            } => format!("EXEC cid={cid} domain={domain} cmd_preview={cmd_preview:?}"),
            Self::Done {
                cid,
                domain,
                exit_code,
                duration_ms,
                truncated_out,
                truncated_err,
            } => format!(
                "DONE cid={cid} domain={domain} exit_code={exit_code} duration_ms={duration_ms} truncated_out={} truncated_err={}",
                i32::from(truncated_out),
                i32::from(truncated_err)
            ),
            Self::Timeout {
                cid,
                domain,
                duration_ms,
            } => format!("TIMEOUT cid={cid} domain={domain} duration_ms={duration_ms}"),
            Self::Error { cid, domain, reason } => format!(
                "ERROR cid={} domain={} reason={reason:?}",
                cid.unwrap_or("-"),
                domain.unwrap_or("-")
            ),
            Self::Result {
                cid,
                exit_code,
                duration_ms,
            } => format!("RESULT cid={cid} exit_code={exit_code} duration_ms={duration_ms}"),
        }
    }
}

/// An append-only, line-oriented audit log with eager truncation-from-head.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    cap_bytes: u64,
}

impl AuditLog {
    /// Opens (creating if absent) an audit log at `path`, mode `0600`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_cap(path, DEFAULT_CAP_BYTES)
    }

    /// Opens with an explicit size cap, primarily for tests.
    pub fn open_with_cap(path: impl Into<PathBuf>, cap_bytes: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("create audit log directory", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io("open audit log", e))?;
        drop(file);
        set_file_mode(&path)?;
        Ok(Self { path, cap_bytes })
    }

    /// Appends one event, prefixed with an ISO-8601 timestamp.
    pub fn append(&self, event: &AuditEvent<'_>) -> Result<()> {
        self.rotate_if_needed()?;
        let line = format!("{} {}\n", time::iso8601_now(), event.render());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io("append audit log", e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| Error::io("append audit log", e))
    }

    /// Returns the last `n` lines, most-recent last (tail semantics).
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("read audit log", e)),
        };
        let lines: Vec<String> = std::io::BufReader::new(file)
            .lines()
            .collect::<std::io::Result<_>>()
            .map_err(|e| Error::io("read audit log", e))?;
        let start = lines.len().saturating_sub(n);
        Ok(lines[start..].to_vec())
    }

    /// If the log exceeds `cap_bytes`, keeps roughly the newest half.
    fn rotate_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::io("stat audit log", e)),
        };
        if size <= self.cap_bytes {
            return Ok(());
        }
        let raw = fs::read_to_string(&self.path).map_err(|e| Error::io("read audit log", e))?;
        let lines: Vec<&str> = raw.lines().collect();
        let keep_from = lines.len() / 2;
        let kept = lines[keep_from..].join("\n") + "\n";
        fs::write(&self.path, kept).map_err(|e| Error::io("rotate audit log", e))
    }
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::io("set audit log permissions", e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}
