//! `submit(command, timeout)` — enqueue a request and await its result.

use std::fs;
use std::io::Write as _;
use std::time::{Duration, Instant};

use qvm_remote_proto::{AuditEvent, AuditLog, Cid, Error, Key, Result, ResultMeta};

use crate::history::archive;
use crate::layout::Layout;

/// Maximum command body size (§4.1): 1 MiB.
pub const MAX_CMD_BYTES: usize = 1024 * 1024;

/// Poll interval while waiting for a result (§4.1 nominal 200 ms).
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default submission timeout in seconds (§4.1).
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Outcome of a submission: what the caller should replay and exit with.
pub struct Outcome {
    /// Raw stdout bytes to write to our own stdout.
    pub stdout: Vec<u8>,
    /// Raw stderr bytes to write to our own stderr.
    pub stderr: Vec<u8>,
    /// Exit code to terminate this process with.
    pub exit_code: i32,
}

/// Validates a command body per §4.1's input constraints.
pub fn validate_command(command: &[u8]) -> Result<()> {
    if command.len() > MAX_CMD_BYTES {
        return Err(Error::InvalidInput(format!(
            "command exceeds the {MAX_CMD_BYTES} byte limit"
        )));
    }
    let trimmed_empty = command.iter().all(u8::is_ascii_whitespace);
    if command.is_empty() || trimmed_empty {
        return Err(Error::InvalidInput(
            "command is empty after trimming whitespace".to_owned(),
        ));
    }
    if command.contains(&0) {
        return Err(Error::InvalidInput(
            "command contains a NUL byte".to_owned(),
        ));
    }
    if command
        .iter()
        .any(|&b| b.is_ascii_control() && !matches!(b, b'\t' | b'\n' | b'\r'))
    {
        return Err(Error::InvalidInput(
            "command contains a disallowed control character".to_owned(),
        ));
    }
    Ok(())
}

/// Submits `command`, waits up to `timeout` for a result, and returns what
/// to replay to the caller. Never returns an error after the request has
/// been durably enqueued; a timeout is reported via [`Outcome`], not `Err`.
pub fn submit(layout: &Layout, key: &Key, command: &[u8], timeout: Duration) -> Result<Outcome> {
    validate_command(command)?;
    let audit = AuditLog::open(layout.audit_log_path())?;

    let cid = Cid::generate();
    let tau = key.sign(cid.as_str());
    write_pending(layout, &cid, &tau, command)?;
    audit.append(&AuditEvent::Submit {
        cid: cid.as_str(),
        bytes_in: command.len(),
    })?;

    let (outcome, meta) = poll_for_result(layout, &cid, command, timeout)?;

    if let Some(meta) = meta {
        audit.append(&AuditEvent::Result {
            cid: cid.as_str(),
            exit_code: outcome.exit_code,
            duration_ms: meta.duration_ms,
        })?;
    }
    Ok(outcome)
}

/// Write ordering: `.auth` first, command body last (§4.1) — the daemon
/// only acts on a `cid` whose `.auth` sibling already exists.
fn write_pending(layout: &Layout, cid: &Cid, tau: &str, command: &[u8]) -> Result<()> {
    let pending = layout.pending_dir();
    let auth_path = pending.join(format!("{cid}.auth"));
    let body_path = pending.join(cid.as_str());

    write_mode_0600(&auth_path, tau.as_bytes())?;
    write_mode_0600(&body_path, command)?;
    Ok(())
}

fn poll_for_result(
    layout: &Layout,
    cid: &Cid,
    command: &[u8],
    timeout: Duration,
) -> Result<(Outcome, Option<ResultMeta>)> {
    let results = layout.results_dir();
    let exit_path = results.join(format!("{cid}.exit"));
    let deadline = Instant::now() + timeout;

    loop {
        if exit_path.is_file() {
            let (outcome, meta) = read_and_clean_result(layout, cid, command)?;
            return Ok((outcome, Some(meta)));
        }
        if Instant::now() >= deadline {
            cleanup_pending_on_timeout(layout, cid);
            let outcome = Outcome {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: Error::Timeout.exit_code(),
            };
            return Ok((outcome, None));
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Best-effort removal of our own pending pair after abandoning the poll —
/// the daemon may still race us and write results anyway; that is fine,
/// a later invocation or a GC sweep cleans them up (§5 cancellation note).
fn cleanup_pending_on_timeout(layout: &Layout, cid: &Cid) {
    let pending = layout.pending_dir();
    let _ = fs::remove_file(pending.join(format!("{cid}.auth")));
    let _ = fs::remove_file(pending.join(cid.as_str()));
}

fn read_and_clean_result(layout: &Layout, cid: &Cid, command: &[u8]) -> Result<(Outcome, ResultMeta)> {
    let results = layout.results_dir();
    let out_path = results.join(format!("{cid}.out"));
    let err_path = results.join(format!("{cid}.err"));
    let exit_path = results.join(format!("{cid}.exit"));
    let meta_path = results.join(format!("{cid}.meta"));

    let stdout = fs::read(&out_path).unwrap_or_default();
    let stderr = fs::read(&err_path).unwrap_or_default();
    let exit_raw = fs::read_to_string(&exit_path).map_err(|e| Error::io("read .exit", e))?;
    let exit_code: i32 = exit_raw
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput("malformed .exit contents".to_owned()))?;
    let meta_raw = fs::read_to_string(&meta_path).unwrap_or_default();
    let meta = ResultMeta::decode(&meta_raw);

    archive(layout, cid, Some(command), &stdout, &stderr, &meta)?;

    for path in [&out_path, &err_path, &exit_path, &meta_path] {
        let _ = fs::remove_file(path);
    }

    Ok((
        Outcome {
            stdout,
            stderr,
            exit_code,
        },
        meta,
    ))
}

fn write_mode_0600(path: &std::path::Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::io("write queue entry", e))?;
    file.write_all(contents)
        .map_err(|e| Error::io("write queue entry", e))?;
    set_mode_0600(path)
}

#[cfg(unix)]
fn set_mode_0600(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::io("set queue entry permissions", e))
}

#[cfg(not(unix))]
fn set_mode_0600(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_command() {
        let big = vec![b'a'; MAX_CMD_BYTES + 1];
        assert!(validate_command(&big).is_err());
    }

    #[test]
    fn rejects_empty_and_whitespace_only() {
        assert!(validate_command(b"").is_err());
        assert!(validate_command(b"   \t\n").is_err());
    }

    #[test]
    fn rejects_nul_byte() {
        assert!(validate_command(b"echo\0hi").is_err());
    }

    #[test]
    fn rejects_other_control_characters() {
        assert!(validate_command(b"echo\x07hi").is_err());
    }

    #[test]
    fn accepts_tab_newline_and_cr() {
        assert!(validate_command(b"echo hi\t\n\r").is_ok());
    }

    #[test]
    fn enqueues_with_auth_before_body() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::resolve_under(dir.path()).unwrap();
        let key = Key::generate();
        let cid = Cid::generate();
        let tau = key.sign(cid.as_str());
        write_pending(&layout, &cid, &tau, b"echo hi").unwrap();

        assert!(layout.pending_dir().join(format!("{cid}.auth")).is_file());
        assert!(layout.pending_dir().join(cid.as_str()).is_file());
    }

    #[test]
    fn timeout_cleans_up_pending_pair() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::resolve_under(dir.path()).unwrap();
        let key = Key::generate();
        let outcome = submit(&layout, &key, b"echo hi", Duration::from_millis(250)).unwrap();
        assert_eq!(outcome.exit_code, 124);
        assert!(layout.pending_dir().read_dir().unwrap().next().is_none());
    }
}
