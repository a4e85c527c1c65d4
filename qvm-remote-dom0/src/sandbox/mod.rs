//! Execution sandbox (§4.3): turns a validated command body into a
//! bounded, observable local child process.

mod pre_exec;

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use qvm_remote_proto::meta::{EXIT_EXEC_ERROR, EXIT_TIMEOUT};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Per-stream output cap (§4.3 step 4, default 10 MiB).
pub const DEFAULT_MAX_OUT_BYTES: usize = 10 * 1024 * 1024;
/// Wall-clock execution timeout (§4.3 step 5, default 300 s).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// Captured stdout, possibly truncated.
    pub stdout: Vec<u8>,
    /// Captured stderr, possibly truncated.
    pub stderr: Vec<u8>,
    /// Process exit code, or a timeout/exec-error sentinel.
    pub exit_code: i32,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// Set when `stdout` hit [`DEFAULT_MAX_OUT_BYTES`].
    pub truncated_out: bool,
    /// Set when `stderr` hit [`DEFAULT_MAX_OUT_BYTES`].
    pub truncated_err: bool,
    /// Set when the wall-clock timeout fired.
    pub timeout: bool,
}

/// Executes `body` as a shell script inside a freshly allocated, mode-`0700`
/// temporary directory, enforcing output and wall-clock bounds.
pub async fn execute(body: &[u8], timeout: Duration, max_out_bytes: usize) -> io::Result<SandboxResult> {
    let dir = tempfile::Builder::new()
        .prefix("qvm-remote-")
        .tempdir()
        .map_err(|e| io::Error::other(format!("allocate sandbox directory: {e}")))?;
    set_mode_0700(dir.path())?;

    let script_path = dir.path().join("cmd");
    tokio::fs::write(&script_path, body).await?;
    set_mode_0700(&script_path)?;

    let result = run_script(&script_path, dir.path(), timeout, max_out_bytes).await;
    // Directory (and script inside it) removed on every exit path, including
    // the `?` short-circuits above, via `TempDir`'s `Drop`.
    result
}

async fn run_script(
    script_path: &std::path::Path,
    workdir: &std::path::Path,
    timeout: Duration,
    max_out_bytes: usize,
) -> io::Result<SandboxResult> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script_path)
        .current_dir(workdir)
        .env_clear()
        .envs(cleaned_env())
        .env("PWD", workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    pre_exec::apply(&mut cmd);

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let pid = child.id();

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let drain = async {
        let (mut out_buf, mut out_trunc) = (Vec::new(), false);
        let (mut err_buf, mut err_trunc) = (Vec::new(), false);
        let (out_res, err_res) = tokio::join!(
            read_bounded(&mut stdout, &mut out_buf, &mut out_trunc, max_out_bytes),
            read_bounded(&mut stderr, &mut err_buf, &mut err_trunc, max_out_bytes),
        );
        out_res?;
        err_res?;
        io::Result::Ok((out_buf, out_trunc, err_buf, err_trunc))
    };

    match tokio::time::timeout(timeout, async {
        let io_result = drain.await;
        let status = child.wait().await;
        (io_result, status)
    })
    .await
    {
        Ok((io_result, status)) => {
            let (stdout, truncated_out, stderr, truncated_err) = io_result?;
            let status = status?;
            Ok(SandboxResult {
                stdout,
                stderr,
                #[allow(clippy::cast_possible_truncation)]
                exit_code: status.code().unwrap_or(EXIT_EXEC_ERROR),
                duration_ms: elapsed_ms(start),
                truncated_out,
                truncated_err,
                timeout: false,
            })
        }
        Err(_) => {
            if let Some(pid) = pid {
                #[allow(clippy::cast_possible_wrap)]
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
            let _ = child.wait().await;
            Ok(SandboxResult {
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: EXIT_TIMEOUT,
                duration_ms: elapsed_ms(start),
                truncated_out: false,
                truncated_err: false,
                timeout: true,
            })
        }
    }
}

async fn read_bounded(
    stream: &mut (impl tokio::io::AsyncRead + Unpin),
    buf: &mut Vec<u8>,
    truncated: &mut bool,
    cap: usize,
) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        if buf.len() >= cap {
            *truncated = true;
            continue;
        }
        let take = (cap - buf.len()).min(n);
        buf.extend_from_slice(&chunk[..take]);
        if take < n {
            *truncated = true;
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// The cleaned environment retained for the sandboxed child (§4.3 step 3).
fn cleaned_env() -> Vec<(String, String)> {
    ["PATH", "HOME", "USER", "LANG", "TERM"]
        .into_iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_owned(), v)))
        .collect()
}

#[cfg(unix)]
fn set_mode_0700(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn set_mode_0700(_path: &std::path::Path) -> io::Result<()> {
    Ok(())
}

/// Synthesises a result without invoking the shell, for `--dry-run` (§4.2).
#[must_use]
pub fn dry_run(body: &[u8]) -> SandboxResult {
    let preview = String::from_utf8_lossy(body);
    let preview: String = preview.chars().take(200).collect();
    SandboxResult {
        stdout: format!("[dry-run] would execute: {preview}\n").into_bytes(),
        stderr: Vec::new(),
        exit_code: 0,
        duration_ms: 0,
        truncated_out: false,
        truncated_err: false,
        timeout: false,
    }
}

/// Path a temporary sandbox directory would be rooted under, exposed for
/// configuration/diagnostics only.
#[must_use]
pub fn system_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executes_and_captures_stdout() {
        let result = execute(b"echo hello", Duration::from_secs(5), DEFAULT_MAX_OUT_BYTES)
            .await
            .unwrap();
        assert_eq!(result.stdout, b"hello\n");
        assert_eq!(result.exit_code, 0);
        assert!(!result.timeout);
    }

    #[tokio::test]
    async fn truncates_oversized_stdout() {
        let cmd = format!("head -c {} /dev/zero", DEFAULT_MAX_OUT_BYTES + 1);
        let result = execute(cmd.as_bytes(), Duration::from_secs(10), DEFAULT_MAX_OUT_BYTES)
            .await
            .unwrap();
        assert!(result.truncated_out);
        assert_eq!(result.stdout.len(), DEFAULT_MAX_OUT_BYTES);
    }

    #[tokio::test]
    async fn enforces_wall_clock_timeout() {
        let result = execute(b"sleep 5", Duration::from_millis(200), DEFAULT_MAX_OUT_BYTES)
            .await
            .unwrap();
        assert!(result.timeout);
        assert_eq!(result.exit_code, EXIT_TIMEOUT);
    }

    #[test]
    fn dry_run_never_invokes_shell() {
        let result = dry_run(b"echo hi");
        assert!(String::from_utf8_lossy(&result.stdout).starts_with("[dry-run]"));
        assert_eq!(result.exit_code, 0);
    }
}
