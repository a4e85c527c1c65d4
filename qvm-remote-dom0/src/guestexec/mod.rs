//! The guest-exec primitive contract and the higher-level guest filesystem
//! operations built on top of it (§6).

mod dir;
mod qrexec;

pub use dir::DirPrimitive;
pub use qrexec::QrexecPrimitive;

use std::io;
use std::time::Duration;

use async_trait::async_trait;

/// Timeout budget for `list_pending` (§5 suspension points).
pub const LIST_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout budget for fetching a single file.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout budget for writing back a result bundle.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// The host-initiated, stream-passing exec primitive the platform supplies.
///
/// This is the only cross-domain operation the core uses: every guest
/// filesystem interaction (list/fetch/write/unlink) is expressed as one or
/// more calls to [`GuestExec::run`] against a small embedded shell script,
/// exactly as `bux::client::Client` layers file operations over a single
/// transport.
#[async_trait]
pub trait GuestExec: Send + Sync {
    /// Host-side query: is domain `d` currently running? Must never start a
    /// halted domain as a side effect.
    async fn is_running(&self, domain: &str) -> io::Result<bool>;

    /// Executes `shell_command` in `domain` as the normal user, streaming
    /// `stdin` in and collecting combined stdio out.
    async fn run(
        &self,
        domain: &str,
        shell_command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> io::Result<(Vec<u8>, i32)>;
}

/// Lists `cid`s with a pending request in `domain`, ignoring `.auth`
/// siblings (§4.2 step 1).
pub async fn list_pending(primitive: &dyn GuestExec, domain: &str) -> io::Result<Vec<String>> {
    let script = "ls -1 ~/.qvm-remote/queue/pending 2>/dev/null || true";
    let (out, _code) = primitive.run(domain, script, None, LIST_TIMEOUT).await?;
    let names = String::from_utf8_lossy(&out);
    Ok(names
        .lines()
        .filter(|name| !name.ends_with(".auth"))
        .map(str::to_owned)
        .collect())
}

/// Fetches one file's raw bytes from a guest's pending queue, or `None` if
/// it is absent.
pub async fn fetch_pending_file(
    primitive: &dyn GuestExec,
    domain: &str,
    name: &str,
) -> io::Result<Option<Vec<u8>>> {
    let escaped = shell_escape(name);
    let script = format!("cat ~/.qvm-remote/queue/pending/{escaped} 2>/dev/null");
    let (out, code) = primitive.run(domain, &script, None, FETCH_TIMEOUT).await?;
    Ok((code == 0).then_some(out))
}

/// Unlinks a `cid`/`cid.auth` pending pair in the guest (§4.2 step 3).
pub async fn unlink_pending(primitive: &dyn GuestExec, domain: &str, cid: &str) -> io::Result<()> {
    let escaped = shell_escape(cid);
    let script =
        format!("rm -f ~/.qvm-remote/queue/pending/{escaped} ~/.qvm-remote/queue/pending/{escaped}.auth");
    primitive.run(domain, &script, None, FETCH_TIMEOUT).await?;
    Ok(())
}

/// Writes back the four result-bundle files, `.exit` last so the submitter's
/// presence-poll on `.exit` cannot observe a half-written bundle (§9).
pub async fn write_result_bundle(
    primitive: &dyn GuestExec,
    domain: &str,
    cid: &str,
    stdout: &[u8],
    stderr: &[u8],
    exit_code: i32,
    meta: &str,
) -> io::Result<()> {
    write_result_file(primitive, domain, cid, "out", stdout).await?;
    write_result_file(primitive, domain, cid, "err", stderr).await?;
    write_result_file(primitive, domain, cid, "meta", meta.as_bytes()).await?;
    write_result_file(primitive, domain, cid, "exit", exit_code.to_string().as_bytes()).await?;
    Ok(())
}

async fn write_result_file(
    primitive: &dyn GuestExec,
    domain: &str,
    cid: &str,
    ext: &str,
    content: &[u8],
) -> io::Result<()> {
    let escaped = shell_escape(cid);
    let script = format!(
        "mkdir -p ~/.qvm-remote/queue/results && cat > ~/.qvm-remote/queue/results/{escaped}.{ext} && chmod 0600 ~/.qvm-remote/queue/results/{escaped}.{ext}"
    );
    primitive.run(domain, &script, Some(content), WRITE_TIMEOUT).await?;
    Ok(())
}

/// Quotes `s` for safe inclusion inside single quotes in a POSIX shell
/// command string embedded in a guest-exec invocation.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_handles_quotes() {
        assert_eq!(shell_escape("abc"), "'abc'");
        assert_eq!(shell_escape("a'b"), "'a'\\''b'");
    }
}
