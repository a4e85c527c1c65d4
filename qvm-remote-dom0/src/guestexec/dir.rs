//! Filesystem-backed [`super::GuestExec`] stand-in, used by the test suite
//! and by local operator verification (`--dry-run` rehearsal).
//!
//! Each "domain" maps to a directory on the same machine; `shell_command` is
//! executed locally with `HOME` pointed at that directory, so the embedded
//! scripts' `~/.qvm-remote/...` paths resolve exactly as they would inside a
//! real guest.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::GuestExec;

/// A scratch tree of per-domain home directories.
#[derive(Debug)]
pub struct DirPrimitive {
    root: PathBuf,
    down: Mutex<HashSet<String>>,
}

impl DirPrimitive {
    /// Opens (creating if absent) a `DirPrimitive` rooted at `root`; every
    /// domain starts out running.
    #[must_use]
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            down: Mutex::new(HashSet::new()),
        }
    }

    /// The guest-equivalent home directory for `domain`.
    #[must_use]
    pub fn domain_home(&self, domain: &str) -> PathBuf {
        self.root.join(domain)
    }

    /// Marks `domain` as halted (or running again), for tests that exercise
    /// the executor's "omit non-running domains" behaviour.
    pub fn set_running(&self, domain: &str, running: bool) {
        let mut down = self.down.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if running {
            down.remove(domain);
        } else {
            down.insert(domain.to_owned());
        }
    }
}

#[async_trait]
impl GuestExec for DirPrimitive {
    async fn is_running(&self, domain: &str) -> io::Result<bool> {
        let down = self.down.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(!down.contains(domain))
    }

    async fn run(
        &self,
        domain: &str,
        shell_command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> io::Result<(Vec<u8>, i32)> {
        let home = self.domain_home(domain);
        std::fs::create_dir_all(&home)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(shell_command)
            .env_clear()
            .env("HOME", &home)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(data) = stdin {
            if let Some(mut child_stdin) = child.stdin.take() {
                child_stdin.write_all(data).await?;
            }
        } else {
            child.stdin.take();
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "guest-exec primitive timed out"))??;

        Ok((output.stdout, output.status.code().unwrap_or(-1)))
    }
}

/// Convenience helper for tests: the guest-side queue root for `domain`.
#[must_use]
pub fn queue_root(home: &Path) -> PathBuf {
    home.join(".qvm-remote")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_executes_in_domain_home() {
        let dir = tempfile::tempdir().unwrap();
        let primitive = DirPrimitive::open(dir.path());
        let (out, code) = primitive
            .run("vm1", "echo -n \"$HOME\"", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(out, primitive.domain_home("vm1").as_os_str().as_encoded_bytes());
    }

    #[tokio::test]
    async fn is_running_reflects_set_running() {
        let dir = tempfile::tempdir().unwrap();
        let primitive = DirPrimitive::open(dir.path());
        assert!(primitive.is_running("vm1").await.unwrap());
        primitive.set_running("vm1", false);
        assert!(!primitive.is_running("vm1").await.unwrap());
    }
}
