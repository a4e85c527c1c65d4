//! Production [`super::GuestExec`]: shells out to the platform's domain-exec
//! binary, the way the teacher's `bux::jail` shells out to `bwrap`.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::GuestExec;

/// Shells out to a configurable `qrexec-client-vm`-equivalent binary.
#[derive(Debug, Clone)]
pub struct QrexecPrimitive {
    exec_binary: String,
    running_binary: String,
}

impl Default for QrexecPrimitive {
    fn default() -> Self {
        Self {
            exec_binary: "qrexec-client-vm".to_owned(),
            running_binary: "qvm-check".to_owned(),
        }
    }
}

impl QrexecPrimitive {
    /// Builds a primitive with explicit binary paths, for deployments that
    /// do not have them on `PATH`.
    #[must_use]
    pub fn with_binaries(exec_binary: impl Into<String>, running_binary: impl Into<String>) -> Self {
        Self {
            exec_binary: exec_binary.into(),
            running_binary: running_binary.into(),
        }
    }
}

#[async_trait]
impl GuestExec for QrexecPrimitive {
    async fn is_running(&self, domain: &str) -> io::Result<bool> {
        let status = Command::new(&self.running_binary)
            .arg("--running")
            .arg(domain)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }

    async fn run(
        &self,
        domain: &str,
        shell_command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> io::Result<(Vec<u8>, i32)> {
        let mut child = Command::new(&self.exec_binary)
            .arg(domain)
            .arg("qubes.RemoteExec")
            .arg(shell_command)
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
