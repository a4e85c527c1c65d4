//! Pre-exec hardening for the sandboxed shell child.
//!
//! Applied after `fork()` but before `exec()`:
//! 1. **Die with parent** — `PR_SET_PDEATHSIG(SIGKILL)` so a daemon crash
//!    never leaves an orphaned guest-queued command running.
//! 2. **FD cleanup** — close all inherited file descriptors ≥ 3.

use tokio::process::Command;

/// Installs pre-exec hooks on the command. No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn apply(_cmd: &mut Command) {}

/// Installs pre-exec hooks on the command.
#[cfg(unix)]
pub fn apply(cmd: &mut Command) {
    // SAFETY: all operations inside are async-signal-safe syscalls.
    unsafe {
        cmd.pre_exec(|| {
            #[cfg(target_os = "linux")]
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);

            close_inherited_fds();

            Ok(())
        });
    }
}

#[cfg(unix)]
fn close_inherited_fds() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range is an async-signal-safe syscall.
        let ret = unsafe { libc::syscall(libc::SYS_close_range, 3_u32, u32::MAX, 0_u32) };
        if ret == 0 {
            return;
        }
    }

    // SAFETY: sysconf and close are async-signal-safe.
    let max_fd = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    let limit = if max_fd > 0 { max_fd } else { 1024 };
    for fd in 3..limit as i32 {
        unsafe { libc::close(fd) };
    }
}
