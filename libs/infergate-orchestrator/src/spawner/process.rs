//! Ownership of a spawned backend child process.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// A backend child process. Created with `kill_on_drop`, so dropping it
/// (for example when a load is abandoned) tears the process down.
pub struct BackendProcess {
    child: Child,
    pid: Option<u32>,
}

impl BackendProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    /// OS pid captured at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already terminated. Errors from the
    /// OS are treated as "exited" with no status.
    pub fn exit_status(&mut self) -> Option<Result<ExitStatus, std::io::Error>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(Ok(status)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }

    pub fn has_exited(&mut self) -> bool {
        self.exit_status().is_some()
    }

    /// Ask the process to stop (SIGTERM on unix) and kill it if it is still
    /// alive after `grace`.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        if !self.request_stop() {
            self.kill().await;
            return;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid = ?self.pid, %status, "backend process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "waiting for backend process failed");
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    grace_ms = grace.as_millis(),
                    "backend process ignored SIGTERM, killing"
                );
                self.kill().await;
            }
        }
    }

    #[cfg(unix)]
    fn request_stop(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        match send_sigterm(pid) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid, error = %e, "SIGTERM failed, falling back to kill");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) -> bool {
        false
    }

    /// Kill immediately and reap.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Already exited and reaped is the usual cause.
            tracing::debug!(pid = ?self.pid, error = %e, "kill of backend process failed");
        }
    }
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("pid", &self.pid)
            .finish()
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
