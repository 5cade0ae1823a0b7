// Tundev Manager - PID file management
// Ensures only one manager instance owns the kernel state on this host

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// PID file guard - automatically removes the PID file on drop.
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Create the PID file under the manager's runtime directory, failing
    /// when another live manager already owns it.
    pub fn create(runtime_dir: &Path) -> Result<Self> {
        let path = runtime_dir.join("managerd.pid");

        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(pid_str) => {
                    if let Ok(pid) = pid_str.trim().parse::<u32>() {
                        if is_process_running(pid) {
                            anyhow::bail!(
                                "Manager is already running with PID {}. \
                                 Stop it first or remove {} if it is stale.",
                                pid,
                                path.display()
                            );
                        }
                        warn!("Found stale PID file for process {} (not running), removing it", pid);
                        fs::remove_file(&path).context("Failed to remove stale PID file")?;
                    }
                }
                Err(e) => {
                    warn!("Failed to read PID file {}: {}", path.display(), e);
                    let _ = fs::remove_file(&path);
                }
            }
        }

        fs::create_dir_all(runtime_dir).context("Failed to create runtime directory")?;

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;
        info!("Created PID file at {} with PID {}", path.display(), pid);

        Ok(Self { path })
    }
}

/// Probe process existence with a null signal.
fn is_process_running(pid: u32) -> bool {
    unsafe {
        if libc::kill(pid as i32, 0) == 0 {
            return true;
        }
        // EPERM means the process exists but belongs to someone else
        *libc::__errno_location() == libc::EPERM
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(_) => debug!("Removed PID file: {}", self.path.display()),
            Err(e) => warn!("Failed to remove PID file {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_in_same_runtime_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = PidFileGuard::create(dir.path()).unwrap();

        let result = PidFileGuard::create(dir.path());
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already running"));
    }

    #[test]
    fn guard_drop_allows_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidFileGuard::create(dir.path()).unwrap();
        drop(guard);
        let _second = PidFileGuard::create(dir.path()).unwrap();
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        // PIDs this large do not exist on a default kernel
        fs::write(dir.path().join("managerd.pid"), "999999").unwrap();
        let _guard = PidFileGuard::create(dir.path()).unwrap();
    }

    #[test]
    fn current_process_is_detected_as_running() {
        assert!(is_process_running(std::process::id()));
    }
}
