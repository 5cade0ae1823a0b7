// Shell-alive lockfile: an advisory exclusive lock held by a device shell
// for its whole lifetime. The manager's watchdog requests the same lock to
// learn when the shell has gone away.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ManagerError, Result};

/// Directory holding the per-shell lockfiles.
pub const LOCK_DIR: &str = "/var/lock";

/// Lock path convention: `/var/lock/<progname>-<pid>.lock`.
pub fn lockfile_path(progname: &str, pid: u32) -> PathBuf {
    PathBuf::from(LOCK_DIR).join(format!("{}-{}.lock", progname, pid))
}

/// Take an exclusive advisory lock on an open file.
///
/// With `blocking` the call parks until the current holder releases, which
/// is exactly what the manager's watchdog thread wants.
pub fn flock_exclusive(file: &File, blocking: bool) -> std::io::Result<()> {
    let mut op = libc::LOCK_EX;
    if !blocking {
        op |= libc::LOCK_NB;
    }
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Release an advisory lock without closing the file.
pub fn flock_release(file: &File) {
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

/// Guard created at shell start-up.
///
/// Creates the lockfile, writes PID and username (one per line), and holds
/// the exclusive lock until dropped. Dropping unlinks the file; the lock
/// itself dies with the file descriptor, so even a SIGKILLed shell releases
/// it and wakes the manager's watchdog.
#[derive(Debug)]
pub struct ShellAliveLock {
    path: PathBuf,
    // Held for the lock lifetime; never read after creation.
    _file: File,
}

impl ShellAliveLock {
    pub fn acquire(path: &Path, username: &str) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| ManagerError::CannotGetLockfile(format!("{}: {}", path.display(), e)))?;

        flock_exclusive(&file, false)
            .map_err(|e| ManagerError::CannotGetLockfile(format!("{}: {}", path.display(), e)))?;

        writeln!(file, "{}", std::process::id())
            .and_then(|_| writeln!(file, "{}", username))
            .map_err(|e| ManagerError::CannotGetLockfile(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), username, "Acquired shell-alive lock");
        Ok(ShellAliveLock {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ShellAliveLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to remove lockfile: {}", e);
        }
    }
}
