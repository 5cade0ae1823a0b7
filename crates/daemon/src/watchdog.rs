// Shell-alive watchdog: learns that a device shell died by winning the
// advisory lock the shell held for its lifetime.
//
// The watchdog never touches manager state itself. It reports the lock
// release as a message on the manager's command channel, and the dispatcher
// applies the teardown under the normal lock order; a disarmed or stale
// (superseded-generation) fire is a no-op.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use tundev_common::error::{ManagerError, Result};
use tundev_common::lockfile::{flock_exclusive, flock_release};

/// Messages flowing into the manager's dispatcher task.
#[derive(Debug)]
pub enum ManagerCommand {
    /// The shell holding `username`'s lockfile has released it.
    WatchdogFired { username: String, generation: u64 },
}

/// Handle to one binding's watchdog.
#[derive(Debug)]
pub struct WatchdogHandle {
    pub generation: u64,
    armed: Arc<AtomicBool>,
}

impl WatchdogHandle {
    /// Make any later lock-release fire a no-op. Part of the binding's
    /// destroy path, breaking the watchdog -> unregister re-entry cycle.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

/// Start a watchdog on `lockfile`.
///
/// Opens the file read-only up front, so a missing or unreadable lockfile
/// fails the registration instead of producing a watchdog that can never
/// fire. The blocking acquirer then parks in `flock` until the shell's
/// exclusive lock goes away and sends exactly one message.
pub fn spawn(
    username: &str,
    generation: u64,
    lockfile: &Path,
    tx: mpsc::UnboundedSender<ManagerCommand>,
) -> Result<WatchdogHandle> {
    let file = File::open(lockfile).map_err(|e| {
        ManagerError::CannotGetLockfile(format!("{}: {}", lockfile.display(), e))
    })?;

    let armed = Arc::new(AtomicBool::new(true));
    let thread_armed = armed.clone();
    let thread_username = username.to_string();
    let thread_path = lockfile.display().to_string();

    tokio::task::spawn_blocking(move || {
        if let Err(e) = flock_exclusive(&file, true) {
            warn!(lockfile = %thread_path, "Watchdog failed to acquire lock: {}", e);
            return;
        }
        // Lock acquired: the previous holder is gone. Release immediately;
        // the file itself is of no further interest.
        flock_release(&file);

        if !thread_armed.load(Ordering::SeqCst) {
            debug!(username = %thread_username, "Disarmed watchdog fired, ignoring");
            return;
        }
        if tx
            .send(ManagerCommand::WatchdogFired {
                username: thread_username.clone(),
                generation,
            })
            .is_err()
        {
            debug!(username = %thread_username, "Manager gone, dropping watchdog fire");
        }
    });

    Ok(WatchdogHandle { generation, armed })
}
