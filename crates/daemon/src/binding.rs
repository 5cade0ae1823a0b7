// Per-device binding: everything the manager holds for one logged-in
// tunnelling device

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tracing::warn;

use tundev_common::types::{binding_object_path, Role};

use crate::supervisor::TunnelSupervisor;
use crate::watchdog::WatchdogHandle;

/// One logged-in device: its metadata, tunnel supervisor and watchdog.
/// Exclusively owned by the manager's binding map.
#[derive(Debug)]
pub struct TundevBinding {
    pub username: String,
    pub role: Role,
    pub lan_ip: Option<Ipv4Network>,
    pub lan_dns: Vec<Ipv4Addr>,
    pub hostname: Option<String>,
    pub uplink_type: Option<String>,
    pub supervisor: TunnelSupervisor,
    pub watchdog: WatchdogHandle,
    pub current_iface: Option<String>,
}

impl TundevBinding {
    pub fn object_path(&self) -> String {
        binding_object_path(&self.username)
    }

    /// Tear the binding down, best effort.
    ///
    /// The watchdog is disarmed first so its eventual fire cannot re-enter
    /// the unregister path for a binding that is already gone, then the
    /// tunnel daemon is stopped. Never fails: a cascade triggered from one
    /// binding's watchdog must not be able to kill the manager loop.
    pub async fn destroy(&mut self) {
        self.watchdog.disarm();
        if self.supervisor.config().is_some() {
            if let Err(e) = self.supervisor.stop().await {
                warn!(username = %self.username, "Error stopping tunnel during destroy: {}", e);
            }
        }
        self.current_iface = None;
    }
}
