// Tunnel process supervisor: lifecycle of one external tunnel daemon per
// binding

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use tundev_common::error::{ManagerError, Result};
use tundev_common::tunnel::{TunnelConfig, TunnelMode};

/// How long a SIGTERMed tunnel daemon gets before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Supervises exactly one external tunnel daemon process.
#[derive(Debug)]
pub struct TunnelSupervisor {
    username: String,
    vtund_path: PathBuf,
    config_path: PathBuf,
    config: Option<TunnelConfig>,
    child: Option<Child>,
}

impl TunnelSupervisor {
    pub fn new(username: &str, runtime_dir: &Path, vtund_path: &Path) -> Self {
        TunnelSupervisor {
            username: username.to_string(),
            vtund_path: vtund_path.to_path_buf(),
            config_path: runtime_dir.join(format!("vtund-{}.conf", username)),
            config: None,
            child: None,
        }
    }

    pub fn configure(&mut self, config: TunnelConfig) {
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&TunnelConfig> {
        self.config.as_ref()
    }

    pub fn set_mode(&mut self, mode: TunnelMode) -> Result<()> {
        match self.config.as_mut() {
            Some(config) => {
                config.set_mode(mode);
                Ok(())
            }
            None => Err(ManagerError::NoTunnelConfigFor(self.username.clone())),
        }
    }

    /// Interface name the tunnel daemon will bring up for this binding.
    pub fn iface_name(&self) -> Result<String> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ManagerError::NoTunnelConfigFor(self.username.clone()))?;
        Ok(format!("{}_to_{}", config.mode.iface_prefix(), self.username))
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Write the config file and spawn the tunnel daemon.
    ///
    /// A second start on a running supervisor is a no-op, so a device shell
    /// re-issuing `get_vtun_parameters` does not fork a second daemon.
    pub async fn start(&mut self) -> Result<()> {
        let config = self.config.as_ref().ok_or(ManagerError::NotConfigured)?;

        if self.child.is_some() {
            debug!(username = %self.username, "Tunnel daemon already running");
            return Ok(());
        }

        if let Some(port) = config.tcp_port {
            if std::net::TcpListener::bind(("0.0.0.0", port)).is_err() {
                warn!(
                    username = %self.username,
                    port,
                    "vtun TCP port is already bound; the tunnel daemon may fail to listen"
                );
            }
        }

        let rendered = config.to_vtund_config()?;
        std::fs::write(&self.config_path, rendered)
            .map_err(|e| ManagerError::SpawnFailure(format!("writing config: {}", e)))?;
        restrict_permissions(&self.config_path);

        let child = Command::new(&self.vtund_path)
            .arg("-s")
            .arg("-n")
            .arg("-f")
            .arg(&self.config_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ManagerError::SpawnFailure(format!("{}: {}", self.vtund_path.display(), e))
            })?;

        info!(
            username = %self.username,
            pid = child.id(),
            config = %self.config_path.display(),
            "Started tunnel daemon"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Terminate the tunnel daemon and remove its config file.
    ///
    /// Idempotent; stopping a supervisor whose daemon never ran only cleans
    /// up. Calling it with no config ever set surfaces `NotConfigured`.
    pub async fn stop(&mut self) -> Result<()> {
        if self.config.is_none() {
            return Err(ManagerError::NotConfigured);
        }

        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(username = %self.username, %status, "Tunnel daemon exited");
                }
                Ok(Err(e)) => {
                    warn!(username = %self.username, "Failed to reap tunnel daemon: {}", e);
                }
                Err(_) => {
                    warn!(username = %self.username, "Tunnel daemon ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }

        if self.config_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.config_path) {
                warn!(
                    path = %self.config_path.display(),
                    "Failed to remove tunnel config: {}", e
                );
            }
        }
        Ok(())
    }
}

fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), "Failed to restrict config permissions: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnetwork::Ipv4Network;

    fn test_config(mode: TunnelMode) -> TunnelConfig {
        let net: Ipv4Network = "192.168.100.0/30".parse().unwrap();
        TunnelConfig::new(mode, net, Some(5000), "onsite_a", "s3cret").unwrap()
    }

    #[test]
    fn iface_name_tracks_mode_and_username() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor =
            TunnelSupervisor::new("onsite_a", dir.path(), Path::new("/usr/sbin/vtund"));

        assert_eq!(
            supervisor.iface_name().unwrap_err().code(),
            "NoTunnelConfigFor"
        );

        supervisor.configure(test_config(TunnelMode::L3));
        assert_eq!(supervisor.iface_name().unwrap(), "tun_to_onsite_a");

        supervisor.set_mode(TunnelMode::L2).unwrap();
        assert_eq!(supervisor.iface_name().unwrap(), "tap_to_onsite_a");

        supervisor.set_mode(TunnelMode::L3Multi).unwrap();
        assert_eq!(supervisor.iface_name().unwrap(), "tunM_to_onsite_a");
    }

    #[tokio::test]
    async fn start_without_config_is_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor =
            TunnelSupervisor::new("onsite_a", dir.path(), Path::new("/usr/sbin/vtund"));
        assert_eq!(supervisor.start().await.unwrap_err().code(), "NotConfigured");
        assert_eq!(supervisor.stop().await.unwrap_err().code(), "NotConfigured");
    }

    #[tokio::test]
    async fn start_with_missing_binary_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = TunnelSupervisor::new(
            "onsite_a",
            dir.path(),
            Path::new("/nonexistent/vtund-for-tests"),
        );
        supervisor.configure(test_config(TunnelMode::L3));

        let err = supervisor.start().await.unwrap_err();
        assert_eq!(err.code(), "SpawnFailure");
        // The config file was written before the spawn attempt
        assert!(dir.path().join("vtund-onsite_a.conf").exists());

        // stop() is still safe and removes the leftover config
        supervisor.stop().await.unwrap();
        assert!(!dir.path().join("vtund-onsite_a.conf").exists());
    }

    #[tokio::test]
    async fn stop_reaps_a_running_child() {
        let dir = tempfile::tempdir().unwrap();
        // Any spawnable binary stands in for the tunnel daemon here
        let mut supervisor = TunnelSupervisor::new("onsite_a", dir.path(), Path::new("/bin/sleep"));
        supervisor.configure(test_config(TunnelMode::L3));

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());

        // Second stop is a no-op
        supervisor.stop().await.unwrap();
    }
}
