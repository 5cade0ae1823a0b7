// Tundev Manager - Daemon Config Module
// Listener mode, filesystem paths, per-role tunnel profiles

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::info;

use tundev_common::types::Role;

/// Listener mode for the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerMode {
    /// Unix domain socket (local-only; shells run on this host)
    UnixSocket,
    /// TCP with HTTP on localhost, used for development and tests
    TcpHttp,
}

impl Default for ListenerMode {
    fn default() -> Self {
        ListenerMode::UnixSocket
    }
}

/// Static tunnel allocation for one device role.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleProfile {
    /// IP network used inside the tunnel; must leave at least 2 host bits
    pub tunnel_network: Ipv4Network,
    /// TCP port the vtun server listens on for this role
    pub tcp_port: u16,
}

/// Per-role tunnel profile table. The defaults are the reference mapping;
/// deployments with different addressing override them in `managerd.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleProfiles {
    #[serde(default = "default_onsite_profile")]
    pub onsite: RoleProfile,
    #[serde(default = "default_master_profile")]
    pub master: RoleProfile,
}

fn default_onsite_profile() -> RoleProfile {
    RoleProfile {
        tunnel_network: "192.168.100.0/30".parse().expect("static network"),
        tcp_port: 5000,
    }
}

fn default_master_profile() -> RoleProfile {
    RoleProfile {
        tunnel_network: "192.168.101.0/30".parse().expect("static network"),
        tcp_port: 5001,
    }
}

impl Default for RoleProfiles {
    fn default() -> Self {
        RoleProfiles {
            onsite: default_onsite_profile(),
            master: default_master_profile(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub listener_mode: ListenerMode,

    /// Bind address for TcpHttp mode
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Unix socket path (UnixSocket mode)
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Directory for generated tunnel configs and the PID file
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// External tunnel daemon binary
    #[serde(default = "default_vtund_path")]
    pub vtund_path: PathBuf,

    /// Hook helper invoked by the tunnel daemon on interface up/down
    #[serde(default = "default_hook_path")]
    pub hook_path: PathBuf,

    /// Per-role tunnel allocation table
    #[serde(default)]
    pub profiles: RoleProfiles,

    /// Role overrides for accounts whose login shell cannot be inspected
    /// (maps username to "master" or "onsite")
    #[serde(default)]
    pub role_overrides: HashMap<String, Role>,
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    3680
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(tundev_common::DEFAULT_SOCKET_PATH)
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/tundev-manager")
}

fn default_vtund_path() -> PathBuf {
    PathBuf::from("/usr/sbin/vtund")
}

fn default_hook_path() -> PathBuf {
    PathBuf::from("/usr/sbin/tundev-hook")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            listener_mode: ListenerMode::default(),
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            socket_path: default_socket_path(),
            runtime_dir: default_runtime_dir(),
            vtund_path: default_vtund_path(),
            hook_path: default_hook_path(),
            profiles: RoleProfiles::default(),
            role_overrides: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    pub fn profile_for(&self, role: Role) -> &RoleProfile {
        match role {
            Role::Onsite => &self.profiles.onsite,
            Role::Master => &self.profiles.master,
        }
    }

    /// Config file location: `$TUNDEV_MANAGER_CONFIG` override, else
    /// `/etc/tundev-manager/managerd.toml`.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("TUNDEV_MANAGER_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("/etc/tundev-manager/managerd.toml")
    }

    /// Load the daemon configuration, writing defaults on first start.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            if let Err(e) = config.save(&config_path) {
                // A read-only /etc is fine; run on defaults
                info!("Could not write default configuration: {}", e);
            }
            return Ok(config);
        }

        let contents = fs::read_to_string(&config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self =
            toml::from_str(&contents).context("Failed to parse daemon configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn save(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        fs::write(config_path, contents).context("Failed to write configuration")?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (role, profile) in [
            (Role::Onsite, &self.profiles.onsite),
            (Role::Master, &self.profiles.master),
        ] {
            if 32 - profile.tunnel_network.prefix() < 2 {
                anyhow::bail!(
                    "Tunnel network for {} role has fewer than 2 host addresses: {}",
                    role,
                    profile.tunnel_network
                );
            }
            if profile.tcp_port == 0 {
                anyhow::bail!("Tunnel TCP port for {} role must be non-zero", role);
            }
        }
        if self.profiles.onsite.tcp_port == self.profiles.master.tcp_port {
            anyhow::bail!(
                "Onsite and master roles cannot share vtun TCP port {}",
                self.profiles.onsite.tcp_port
            );
        }
        Ok(())
    }
}
