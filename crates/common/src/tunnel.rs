// Tunnel configuration model: server-side config, client-side derivation,
// and the two textual renderings (peer-shell lines, vtund config file)

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{ManagerError, Result};

/// Tunnelling mode of a vtun session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMode {
    /// Ethernet bridging over a tap interface
    L2,
    /// Point-to-point IP over a tun interface
    L3,
    /// Routed IP with multiple subnets behind the far end
    #[serde(rename = "L3_multi")]
    L3Multi,
}

impl TunnelMode {
    /// Kernel interface name prefix used when the tunnel comes up.
    pub fn iface_prefix(self) -> &'static str {
        match self {
            TunnelMode::L2 => "tap",
            TunnelMode::L3 => "tun",
            TunnelMode::L3Multi => "tunM",
        }
    }

    /// Device type keyword for the external tunnel daemon's config file.
    pub fn vtund_device_type(self) -> &'static str {
        match self {
            TunnelMode::L2 => "ether",
            TunnelMode::L3 | TunnelMode::L3Multi => "tun",
        }
    }
}

impl FromStr for TunnelMode {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "L2" => Ok(TunnelMode::L2),
            "L3" => Ok(TunnelMode::L3),
            "L3_multi" => Ok(TunnelMode::L3Multi),
            other => Err(ManagerError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelMode::L2 => "L2",
            TunnelMode::L3 => "L3",
            TunnelMode::L3Multi => "L3_multi",
        };
        f.write_str(s)
    }
}

/// One side's view of a vtun tunnel.
///
/// The manager constructs the server-side config; the matching client-side
/// config is a pure derivation (`derive_client`) with the near/far addresses
/// swapped and the server-only fields cleared.
#[derive(Clone)]
pub struct TunnelConfig {
    pub mode: TunnelMode,
    pub net: Ipv4Network,
    pub near_ip: Ipv4Addr,
    pub far_ip: Ipv4Addr,
    pub tcp_port: Option<u16>,
    pub name: String,
    pub secret: Zeroizing<String>,
    pub bind_iface: String,
    pub up_cmd: String,
    pub down_cmd: String,
}

impl fmt::Debug for TunnelConfig {
    // Keeps the tunnel secret out of log output
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("mode", &self.mode)
            .field("net", &self.net)
            .field("near_ip", &self.near_ip)
            .field("far_ip", &self.far_ip)
            .field("tcp_port", &self.tcp_port)
            .field("name", &self.name)
            .field("secret", &"<redacted>")
            .field("bind_iface", &self.bind_iface)
            .finish()
    }
}

impl TunnelConfig {
    /// Build a server-side tunnel config.
    ///
    /// The near end (this host) takes network+1 and the far end (the device)
    /// network+2, so the network must carry at least two host addresses.
    pub fn new(
        mode: TunnelMode,
        net: Ipv4Network,
        tcp_port: Option<u16>,
        name: &str,
        secret: &str,
    ) -> Result<Self> {
        if host_bits(&net) < 2 {
            return Err(ManagerError::BadTunnelIpRange(net.to_string()));
        }
        if let Some(port) = tcp_port {
            if port == 0 {
                return Err(ManagerError::InvalidTcpPort(port.to_string()));
            }
        }
        let base = u32::from(net.network());
        Ok(TunnelConfig {
            mode,
            net,
            near_ip: Ipv4Addr::from(base + 1),
            far_ip: Ipv4Addr::from(base + 2),
            tcp_port,
            name: name.to_string(),
            secret: Zeroizing::new(secret.to_string()),
            bind_iface: "lo".to_string(),
            up_cmd: String::new(),
            down_cmd: String::new(),
        })
    }

    /// Change the tunnel mode. Used when a pairing copies the master's mode
    /// onto the onsite tunnel.
    pub fn set_mode(&mut self, mode: TunnelMode) {
        self.mode = mode;
    }

    /// Install the up/down hook command strings.
    pub fn set_hooks(&mut self, up_cmd: &str, down_cmd: &str) {
        self.up_cmd = up_cmd.to_string();
        self.down_cmd = down_cmd.to_string();
    }

    /// Derive the matching client-side config: near/far swapped, server-only
    /// fields (bind interface, hooks) cleared. Pure function of `self`.
    pub fn derive_client(&self) -> TunnelConfig {
        TunnelConfig {
            mode: self.mode,
            net: self.net,
            near_ip: self.far_ip,
            far_ip: self.near_ip,
            tcp_port: self.tcp_port,
            name: self.name.clone(),
            secret: self.secret.clone(),
            bind_iface: String::new(),
            up_cmd: String::new(),
            down_cmd: String::new(),
        }
    }

    /// Render the fixed line set consumed verbatim by the remote device.
    ///
    /// `tunnelling_dev_ip_address` is this config's near end, so the caller
    /// renders the *client-derived* config when answering a device shell.
    pub fn to_peer_shell_output(&self) -> Result<String> {
        let port = self.tcp_port.ok_or(ManagerError::TcpPortUnset)?;
        let mut out = String::new();
        out.push_str(&format!("tunnel_ip_network: {}\n", self.net.network()));
        out.push_str(&format!("tunnel_ip_prefix: /{}\n", self.net.prefix()));
        out.push_str(&format!("tunnel_ip_netmask: {}\n", self.net.mask()));
        out.push_str(&format!("tunnelling_dev_ip_address: {}\n", self.near_ip));
        out.push_str(&format!("rdv_server_ip_address: {}\n", self.far_ip));
        out.push_str(&format!("rdv_server_vtun_tcp_port: {}\n", port));
        out.push_str(&format!("tunnel_secret: {}", self.secret.as_str()));
        Ok(out)
    }

    /// Render the config file handed to the external tunnel daemon.
    ///
    /// Encodes mode, addressing, port, secret, session name, bind interface
    /// and the hook commands exactly as supplied; the daemon's dialect
    /// tolerates the vtund-style block syntax used here.
    pub fn to_vtund_config(&self) -> Result<String> {
        let port = self.tcp_port.ok_or(ManagerError::TcpPortUnset)?;
        let mut out = String::new();
        out.push_str("options {\n");
        out.push_str(&format!("  port {};\n", port));
        if !self.bind_iface.is_empty() {
            out.push_str(&format!("  bindaddr {{ iface {}; }};\n", self.bind_iface));
        }
        out.push_str("}\n\n");
        out.push_str(&format!("{} {{\n", self.name));
        out.push_str(&format!("  passwd {};\n", self.secret.as_str()));
        out.push_str(&format!("  type {};\n", self.mode.vtund_device_type()));
        out.push_str("  proto tcp;\n");
        out.push_str("  up {\n");
        out.push_str(&format!(
            "    ifconfig \"%% {} pointopoint {} mtu 1450\";\n",
            self.near_ip, self.far_ip
        ));
        if !self.up_cmd.is_empty() {
            out.push_str(&format!("    program \"{}\" wait;\n", self.up_cmd));
        }
        out.push_str("  };\n");
        out.push_str("  down {\n");
        if !self.down_cmd.is_empty() {
            out.push_str(&format!("    program \"{}\" wait;\n", self.down_cmd));
        }
        out.push_str("  };\n");
        out.push_str("}\n");
        Ok(out)
    }
}

fn host_bits(net: &Ipv4Network) -> u8 {
    32 - net.prefix()
}
