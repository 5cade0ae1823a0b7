// Wire types shared by the manager API, the device shells and the hooks

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;
use crate::tunnel::TunnelMode;

/// Root under which per-binding object paths are allocated. A binding for
/// account `onsite_a` is addressed as `/TundevManager/onsite_a`.
pub const OBJECT_PATH_ROOT: &str = "/TundevManager";

/// Object path for a username's binding.
pub fn binding_object_path(username: &str) -> String {
    format!("{}/{}", OBJECT_PATH_ROOT, username)
}

/// Extract the username back out of a binding object path.
pub fn username_from_object_path(path: &str) -> Option<&str> {
    path.strip_prefix(OBJECT_PATH_ROOT)?.strip_prefix('/')
}

/// Role of a tunnelling device, fixed per account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Onsite,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Onsite => f.write_str("onsite"),
        }
    }
}

/// Interface status reported by the tunnel daemon's up/down hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceStatus {
    Up,
    Down,
}

impl FromStr for InterfaceStatus {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, ManagerError> {
        match s {
            "up" => Ok(InterfaceStatus::Up),
            "down" => Ok(InterfaceStatus::Down),
            other => Err(ManagerError::InvalidInterfaceStatus(other.to_string())),
        }
    }
}

impl fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceStatus::Up => f.write_str("up"),
            InterfaceStatus::Down => f.write_str("down"),
        }
    }
}

/// RegisterTundevBinding request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBindingRequest {
    pub username: String,
    pub mode: TunnelMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lan_ip: Option<Ipv4Network>,
    #[serde(default)]
    pub lan_dns: Vec<Ipv4Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uplink_type: Option<String>,
    pub lockfile: PathBuf,
}

/// RegisterTundevBinding response: the opaque binding identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterBindingResponse {
    pub binding_path: String,
}

/// ConnectMasterDevToOnsiteDev request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub master_id: String,
    pub onsite_id: String,
}

/// TunnelInterfaceStatusUpdate request body. The status travels as a raw
/// string so the manager itself can reject anything but "up"/"down".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStatusRequest {
    pub device_id: String,
    pub iface: String,
    pub status: String,
}

/// ConfigureService request body (per-binding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureServiceRequest {
    pub mode: TunnelMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingListResponse {
    pub bindings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnsiteDevListResponse {
    pub devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<String>,
}

/// GetOnsiteDevLanConfig response; `lan_ip` is empty when unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanConfigResponse {
    pub lan_ip: String,
}

/// GetAssociatedClientTundevShellConfig response: the peer-shell lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfigResponse {
    pub config: String,
}

/// Error envelope returned by the manager API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Events published on the manager's SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerEvent {
    /// The RDV server is ready to accept a vtun session from this onsite
    /// device (its pairing with a master has been recorded).
    VtunAllowed { username: String },

    /// A binding was removed (exit, watchdog fire or replacement).
    BindingRemoved { username: String },

    /// Periodic keep-alive so listeners can detect a dead stream.
    Heartbeat { timestamp: DateTime<Utc> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_round_trip() {
        let path = binding_object_path("onsite_a");
        assert_eq!(path, "/TundevManager/onsite_a");
        assert_eq!(username_from_object_path(&path), Some("onsite_a"));
        assert_eq!(username_from_object_path("/Elsewhere/x"), None);
    }

    #[test]
    fn interface_status_only_accepts_up_and_down() {
        assert_eq!("up".parse::<InterfaceStatus>().unwrap(), InterfaceStatus::Up);
        assert_eq!(
            "down".parse::<InterfaceStatus>().unwrap(),
            InterfaceStatus::Down
        );
        let err = "Up".parse::<InterfaceStatus>().unwrap_err();
        assert_eq!(err.code(), "InvalidInterfaceStatus");
    }

    #[test]
    fn manager_events_serialize_with_snake_case_tags() {
        let json = serde_json::to_string(&ManagerEvent::VtunAllowed {
            username: "onsite_a".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"vtun_allowed\""));
        assert!(json.contains("\"username\":\"onsite_a\""));
    }

    #[test]
    fn register_request_round_trips_through_json() {
        let req = RegisterBindingRequest {
            username: "onsite_a".into(),
            mode: TunnelMode::L3Multi,
            lan_ip: Some("192.168.1.2/24".parse().unwrap()),
            lan_dns: vec![Ipv4Addr::new(192, 168, 1, 1)],
            hostname: Some("plant-floor".into()),
            uplink_type: Some("lan".into()),
            lockfile: PathBuf::from("/var/lock/onsitedev_shell-1234.lock"),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"mode\":\"L3_multi\""));
        let back: RegisterBindingRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.username, req.username);
        assert_eq!(back.mode, req.mode);
        assert_eq!(back.lan_ip, req.lan_ip);
    }
}
