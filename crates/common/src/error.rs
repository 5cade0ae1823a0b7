// Error types shared between the tundev manager and the device shells

use thiserror::Error;

/// Domain errors for the rendezvous manager and its shells.
///
/// Every variant that can travel over the manager IPC carries a stable
/// `code()` so the client side can reconstruct the typed error from the
/// JSON error envelope.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Invalid tunnel mode: {0}")]
    InvalidMode(String),

    #[error("Tunnel IP range has fewer than 2 host addresses: {0}")]
    BadTunnelIpRange(String),

    #[error("Invalid TCP port: {0}")]
    InvalidTcpPort(String),

    #[error("TCP port must be set before rendering the tunnel parameters")]
    TcpPortUnset,

    #[error("Tunnel service has not been configured")]
    NotConfigured,

    #[error("Unknown tundev account: {0}")]
    UnknownTundevAccount(String),

    #[error("Master device is not registered: {0}")]
    MasterNotRegistered(String),

    #[error("Onsite device is not registered: {0}")]
    OnsiteNotRegistered(String),

    #[error("Devices are already connected: {master} and {onsite}")]
    DevicesAlreadyConnected { master: String, onsite: String },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Invalid interface status: {0}")]
    InvalidInterfaceStatus(String),

    #[error("No tunnel config for {0}")]
    NoTunnelConfigFor(String),

    #[error("Cannot get lockfile: {0}")]
    CannotGetLockfile(String),

    #[error("Failed to spawn tunnel daemon: {0}")]
    SpawnFailure(String),

    #[error("Lost connection to the tundev manager: {0}")]
    LostManager(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Stable wire code used in the IPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ManagerError::InvalidMode(_) => "InvalidMode",
            ManagerError::BadTunnelIpRange(_) => "BadTunnelIpRange",
            ManagerError::InvalidTcpPort(_) => "InvalidTcpPort",
            ManagerError::TcpPortUnset => "TcpPortUnset",
            ManagerError::NotConfigured => "NotConfigured",
            ManagerError::UnknownTundevAccount(_) => "UnknownTundevAccount",
            ManagerError::MasterNotRegistered(_) => "MasterNotRegistered",
            ManagerError::OnsiteNotRegistered(_) => "OnsiteNotRegistered",
            ManagerError::DevicesAlreadyConnected { .. } => "DevicesAlreadyConnected",
            ManagerError::UnknownDevice(_) => "UnknownDevice",
            ManagerError::InvalidInterfaceStatus(_) => "InvalidInterfaceStatus",
            ManagerError::NoTunnelConfigFor(_) => "NoTunnelConfigFor",
            ManagerError::CannotGetLockfile(_) => "CannotGetLockfile",
            ManagerError::SpawnFailure(_) => "SpawnFailure",
            ManagerError::LostManager(_) => "LostManager",
            ManagerError::Io(_) => "Io",
        }
    }

    /// Rebuild a typed error from a wire code and its human-readable message.
    ///
    /// Unknown codes collapse into `LostManager` since they indicate a
    /// protocol mismatch with the running manager.
    pub fn from_code(code: &str, message: &str) -> Self {
        let detail = || message.to_string();
        match code {
            "InvalidMode" => ManagerError::InvalidMode(detail()),
            "BadTunnelIpRange" => ManagerError::BadTunnelIpRange(detail()),
            "InvalidTcpPort" => ManagerError::InvalidTcpPort(detail()),
            "TcpPortUnset" => ManagerError::TcpPortUnset,
            "NotConfigured" => ManagerError::NotConfigured,
            "UnknownTundevAccount" => ManagerError::UnknownTundevAccount(detail()),
            "MasterNotRegistered" => ManagerError::MasterNotRegistered(detail()),
            "OnsiteNotRegistered" => ManagerError::OnsiteNotRegistered(detail()),
            "DevicesAlreadyConnected" => ManagerError::DevicesAlreadyConnected {
                master: String::new(),
                onsite: detail(),
            },
            "UnknownDevice" => ManagerError::UnknownDevice(detail()),
            "InvalidInterfaceStatus" => ManagerError::InvalidInterfaceStatus(detail()),
            "NoTunnelConfigFor" => ManagerError::NoTunnelConfigFor(detail()),
            "CannotGetLockfile" => ManagerError::CannotGetLockfile(detail()),
            "SpawnFailure" => ManagerError::SpawnFailure(detail()),
            _ => ManagerError::LostManager(format!("{code}: {message}")),
        }
    }

    /// True for transport-level failures that make the whole shell session
    /// unusable, as opposed to domain errors the shell just reports.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ManagerError::LostManager(_))
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
