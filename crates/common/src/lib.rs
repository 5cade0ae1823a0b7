// Tundev Rendezvous Server - Common Library
// Shared types, tunnel config model and manager IPC client

pub mod client;
pub mod error;
pub mod lockfile;
pub mod sse;
pub mod tunnel;
pub mod types;

pub use client::{
    ConnectionMode, ManagerClient, ManagerClientConfig, DEFAULT_SOCKET_PATH, SOCKET_PATH_ENV,
};
pub use error::{ManagerError, Result};
pub use lockfile::{flock_exclusive, flock_release, lockfile_path, ShellAliveLock};
pub use sse::EventListener;
pub use tunnel::{TunnelConfig, TunnelMode};
pub use types::{
    binding_object_path, username_from_object_path, ConfigureServiceRequest, ConnectRequest,
    ErrorDetail, ErrorEnvelope, InterfaceStatus, InterfaceStatusRequest, ManagerEvent,
    RegisterBindingRequest, RegisterBindingResponse, Role, OBJECT_PATH_ROOT,
};

/// Program name of the current process: basename of `argv[0]`, with any
/// extension stripped. Used for the lockfile naming convention.
pub fn progname() -> String {
    std::env::args()
        .next()
        .as_deref()
        .map(base_progname)
        .unwrap_or_else(|| "tundev".to_string())
}

fn base_progname(argv0: &str) -> String {
    let base = argv0.rsplit('/').next().unwrap_or(argv0);
    base.split('.').next().unwrap_or(base).to_string()
}
