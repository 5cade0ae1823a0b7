// Up/down hook invoked by the external tunnel daemon.
//
// Usage: tundev-hook {up|down} <username> <iface>
//
// Relays the interface status to the manager over the local IPC, the
// equivalent of TunnelInterfaceStatusUpdate(username, iface, status).

use anyhow::{bail, Context, Result};

use tundev_common::{ManagerClient, ManagerClientConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [status, username, iface] = args.as_slice() else {
        bail!("usage: tundev-hook {{up|down}} <username> <iface>");
    };
    if !matches!(status.as_str(), "up" | "down") {
        bail!("status must be 'up' or 'down', got '{}'", status);
    }

    let client = ManagerClient::new(ManagerClientConfig::from_env())
        .context("Failed to build manager client")?;
    client
        .interface_status_update(username, iface, status)
        .await
        .with_context(|| format!("Failed to report {} {} {}", username, iface, status))?;
    Ok(())
}
