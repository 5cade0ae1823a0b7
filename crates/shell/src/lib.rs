// Tundev Rendezvous Server - Device Shell
// Restricted login shell for tunnelling devices. The role comes from which
// binary the account's login shell points at.

pub mod parse;
pub mod repl;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use tundev_common::types::Role;
use tundev_common::{lockfile_path, ManagerClient, ManagerClientConfig, ShellAliveLock};

use repl::ShellState;

#[derive(Parser)]
#[command(about = "Tundev device shell", long_about = None)]
#[command(version)]
pub struct ShellOpts {
    /// Override the shell-alive lockfile path
    #[arg(long)]
    pub lockfile: Option<PathBuf>,

    /// Override the manager socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Start with debug logging enabled
    #[arg(long)]
    pub debug: bool,
}

/// Runtime switch behind the `debug_mode {on|off}` shell command.
pub struct DebugToggle {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
}

impl DebugToggle {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>) -> Self {
        DebugToggle {
            handle: Some(handle),
        }
    }

    /// A toggle with no subscriber attached (tests).
    pub fn disabled() -> Self {
        DebugToggle { handle: None }
    }

    pub fn set(&self, enabled: bool) {
        if let Some(handle) = &self.handle {
            let filter = EnvFilter::new(if enabled { "debug" } else { "warn" });
            if handle.reload(filter).is_err() {
                eprintln!("Failed to switch debug mode");
            }
        }
    }
}

/// Shell entry point shared by both role binaries.
pub async fn run(role: Role) -> Result<()> {
    let opts = ShellOpts::parse();

    // Diagnostics go to stderr; stdout belongs to the line protocol
    let initial_filter = EnvFilter::new(if opts.debug { "debug" } else { "warn" });
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let username = users::get_current_username()
        .and_then(|name| name.into_string().ok())
        .context("Cannot determine the current account name")?;

    // The shell-alive lock is held for the whole session; the manager's
    // watchdog observes its release. Failure here is fatal.
    let lock_path = opts
        .lockfile
        .unwrap_or_else(|| lockfile_path(&tundev_common::progname(), std::process::id()));
    let lock = ShellAliveLock::acquire(&lock_path, &username)
        .context("Cannot start the device shell without its lockfile")?;

    let mut client_config = ManagerClientConfig::from_env();
    if let Some(socket) = opts.socket {
        client_config.connection_mode = tundev_common::ConnectionMode::UnixSocket;
        client_config.socket_path = Some(socket);
    }
    let client =
        ManagerClient::new(client_config).context("Cannot build the manager IPC client")?;

    let mut state = ShellState::new(
        role,
        username,
        client,
        lock,
        DebugToggle::new(filter_handle),
    );
    repl::run_loop(&mut state)
        .await
        .context("Shell session failed")?;
    Ok(())
}
