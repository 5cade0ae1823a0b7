// Tundev Rendezvous Server - Manager Daemon
// Brokers vtun tunnels between master and onsite tunnelling devices and
// stitches paired tunnels together in the kernel.

mod api;
mod binding;
mod config;
mod kernel;
mod manager;
mod pidfile;
mod roles;
mod session;
mod supervisor;
mod watchdog;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tower::Service;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{create_router, AppState};
use config::{DaemonConfig, ListenerMode};
use kernel::{ForwardPolicyGuard, KernelGlue, ShellRunner};
use manager::Manager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tundev_manager=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tundev Manager Daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let daemon_config = DaemonConfig::load()?;
    info!("Listener mode: {:?}", daemon_config.listener_mode);

    // Prevent a second manager from fighting over the kernel state
    let _pid_guard = pidfile::PidFileGuard::create(&daemon_config.runtime_dir)
        .context("Failed to create PID file - another manager may already be running")?;

    let runner = Arc::new(ShellRunner);

    // A permissive FORWARD default would let unpaired tunnels exchange
    // traffic; flip it to DROP for the daemon's lifetime
    let policy_guard = ForwardPolicyGuard::engage(runner.clone()).await;

    let (manager, commands_rx) = Manager::new(daemon_config.clone(), KernelGlue::new(runner));

    // Watchdog fires flow through the dispatcher like any other request
    tokio::spawn(manager.clone().run_dispatcher(commands_rx));

    // Shutdown broadcast for graceful SSE stream termination
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let state = Arc::new(AppState {
        manager: manager.clone(),
        shutdown_tx: shutdown_tx.clone(),
    });
    let app = create_router(state);

    match daemon_config.listener_mode {
        ListenerMode::UnixSocket => {
            serve_unix_socket(app, &daemon_config, manager.clone(), shutdown_tx).await?;
        }
        ListenerMode::TcpHttp => {
            let bind_address = format!("{}:{}", daemon_config.bind_host, daemon_config.bind_port);
            serve_tcp_http(app, &bind_address, manager.clone(), shutdown_tx).await?;
        }
    }

    policy_guard.restore().await;
    info!("Manager daemon shut down");
    Ok(())
}

/// Serve on a Unix domain socket (local-only).
async fn serve_unix_socket(
    app: axum::Router,
    daemon_config: &DaemonConfig,
    manager: Manager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    let socket_path = daemon_config.socket_path.clone();

    if socket_path.exists() {
        std::fs::remove_file(&socket_path).context("Failed to remove existing socket file")?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    let listener = UnixListener::bind(&socket_path).context(format!(
        "Failed to bind to socket: {}",
        socket_path.display()
    ))?;

    info!("Manager listening on Unix socket: {}", socket_path.display());
    info!("Manager started successfully");

    let (shutdown_signal_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown_broadcast = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(manager).await;
        // Signal SSE streams to close
        let _ = shutdown_broadcast.send(());
        // Signal the accept loop to stop
        let _ = shutdown_signal_tx.send(()).await;
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down server...");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _addr)) => {
                        let app = app.clone();

                        tokio::spawn(async move {
                            let stream = TokioIo::new(stream);

                            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
                                let mut app = app.clone();
                                async move {
                                    app.call(request).await
                                }
                            });

                            if let Err(err) = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                                .serve_connection_with_upgrades(stream, hyper_service)
                                .await
                            {
                                // Shell disconnects (EOF mid-request) are normal
                                let err_msg = err.to_string();
                                if err_msg.contains("connection closed") || err_msg.contains("Broken pipe") {
                                    debug!("Client disconnected: {}", err);
                                } else {
                                    error!("Error serving connection: {}", err);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    Ok(())
}

/// Serve on localhost TCP (development and tests).
async fn serve_tcp_http(
    app: axum::Router,
    bind_address: &str,
    manager: Manager,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> Result<()> {
    info!("Manager listening on TCP (HTTP): {}", bind_address);
    info!("Manager started successfully");

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .context(format!("Failed to bind to {}", bind_address))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager, shutdown_tx))
        .await
        .context("TCP HTTP server error")?;

    Ok(())
}

async fn shutdown_signal(manager: Manager, shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    wait_for_shutdown(manager).await;
    let _ = shutdown_tx.send(());
}

/// Wait for Ctrl+C or SIGTERM, then destroy all bindings. Unstitching and
/// peer-tunnel teardown cascade from there.
async fn wait_for_shutdown(manager: Manager) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    };

    manager.shutdown().await;
    info!("All bindings destroyed");
}
