//! Server-Sent Events listener for manager notifications
//!
//! The device shells use this to observe `VtunAllowedSignal` while the REPL
//! is blocked in a `wait_*` command. Reconnects with exponential backoff if
//! the stream drops.

use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::client::{ConnectionMode, ManagerClientConfig};
use crate::error::{ManagerError, Result};
use crate::types::ManagerEvent;

/// Event listener for the manager's SSE stream.
pub struct EventListener {
    config: ManagerClientConfig,
}

impl EventListener {
    pub fn new(config: ManagerClientConfig) -> Self {
        Self { config }
    }

    /// Start listening to manager events.
    ///
    /// Returns a channel receiver that yields `ManagerEvent` items. The
    /// background task stops once the receiver is dropped.
    pub async fn listen(&self) -> Result<mpsc::Receiver<ManagerEvent>> {
        let (tx, rx) = mpsc::channel(100);

        let config = self.config.clone();
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            let max_backoff = Duration::from_secs(30);

            loop {
                if let Err(e) = stream_events(&config, tx.clone()).await {
                    tracing::warn!("Event stream error: {}", e);
                }

                if tx.is_closed() {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        });

        Ok(rx)
    }
}

async fn stream_events(
    config: &ManagerClientConfig,
    tx: mpsc::Sender<ManagerEvent>,
) -> Result<()> {
    let url = format!("{}/api/events", config.base_url());

    let mut builder = Client::builder();
    if config.connection_mode == ConnectionMode::UnixSocket {
        builder = builder.unix_socket(config.socket_path());
    }
    let client = builder
        .build()
        .map_err(|e| ManagerError::LostManager(e.to_string()))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ManagerError::LostManager(e.to_string()))?;

    if !response.status().is_success() {
        return Err(ManagerError::LostManager(format!(
            "event stream request failed: {}",
            response.status()
        )));
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    buffer.push_str(text);

                    // Process complete SSE messages
                    while let Some(pos) = buffer.find("\n\n") {
                        let message = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        if let Some(event) = parse_sse_message(&message) {
                            if tx.send(event).await.is_err() {
                                // Receiver dropped, stop listening
                                return Ok(());
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error reading event stream: {}", e);
                break;
            }
        }
    }

    Ok(())
}

/// Parse one SSE message (`data: {json}`) into a `ManagerEvent`.
fn parse_sse_message(message: &str) -> Option<ManagerEvent> {
    for line in message.lines() {
        if let Some(data) = line.strip_prefix("data: ") {
            match serde_json::from_str::<ManagerEvent>(data) {
                Ok(event) => return Some(event),
                Err(e) => {
                    tracing::warn!("Failed to parse SSE event: {} (error: {})", data, e);
                }
            }
        }
    }
    None
}
