// Manager IPC client shared by the device shells and the tunnel hooks

use std::path::PathBuf;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};
use crate::types::{
    BindingListResponse, ConfigureServiceRequest, ConnectRequest, ErrorEnvelope,
    InterfaceStatusRequest, LanConfigResponse, OnsiteDevListResponse, RegisterBindingRequest,
    RegisterBindingResponse, SessionListResponse, ShellConfigResponse,
};
use crate::tunnel::TunnelMode;

/// Default Unix socket the manager listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/run/tundev-manager/managerd.sock";

/// Environment variable overriding the socket path (used by tests and by
/// hooks spawned with a sanitized environment).
pub const SOCKET_PATH_ENV: &str = "TUNDEV_MANAGER_SOCKET";

/// How clients reach the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    /// Unix domain socket (default; local-only)
    UnixSocket,
    /// Plain HTTP on localhost, used in tests
    Http,
}

impl Default for ConnectionMode {
    fn default() -> Self {
        ConnectionMode::UnixSocket
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerClientConfig {
    #[serde(default)]
    pub connection_mode: ConnectionMode,

    /// Socket path override for UnixSocket mode.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3680
}

impl Default for ManagerClientConfig {
    fn default() -> Self {
        ManagerClientConfig {
            connection_mode: ConnectionMode::default(),
            socket_path: None,
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ManagerClientConfig {
    /// Default config, honouring the `TUNDEV_MANAGER_SOCKET` override.
    /// A value of the form `http://host:port` selects localhost HTTP mode.
    pub fn from_env() -> Self {
        let mut config = ManagerClientConfig::default();
        if let Ok(value) = std::env::var(SOCKET_PATH_ENV) {
            if let Some(rest) = value.strip_prefix("http://") {
                config.connection_mode = ConnectionMode::Http;
                if let Some((host, port)) = rest.rsplit_once(':') {
                    config.host = host.to_string();
                    if let Ok(port) = port.parse() {
                        config.port = port;
                    }
                }
            } else {
                config.socket_path = Some(PathBuf::from(value));
            }
        }
        config
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }

    /// Base URL for requests. Over a Unix socket the authority is a
    /// placeholder that reqwest routes through the socket.
    pub fn base_url(&self) -> String {
        match self.connection_mode {
            ConnectionMode::UnixSocket => "http://manager".to_string(),
            ConnectionMode::Http => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Typed client for the manager's IPC surface; one method per operation.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    http: Client,
    config: ManagerClientConfig,
}

impl ManagerClient {
    pub fn new(config: ManagerClientConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if config.connection_mode == ConnectionMode::UnixSocket {
            builder = builder.unix_socket(config.socket_path());
        }
        let http = builder
            .build()
            .map_err(|e| ManagerError::LostManager(e.to_string()))?;
        Ok(ManagerClient { http, config })
    }

    pub fn config(&self) -> &ManagerClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    pub async fn health(&self) -> Result<()> {
        let resp = self
            .http
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn register_binding(&self, request: &RegisterBindingRequest) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/api/bindings"))
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let body: RegisterBindingResponse = expect_json(resp).await?;
        Ok(body.binding_path)
    }

    pub async fn unregister_binding(&self, username: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/bindings/{}", username)))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn dump_bindings(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(self.url("/api/bindings"))
            .send()
            .await
            .map_err(transport_error)?;
        let body: BindingListResponse = expect_json(resp).await?;
        Ok(body.bindings)
    }

    pub async fn online_onsite_devs(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(self.url("/api/onsite-devs"))
            .send()
            .await
            .map_err(transport_error)?;
        let body: OnsiteDevListResponse = expect_json(resp).await?;
        Ok(body.devices)
    }

    pub async fn connect_master_to_onsite(&self, master_id: &str, onsite_id: &str) -> Result<()> {
        let request = ConnectRequest {
            master_id: master_id.to_string(),
            onsite_id: onsite_id.to_string(),
        };
        let resp = self
            .http
            .post(self.url("/api/sessions"))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn interface_status_update(
        &self,
        device_id: &str,
        iface: &str,
        status: &str,
    ) -> Result<()> {
        let request = InterfaceStatusRequest {
            device_id: device_id.to_string(),
            iface: iface.to_string(),
            status: status.to_string(),
        };
        let resp = self
            .http
            .post(self.url("/api/interface-status"))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn dump_sessions(&self) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(self.url("/api/sessions"))
            .send()
            .await
            .map_err(transport_error)?;
        let body: SessionListResponse = expect_json(resp).await?;
        Ok(body.sessions)
    }

    pub async fn onsite_lan_config(&self, master_id: &str) -> Result<String> {
        let resp = self
            .http
            .get(self.url(&format!("/api/onsite-lan-config/{}", master_id)))
            .send()
            .await
            .map_err(transport_error)?;
        let body: LanConfigResponse = expect_json(resp).await?;
        Ok(body.lan_ip)
    }

    pub async fn configure_service(&self, username: &str, mode: TunnelMode) -> Result<()> {
        let request = ConfigureServiceRequest { mode };
        let resp = self
            .http
            .post(self.url(&format!("/api/bindings/{}/configure", username)))
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn start_tunnel_server(&self, username: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/api/bindings/{}/start", username)))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn stop_tunnel_server(&self, username: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/api/bindings/{}/stop", username)))
            .send()
            .await
            .map_err(transport_error)?;
        expect_success(resp).await.map(|_| ())
    }

    pub async fn client_shell_config(&self, username: &str) -> Result<String> {
        let resp = self
            .http
            .get(self.url(&format!("/api/bindings/{}/client-config", username)))
            .send()
            .await
            .map_err(transport_error)?;
        let body: ShellConfigResponse = expect_json(resp).await?;
        Ok(body.config)
    }
}

fn transport_error(err: reqwest::Error) -> ManagerError {
    ManagerError::LostManager(err.to_string())
}

/// Turn a non-success response into the typed error from its envelope.
async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    match resp.json::<ErrorEnvelope>().await {
        Ok(envelope) => Err(ManagerError::from_code(
            &envelope.error.code,
            &envelope.error.message,
        )),
        Err(_) => Err(ManagerError::LostManager(format!(
            "manager returned {} with an unreadable body",
            status
        ))),
    }
}

async fn expect_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let resp = expect_success(resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| ManagerError::LostManager(format!("malformed manager response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_the_unix_socket() {
        let config = ManagerClientConfig::default();
        assert_eq!(config.connection_mode, ConnectionMode::UnixSocket);
        assert_eq!(config.socket_path(), PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.base_url(), "http://manager");
    }

    #[test]
    fn http_mode_builds_a_localhost_url() {
        let config = ManagerClientConfig {
            connection_mode: ConnectionMode::Http,
            socket_path: None,
            host: "127.0.0.1".into(),
            port: 4000,
        };
        assert_eq!(config.base_url(), "http://127.0.0.1:4000");
    }
}
