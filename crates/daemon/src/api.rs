// Tundev Manager - IPC surface
// One route per manager operation; the router is the explicit dispatch
// table keyed by path and method.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::Event,
    response::{IntoResponse, Response, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use tundev_common::error::ManagerError;
use tundev_common::types::{
    BindingListResponse, ConfigureServiceRequest, ConnectRequest, ErrorDetail, ErrorEnvelope,
    InterfaceStatusRequest, LanConfigResponse, ManagerEvent, OnsiteDevListResponse,
    RegisterBindingRequest, RegisterBindingResponse, SessionListResponse, ShellConfigResponse,
};

use crate::manager::Manager;

/// Shared application state.
pub struct AppState {
    pub manager: Manager,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Wrapper turning domain errors into the JSON error envelope with a
/// status code per error kind.
struct ApiError(ManagerError);

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ManagerError::InvalidMode(_)
            | ManagerError::BadTunnelIpRange(_)
            | ManagerError::InvalidTcpPort(_)
            | ManagerError::TcpPortUnset
            | ManagerError::InvalidInterfaceStatus(_) => StatusCode::BAD_REQUEST,
            ManagerError::UnknownTundevAccount(_) => StatusCode::FORBIDDEN,
            ManagerError::MasterNotRegistered(_)
            | ManagerError::OnsiteNotRegistered(_)
            | ManagerError::UnknownDevice(_)
            | ManagerError::NoTunnelConfigFor(_)
            | ManagerError::NotConfigured => StatusCode::NOT_FOUND,
            ManagerError::DevicesAlreadyConnected { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorEnvelope {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/bindings", post(register_binding).get(dump_bindings))
        .route("/api/bindings/:username", delete(unregister_binding))
        .route("/api/bindings/:username/configure", post(configure_service))
        .route("/api/bindings/:username/start", post(start_tunnel_server))
        .route("/api/bindings/:username/stop", post(stop_tunnel_server))
        .route(
            "/api/bindings/:username/client-config",
            get(client_shell_config),
        )
        .route("/api/onsite-devs", get(online_onsite_devs))
        .route("/api/sessions", post(connect_devices).get(dump_sessions))
        .route("/api/interface-status", post(interface_status_update))
        .route("/api/onsite-lan-config/:master_id", get(onsite_lan_config))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn register_binding(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterBindingRequest>,
) -> Result<Json<RegisterBindingResponse>, ApiError> {
    let binding_path = state.manager.register_binding(&request).await?;
    Ok(Json(RegisterBindingResponse { binding_path }))
}

async fn unregister_binding(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.unregister_binding(&username).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn dump_bindings(State(state): State<Arc<AppState>>) -> Json<BindingListResponse> {
    Json(BindingListResponse {
        bindings: state.manager.dump_bindings().await,
    })
}

async fn online_onsite_devs(State(state): State<Arc<AppState>>) -> Json<OnsiteDevListResponse> {
    Json(OnsiteDevListResponse {
        devices: state.manager.online_onsite_devs().await,
    })
}

async fn connect_devices(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .connect_master_to_onsite(&request.master_id, &request.onsite_id)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn interface_status_update(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InterfaceStatusRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .interface_status_update(&request.device_id, &request.iface, &request.status)
        .await?;
    Ok(StatusCode::OK)
}

async fn dump_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.manager.dump_sessions().await,
    })
}

async fn onsite_lan_config(
    State(state): State<Arc<AppState>>,
    Path(master_id): Path<String>,
) -> Json<LanConfigResponse> {
    Json(LanConfigResponse {
        lan_ip: state.manager.onsite_lan_config(&master_id).await,
    })
}

async fn configure_service(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    Json(request): Json<ConfigureServiceRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .configure_service(&username, request.mode)
        .await?;
    Ok(StatusCode::OK)
}

async fn start_tunnel_server(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.start_tunnel_server(&username).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_tunnel_server(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.stop_tunnel_server(&username).await?;
    Ok(StatusCode::OK)
}

async fn client_shell_config(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Json<ShellConfigResponse>, ApiError> {
    let config = state.manager.client_shell_config(&username).await?;
    Ok(Json(ShellConfigResponse { config }))
}

/// GET /api/events -> SSE stream of manager events
async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.manager.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let manager_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => Some(Ok(Event::default().data(json))),
                Err(e) => {
                    tracing::error!("Failed to serialize manager event: {e}");
                    None
                }
            },
            Err(lagged) => {
                // The client fell behind the broadcast channel; it will
                // catch up with future events
                debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(manager_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn heartbeat_stream() -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&ManagerEvent::Heartbeat {
        timestamp: Utc::now(),
    }) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}
