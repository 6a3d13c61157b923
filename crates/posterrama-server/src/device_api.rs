//! 设备能力 API 路由

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use posterrama_device::settings::get_device_mode;
use posterrama_device::{CapabilityInfo, CapabilityRegistry, DeviceError, DeviceStore, RegisterRequest};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Clone)]
pub struct DeviceApiState {
    pub registry: Arc<CapabilityRegistry>,
    pub store: Arc<dyn DeviceStore>,
}

impl DeviceApiState {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        let store = registry.context().store.clone();
        Self { registry, store }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Invalid request body: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Device(e) => match e {
                DeviceError::NotFound(_) | DeviceError::UnknownCapability(_) => StatusCode::NOT_FOUND,
                DeviceError::InvalidValue { .. } => StatusCode::BAD_REQUEST,
                DeviceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
                DeviceError::Transport(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Capability request failed: {}", self);
        }
        (status, Json(json!({ "success": false, "error": self.to_string() }))).into_response()
    }
}

/// 可用能力及其当前状态
#[derive(Debug, Serialize)]
pub struct CapabilityView {
    #[serde(flatten)]
    pub info: CapabilityInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilitiesResponse {
    pub device_id: String,
    pub mode: String,
    pub capabilities: Vec<CapabilityView>,
}

/// 注册成功的回执，`secret` 只在此处明文返回一次
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub device_id: String,
    pub name: String,
    pub secret: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub value: Value,
}

pub fn create_device_router(state: DeviceApiState) -> Router {
    Router::new()
        .route("/api/capabilities", get(list_capabilities))
        .route("/api/devices/register", post(register_device))
        .route("/api/devices/{id}/capabilities", get(device_capabilities))
        .route("/api/devices/{id}/capabilities/{capability}", post(execute_capability))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// 注册表全量快照 (只含描述)
async fn list_capabilities(State(state): State<DeviceApiState>) -> Json<Vec<CapabilityInfo>> {
    Json(state.registry.infos())
}

async fn device_capabilities(
    State(state): State<DeviceApiState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceCapabilitiesResponse>, ApiError> {
    let device = state
        .store
        .get_by_id(&device_id)
        .await?
        .ok_or_else(|| DeviceError::NotFound(device_id.clone()))?;

    let capabilities = state
        .registry
        .get_available_capabilities(&device)
        .iter()
        .map(|capability| CapabilityView {
            info: capability.info(),
            state: capability.state(&device),
        })
        .collect();

    Ok(Json(DeviceCapabilitiesResponse {
        mode: get_device_mode(&device).to_string(),
        device_id,
        capabilities,
    }))
}

async fn register_device(
    State(state): State<DeviceApiState>,
    body: Bytes,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RegisterRequest::default()
    } else {
        serde_json::from_slice::<RegisterRequest>(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let (device, secret) = state.store.register_device(request).await?;
    info!(device = %device.id, "Device registered via HTTP");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            device_id: device.id,
            name: device.name,
            secret,
        }),
    ))
}

/// 空请求体视为 `null`，按钮类能力无需传值
fn parse_command_body(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice::<CommandRequest>(body)
        .map(|req| req.value)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

async fn execute_capability(
    State(state): State<DeviceApiState>,
    Path((device_id, capability_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let value = parse_command_body(&body)?;
    info!(device = %device_id, capability = %capability_id, "Capability command via HTTP");

    state.registry.execute(&capability_id, &device_id, value).await?;

    Ok(Json(json!({
        "success": true,
        "deviceId": device_id,
        "capability": capability_id,
    })))
}
