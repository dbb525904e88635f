//! Thin admin HTTP surface: CRUD over the device registry, EEP store and
//! mapping store, plus read access to the telegram ring buffer and a
//! gateway send endpoint. No logic of its own beyond routing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use log::warn;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::sync::mpsc::Sender;

use enbridge::buffer::TelegramBuffer;
use enbridge::command::CommandRequest;
use enbridge::device::{Device, DeviceRegistry};
use enbridge::eep::{EepProfile, EepStore};
use enbridge::mapping::{EntityMap, MappingStore};

use crate::config::Config;
use crate::mqtt::MqttHandle;
use crate::reader::FrameQueue;

pub struct ServerState {
    pub config: Config,
    pub registry: Arc<RwLock<DeviceRegistry>>,
    pub eep_store: Arc<RwLock<EepStore>>,
    pub mappings: Arc<RwLock<MappingStore>>,
    pub buffer: Arc<RwLock<TelegramBuffer>>,
    pub mqtt: MqttHandle,
    pub command_tx: Sender<CommandRequest>,
    pub transport_connected: Arc<AtomicBool>,
    pub frame_queue: Arc<FrameQueue>,
}

type ApiError = (StatusCode, String);

fn bad_request(message: impl ToString) -> ApiError {
    (StatusCode::BAD_REQUEST, message.to_string())
}

// --- devices ---

pub async fn get_devices(State(state): State<Arc<ServerState>>) -> Json<Vec<Device>> {
    let registry = state.registry.read().await;
    Json(registry.all().cloned().collect())
}

pub async fn add_device(
    State(state): State<Arc<ServerState>>,
    Json(device): Json<Device>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    if device.name.is_empty() {
        return Err(bad_request("device name must not be empty"));
    }
    let name = device.name.clone();
    state
        .registry
        .write()
        .await
        .add(device.clone())
        .await
        .map_err(bad_request)?;
    state.mqtt.publish_discovery(&name).await;
    Ok((StatusCode::CREATED, Json(device)))
}

pub async fn update_device(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(device): Json<Device>,
) -> Result<Json<Device>, ApiError> {
    state
        .registry
        .write()
        .await
        .update(&name, device.clone())
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    state.mqtt.publish_discovery(&name).await;
    Ok(Json(device))
}

pub async fn delete_device(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Retract the HA entities while the registry still knows the device.
    state.mqtt.remove_discovery(&name).await;
    state
        .registry
        .write()
        .await
        .delete(&name)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// --- EEP profiles ---

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

pub async fn get_profiles(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<EepProfile>> {
    let eep_store = state.eep_store.read().await;
    let profiles = match params.q.as_deref() {
        Some(query) => eep_store.search(query).into_iter().cloned().collect(),
        None => eep_store.all().cloned().collect(),
    };
    Json(profiles)
}

pub async fn get_profile(
    State(state): State<Arc<ServerState>>,
    Path(eep_id): Path<String>,
) -> Result<Json<EepProfile>, ApiError> {
    let eep_store = state.eep_store.read().await;
    eep_store
        .get(&eep_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no profile {eep_id}")))
}

pub async fn add_custom_profile(
    State(state): State<Arc<ServerState>>,
    Json(profile): Json<EepProfile>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = state
        .eep_store
        .write()
        .await
        .save_custom(profile)
        .await
        .map_err(bad_request)?;
    Ok((StatusCode::CREATED, Json(json!({ "eep_id": id }))))
}

pub async fn delete_custom_profile(
    State(state): State<Arc<ServerState>>,
    Path(eep_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .eep_store
        .write()
        .await
        .delete_custom(&eep_id)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// --- mappings ---

pub async fn get_mappings(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let mappings = state.mappings.read().await;
    Json(json!(mappings.all()))
}

pub async fn get_mapping(
    State(state): State<Arc<ServerState>>,
    Path(eep_id): Path<String>,
) -> Json<EntityMap> {
    let mappings = state.mappings.read().await;
    Json(mappings.get_mapping(&eep_id))
}

pub async fn set_mapping(
    State(state): State<Arc<ServerState>>,
    Path(eep_id): Path<String>,
    Json(mapping): Json<EntityMap>,
) -> Result<StatusCode, ApiError> {
    state
        .mappings
        .write()
        .await
        .set_mapping(&eep_id, mapping)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_mapping(
    State(state): State<Arc<ServerState>>,
    Path(eep_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .mappings
        .write()
        .await
        .delete_mapping(&eep_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("no custom mapping {eep_id}")))
    }
}

// --- telegrams ---

#[derive(Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

pub async fn get_telegrams(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<LimitParams>,
) -> Json<Value> {
    let buffer = state.buffer.read().await;
    Json(json!(buffer.recent(params.limit.unwrap_or(50))))
}

pub async fn get_unknown_devices(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let buffer = state.buffer.read().await;
    Json(json!(buffer.unknown_devices()))
}

pub async fn get_telegram_stats(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let buffer = state.buffer.read().await;
    Json(json!(buffer.stats()))
}

// --- gateway ---

pub async fn get_gateway_info(State(state): State<Arc<ServerState>>) -> Json<Value> {
    Json(json!({
        "connected": state.transport_connected.load(Ordering::Relaxed),
        "port": state.config.enocean_port,
        "is_tcp": state.config.enocean_port.starts_with("tcp:"),
        "mqtt_connected": state.mqtt.is_connected(),
        "pending_frames": state.frame_queue.len(),
        "dropped_frames": state.frame_queue.dropped(),
    }))
}

#[derive(Deserialize)]
pub struct SendCommandBody {
    pub device_name: String,
    pub command: String,
    #[serde(default)]
    pub value: Option<Value>,
}

pub async fn send_command(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SendCommandBody>,
) -> Result<Json<Value>, ApiError> {
    {
        let registry = state.registry.read().await;
        let device = registry
            .get(&body.device_name)
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no device {}", body.device_name)))?;
        if device.sender_id.is_empty() {
            return Err(bad_request("device has no sender_id configured"));
        }
    }

    let request = CommandRequest::new(&body.device_name, &body.command, body.value);
    if state.command_tx.send(request).await.is_err() {
        warn!("dispatcher is gone, dropping admin command");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "dispatcher unavailable".to_string(),
        ));
    }

    Ok(Json(json!({
        "status": "sent",
        "device": body.device_name,
        "command": body.command,
    })))
}
