// src/handlers/devices.rs

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::DeviceInfo;
use crate::server::AppContext;

#[derive(Debug, Deserialize)]
pub struct RevokePayload {
    pub device_id: Uuid,
}

/// 设备列表，附 WebSocket 在线状态
pub async fn list(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let mut devices = Vec::new();
    for device in ctx.registry.list().await {
        let is_online = ctx.hub.is_device_online(device.id).await;
        devices.push(DeviceInfo::from_device(&device, is_online));
    }
    Json(json!({ "devices": devices }))
}

/// 吊销单个设备
pub async fn revoke(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<RevokePayload>,
) -> AppResult<Json<serde_json::Value>> {
    let device = ctx
        .registry
        .revoke(payload.device_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("device {}", payload.device_id)))?;

    ctx.hub.device_disconnected(device.id, &device.name).await;
    Ok(Json(json!({"status": "ok", "device_id": device.id})))
}

/// 吊销全部设备
pub async fn remove_all(State(ctx): State<Arc<AppContext>>) -> AppResult<Json<serde_json::Value>> {
    let count = ctx.registry.revoke_all().await?;
    Ok(Json(json!({"status": "ok", "revoked": count})))
}
