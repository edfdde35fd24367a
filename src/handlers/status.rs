// src/handlers/status.rs

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::server::AppContext;

/// 公开的存活探针与功能开关一览
pub async fn status(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let config = ctx.config.get().await;
    let (device_subs, _) = ctx.hub.subscriber_counts().await;

    Json(json!({
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "setup_completed": config.auth.setup_completed,
        "connected_devices": device_subs,
        "services": config.services,
        "extensions_path": std::env::var("PCLINK_EXTENSIONS_PATH").ok(),
        "uptime_secs": (chrono::Utc::now() - ctx.started_at).num_seconds(),
    }))
}

/// 认证存活探针
pub async fn ping() -> Json<serde_json::Value> {
    Json(json!({"status": "pong"}))
}

#[derive(Debug, Serialize)]
pub struct QrPayload {
    pub protocol: String,
    pub ip: String,
    pub port: u16,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "certFingerprint")]
    pub cert_fingerprint: String,
}

/// 配对引导载荷，仅在首次设置完成后提供
pub async fn qr_payload(State(ctx): State<Arc<AppContext>>) -> AppResult<Json<QrPayload>> {
    let config = ctx.config.get().await;
    if !config.auth.setup_completed {
        return Err(AppError::ServiceDisabled("mobile_api".to_string()));
    }

    let ip = crate::utils::local_ipv4_addresses()
        .first()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    Ok(Json(QrPayload {
        protocol: "https".to_string(),
        ip,
        port: config.server.port,
        api_key: ctx.identity.api_key().await,
        cert_fingerprint: ctx.identity.fingerprint().await?,
    }))
}
