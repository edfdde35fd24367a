// src/handlers/transfers.rs

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::server::AppContext;

/// 清理状态概览：阈值与当前会话数
pub async fn cleanup_status(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let config = ctx.config.get().await;
    let sessions = ctx.engine.active_sessions().await;

    Json(json!({
        "stale_after_days": config.files.stale_after_days,
        "cleanup_interval_secs": config.files.cleanup_interval_secs,
        "active_sessions": sessions.len(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CleanupConfigPayload {
    pub stale_after_days: u64,
}

/// 调整过期阈值
pub async fn cleanup_config(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<CleanupConfigPayload>,
) -> AppResult<Json<serde_json::Value>> {
    if payload.stale_after_days == 0 || payload.stale_after_days > 365 {
        return Err(AppError::Validation(
            "stale_after_days must be between 1 and 365".to_string(),
        ));
    }
    ctx.config
        .update(|c| c.files.stale_after_days = payload.stale_after_days)
        .await?;
    Ok(Json(json!({"status": "ok", "stale_after_days": payload.stale_after_days})))
}

/// 立即执行过期清理，返回清理数量
pub async fn cleanup_execute(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let report = ctx.engine.cleanup_stale().await;
    Json(json!({
        "cleaned_uploads": report.cleaned_uploads,
        "cleaned_downloads": report.cleaned_downloads,
    }))
}

/// 列出进行中的传输会话
pub async fn active(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let sessions = ctx.engine.active_sessions().await;
    Json(json!({ "transfers": sessions }))
}
