// src/handlers/server_ctl.rs

use axum::{extract::State, Json};
use serde_json::json;
use std::sync::Arc;

use crate::error::AppResult;
use crate::server::{self, AppContext};

/// 启动监听器（已在运行时为空操作）
pub async fn start(State(ctx): State<Arc<AppContext>>) -> AppResult<Json<serde_json::Value>> {
    server::start_listener(ctx).await?;
    Ok(Json(json!({"status": "running"})))
}

/// 停止监听器。操作员会话保留在内存，重新启动后 Cookie 依旧有效
pub async fn stop(State(ctx): State<Arc<AppContext>>) -> AppResult<Json<serde_json::Value>> {
    server::stop_listener(&ctx).await;
    Ok(Json(json!({"status": "stopped"})))
}

/// 以相同配置重启监听器
pub async fn restart(State(ctx): State<Arc<AppContext>>) -> AppResult<Json<serde_json::Value>> {
    server::restart_listener(ctx).await?;
    Ok(Json(json!({"status": "restarting"})))
}

/// 结束整个进程
pub async fn shutdown(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    tracing::info!("Shutdown requested by operator");
    let _ = ctx.shutdown_tx.send(()).await;
    Json(json!({"status": "shutting_down"}))
}
