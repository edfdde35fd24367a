// src/handlers/operator.rs

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::auth::middleware::session_cookie;
use crate::auth::SESSION_COOKIE;
use crate::error::{AppError, AppResult};
use crate::models::{EventEnvelope, EventKind};
use crate::server::AppContext;

#[derive(Debug, Deserialize)]
pub struct PasswordPayload {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordPayload {
    pub old_password: String,
    pub new_password: String,
}

fn session_cookie_header(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE, token
    ))
    .expect("cookie value is ascii")
}

fn clear_cookie_header() -> HeaderValue {
    HeaderValue::from_static(concat!(
        "pclink_session=; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=0"
    ))
}

/// 首次设置操作员口令，设置完成即激活移动端 API
pub async fn setup(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<PasswordPayload>,
) -> AppResult<Json<serde_json::Value>> {
    ctx.operator.setup(&payload.password).await?;

    ctx.hub
        .publish_all(EventEnvelope::new(
            EventKind::ServerStatus,
            json!({"setup_completed": true}),
        ))
        .await;
    Ok(Json(json!({"status": "ok"})))
}

/// 口令登录，签发会话 Cookie。失败次数按 IP 限速
pub async fn login(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<PasswordPayload>,
) -> AppResult<(HeaderMap, Json<serde_json::Value>)> {
    let ip = addr.ip();

    if ctx.login_limiter.is_limited(ip).await {
        return Err(AppError::RateLimited);
    }

    let token = match ctx.operator.login(&payload.password, ip).await {
        Ok(token) => token,
        Err(e) => {
            // 只有失败的尝试消耗窗口
            ctx.login_limiter.check(ip).await;
            return Err(e);
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, session_cookie_header(&token));
    Ok((headers, Json(json!({"status": "ok"}))))
}

pub async fn logout(
    State(ctx): State<Arc<AppContext>>,
    request: Request,
) -> AppResult<(HeaderMap, Json<serde_json::Value>)> {
    if let Some(token) = session_cookie(&request) {
        ctx.operator.logout(&token).await;
    }
    let mut headers = HeaderMap::new();
    headers.insert(header::SET_COOKIE, clear_cookie_header());
    Ok((headers, Json(json!({"status": "ok"}))))
}

pub async fn change_password(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<ChangePasswordPayload>,
) -> AppResult<Json<serde_json::Value>> {
    ctx.operator
        .change_password(&payload.old_password, &payload.new_password)
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

/// 公开的认证状态：是否完成设置、当前请求是否已登录
pub async fn auth_status(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Json<serde_json::Value> {
    let authenticated = match session_cookie(&request) {
        Some(token) => ctx.operator.validate(&token, addr.ip()).await.is_ok(),
        None => false,
    };

    Json(json!({
        "setup_completed": ctx.operator.setup_completed().await,
        "authenticated": authenticated,
        "active_sessions": ctx.operator.active_sessions().await,
    }))
}

/// 会话有效性检查，走操作员中间件
pub async fn auth_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// 轮换服务器 API 密钥并广播状态事件。
/// 既有设备密钥按策略随之全部失效
pub async fn rotate_api_key(
    State(ctx): State<Arc<AppContext>>,
) -> AppResult<Json<serde_json::Value>> {
    ctx.identity.rotate_api_key().await?;
    let revoked = ctx.registry.revoke_all().await?;

    ctx.hub
        .publish_all(EventEnvelope::new(
            EventKind::ServerStatus,
            json!({"api_key_rotated": true, "devices_revoked": revoked}),
        ))
        .await;
    Ok(Json(json!({"status": "ok", "devices_revoked": revoked})))
}
