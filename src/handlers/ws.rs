// src/handlers/ws.rs

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, Request, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::auth::middleware::session_cookie;
use crate::auth::AuthContext;
use crate::error::{AppError, AppResult};
use crate::hub::SubscriberClass;
use crate::server::AppContext;

/// 心跳间隔与空闲断开阈值
const PING_INTERVAL: Duration = Duration::from_secs(20);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
}

/// 设备事件流。凭证经查询参数传入（移动端 WebSocket 无法自定义头）
pub async fn device_ws(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
) -> AppResult<Response> {
    let auth = ctx
        .auth_state()
        .authenticate_key(&query.token, addr.ip())
        .await?;

    Ok(ws.on_upgrade(move |socket| device_socket(socket, auth, ctx)))
}

async fn device_socket(socket: WebSocket, auth: AuthContext, ctx: Arc<AppContext>) {
    let (owner, liveness) = match &auth {
        AuthContext::Device { id, name } => (id.to_string(), Some((*id, name.clone()))),
        _ => ("server".to_string(), None),
    };

    let (key, events) = ctx.hub.subscribe(SubscriberClass::Device, owner).await;
    if let Some((id, name)) = &liveness {
        // 设备 WebSocket 是权威在线信号
        ctx.hub.device_connected(*id, name).await;
    }
    tracing::info!("Device WebSocket connected: {}", auth.label());

    run_socket(socket, events).await;

    ctx.hub.unsubscribe(SubscriberClass::Device, &key).await;
    if let Some((id, name)) = &liveness {
        ctx.hub.device_disconnected(*id, name).await;
    }
    tracing::info!("Device WebSocket disconnected: {}", auth.label());
}

/// 操作员事件流，Cookie 认证
pub async fn operator_ws(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> AppResult<Response> {
    let token = session_cookie(&request).ok_or(AppError::MissingCredential)?;
    ctx.operator.validate(&token, addr.ip()).await?;

    Ok(ws.on_upgrade(move |socket| operator_socket(socket, ctx)))
}

async fn operator_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let (key, events) = ctx
        .hub
        .subscribe(SubscriberClass::Operator, "operator".to_string())
        .await;
    tracing::info!("Operator WebSocket connected");

    run_socket(socket, events).await;

    ctx.hub.unsubscribe(SubscriberClass::Operator, &key).await;
    tracing::info!("Operator WebSocket disconnected");
}

/// 事件外发 + 心跳循环。事件通道被枢纽关闭（慢消费者）时连接随之关闭
async fn run_socket(
    socket: WebSocket,
    mut events: tokio::sync::mpsc::Receiver<crate::models::EventEnvelope>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            envelope = events.recv() => {
                let Some(envelope) = envelope else { break };
                let json = match serde_json::to_string(&envelope) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::warn!("Event serialization failed: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // 入站指令不属于核心，消息只当作活跃信号
                        last_activity = Instant::now();
                    }
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }

            _ = ping_timer.tick() => {
                if last_activity.elapsed() > IDLE_TIMEOUT {
                    tracing::info!("WebSocket idle timeout, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
}
