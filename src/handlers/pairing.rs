// src/handlers/pairing.rs

use axum::{
    extract::{ConnectInfo, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::hub::SubscriberClass;
use crate::models::{EventEnvelope, EventKind, PairingDecision};
use crate::pairing::{Claim, PairingOutcome};
use crate::server::AppContext;
use crate::utils::sanitize_device_name;

#[derive(Debug, Deserialize)]
pub struct PairingRequestPayload {
    pub device_name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub client_version: String,
}

#[derive(Debug, Serialize)]
pub struct PairingResponse {
    pub api_key: String,
    pub cert_fingerprint: String,
}

#[derive(Debug, Deserialize)]
pub struct PairingDecisionPayload {
    pub pairing_id: Uuid,
}

/// 设备发起配对。响应阻塞至操作员决定或 60 秒超时
pub async fn request(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(payload): Json<PairingRequestPayload>,
) -> AppResult<Json<PairingResponse>> {
    let ip = addr.ip();

    if !ctx.pairing_limiter.check(ip).await {
        return Err(AppError::RateLimited);
    }

    let device_name = sanitize_device_name(&payload.device_name)?;
    tracing::info!("Pairing request from '{}' at {}", device_name, ip);

    let (pairing_id, rx, is_new) = ctx
        .broker
        .begin(device_name.clone(), payload.platform, payload.client_version, ip)
        .await;

    if is_new {
        ctx.hub
            .publish(
                SubscriberClass::Operator,
                EventEnvelope::new(
                    EventKind::PairingRequest,
                    json!({
                        "pairing_id": pairing_id,
                        "device_name": device_name,
                        "client_ip": ip,
                    }),
                ),
            )
            .await;
    }

    match ctx.broker.wait(pairing_id, rx).await {
        PairingOutcome::Approved { device_key } => {
            tracing::info!("Pairing {} approved", pairing_id);
            Ok(Json(PairingResponse {
                api_key: device_key,
                cert_fingerprint: ctx.identity.fingerprint().await?,
            }))
        }
        PairingOutcome::Denied => {
            tracing::info!("Pairing {} denied", pairing_id);
            Err(AppError::PairingDenied)
        }
        PairingOutcome::Expired => {
            tracing::warn!("Pairing {} timed out", pairing_id);
            Err(AppError::PairingTimeout)
        }
    }
}

/// 操作员批准配对：创建设备、唤醒阻塞的请求方。
/// 同一票据的重复决定是幂等空操作
pub async fn approve(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<PairingDecisionPayload>,
) -> AppResult<Json<serde_json::Value>> {
    match ctx.broker.claim(payload.pairing_id).await? {
        Claim::Granted(ticket) => {
            let device = match ctx
                .registry
                .approve(
                    ticket.device_name,
                    ticket.platform,
                    ticket.client_version,
                    ticket.client_ip,
                )
                .await
            {
                Ok(device) => device,
                Err(e) => {
                    ctx.broker.release_claim(payload.pairing_id).await;
                    return Err(e);
                }
            };

            ctx.broker
                .finish_approved(payload.pairing_id, device.device_key.clone())
                .await;
            ctx.hub.device_connected(device.id, &device.name).await;

            Ok(Json(json!({"status": "approved", "device_id": device.id})))
        }
        Claim::AlreadyDecided(prior) => Ok(Json(json!({"status": decision_label(&prior)}))),
    }
}

/// 操作员拒绝配对
pub async fn deny(
    State(ctx): State<Arc<AppContext>>,
    Json(payload): Json<PairingDecisionPayload>,
) -> AppResult<Json<serde_json::Value>> {
    let outcome = ctx.broker.deny(payload.pairing_id).await?;
    Ok(Json(json!({"status": decision_label(&outcome)})))
}

fn decision_label(decision: &PairingDecision) -> &'static str {
    match decision {
        PairingDecision::Pending => "pending",
        PairingDecision::Approved => "approved",
        PairingDecision::Denied => "denied",
        PairingDecision::Expired => "expired",
    }
}
