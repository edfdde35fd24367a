// src/models/event.rs

use chrono::{DateTime, Utc};
use serde::Serialize;

/// WebSocket 事件类型判别符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PairingRequest,
    Notification,
    ServerStatus,
    DeviceConnected,
    DeviceDisconnected,
    TransferUpdate,
    Log,
}

/// 事件信封：按订阅者 FIFO 投递，不持久化
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub server_time: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            server_time: Utc::now(),
        }
    }
}
