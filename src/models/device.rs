// src/models/device.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 已配对设备，`device_key` 是其长期凭证
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub platform: String,
    #[serde(default)]
    pub client_version: String,
    pub ip: String,
    pub device_key: String,
    pub approved_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(name: String, platform: String, client_version: String, ip: String, device_key: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            platform,
            client_version,
            ip,
            device_key,
            approved_at: now,
            last_seen: now,
        }
    }
}

/// 设备列表响应项，不包含凭证
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: Uuid,
    pub name: String,
    pub platform: String,
    pub client_version: String,
    pub ip: String,
    pub approved_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_online: bool,
}

impl DeviceInfo {
    pub fn from_device(device: &Device, is_online: bool) -> Self {
        Self {
            id: device.id,
            name: device.name.clone(),
            platform: device.platform.clone(),
            client_version: device.client_version.clone(),
            ip: device.ip.clone(),
            approved_at: device.approved_at,
            last_seen: device.last_seen,
            is_online,
        }
    }
}
