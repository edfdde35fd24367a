// src/models/pairing.rs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use uuid::Uuid;

/// 配对票据状态机：Pending 只会迁移一次，终态不可逆
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingDecision {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl PairingDecision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PairingDecision::Pending)
    }
}

/// 进行中的配对请求，仅存内存
#[derive(Debug, Clone)]
pub struct PairingTicket {
    pub pairing_id: Uuid,
    pub device_name: String,
    pub platform: String,
    pub client_version: String,
    pub client_ip: IpAddr,
    pub created_at: DateTime<Utc>,
    pub decision: PairingDecision,
    /// 批准后写入，等待方读取后随票据一起丢弃
    pub result_device_key: Option<String>,
}

impl PairingTicket {
    pub fn new(device_name: String, platform: String, client_version: String, client_ip: IpAddr) -> Self {
        Self {
            pairing_id: Uuid::new_v4(),
            device_name,
            platform,
            client_version,
            client_ip,
            created_at: Utc::now(),
            decision: PairingDecision::Pending,
            result_device_key: None,
        }
    }
}
