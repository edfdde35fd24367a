// src/models/session.rs

use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;

/// 浏览器会话有效期
pub const SESSION_LIFETIME_HOURS: i64 = 24;

/// 操作员浏览器会话，由 HTTP-only Cookie 携带
#[derive(Debug, Clone)]
pub struct OperatorSession {
    pub client_ip: IpAddr,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 会话绑定的来源 IP，不匹配即无效
    pub bound_ip: IpAddr,
}

impl OperatorSession {
    pub fn new(client_ip: IpAddr) -> Self {
        let now = Utc::now();
        Self {
            client_ip,
            created_at: now,
            expires_at: now + Duration::hours(SESSION_LIFETIME_HOURS),
            bound_ip: client_ip,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 活动时滑动续期
    pub fn touch(&mut self) {
        self.expires_at = Utc::now() + Duration::hours(SESSION_LIFETIME_HOURS);
    }
}
