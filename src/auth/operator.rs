// src/auth/operator.rs

use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

use crate::config::SharedConfig;
use crate::error::{AppError, AppResult};
use crate::models::OperatorSession;
use crate::utils::CryptoUtils;

pub const SESSION_COOKIE: &str = "pclink_session";
const MIN_PASSWORD_LEN: usize = 8;

/// 操作员口令与浏览器会话管理。
/// 会话独立于监听器生命周期，restart 不会让 Cookie 失效。
pub struct OperatorAuthManager {
    config: SharedConfig,
    /// 会话令牌摘要 -> 会话
    sessions: RwLock<HashMap<String, OperatorSession>>,
}

impl OperatorAuthManager {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn setup_completed(&self) -> bool {
        self.config.setup_completed().await
    }

    /// 首次设置口令，只允许一次
    pub async fn setup(&self, password: &str) -> AppResult<()> {
        if self.setup_completed().await {
            return Err(AppError::Validation("setup already completed".to_string()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let hash = CryptoUtils::hash_password(password)?;
        self.config
            .update(|c| {
                c.auth.password_hash = Some(hash);
                c.auth.setup_completed = true;
            })
            .await?;

        tracing::info!("Operator password setup completed");
        Ok(())
    }

    async fn verify_password(&self, password: &str) -> bool {
        let config = self.config.get().await;
        match &config.auth.password_hash {
            Some(hash) => CryptoUtils::verify_password(password, hash),
            None => false,
        }
    }

    /// 口令正确时创建会话并返回明文令牌
    pub async fn login(&self, password: &str, ip: IpAddr) -> AppResult<String> {
        if !self.setup_completed().await {
            return Err(AppError::Validation("setup not completed".to_string()));
        }
        if !self.verify_password(password).await {
            return Err(AppError::InvalidCredential);
        }

        let token = CryptoUtils::generate_session_token();
        let session = OperatorSession::new(ip);
        self.sessions
            .write()
            .await
            .insert(CryptoUtils::digest(&token), session);

        tracing::info!("Operator session created for {}", ip);
        Ok(token)
    }

    /// 校验会话：过期即回收，来源 IP 必须与创建时一致
    pub async fn validate(&self, token: &str, ip: IpAddr) -> AppResult<()> {
        let digest = CryptoUtils::digest(token);
        let mut sessions = self.sessions.write().await;

        let Some(session) = sessions.get_mut(&digest) else {
            return Err(AppError::InvalidCredential);
        };

        if session.is_expired(Utc::now()) {
            sessions.remove(&digest);
            return Err(AppError::InvalidCredential);
        }
        if session.bound_ip != ip {
            tracing::warn!(
                "Operator session IP mismatch: bound {} vs request {}",
                session.bound_ip,
                ip
            );
            return Err(AppError::InvalidCredential);
        }

        session.touch();
        Ok(())
    }

    pub async fn logout(&self, token: &str) {
        self.sessions.write().await.remove(&CryptoUtils::digest(token));
    }

    /// 改口令成功后吊销所有会话
    pub async fn change_password(&self, old: &str, new: &str) -> AppResult<()> {
        if !self.verify_password(old).await {
            return Err(AppError::InvalidCredential);
        }
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let hash = CryptoUtils::hash_password(new)?;
        self.config
            .update(|c| c.auth.password_hash = Some(hash))
            .await?;
        self.sessions.write().await.clear();

        tracing::info!("Operator password changed, all sessions revoked");
        Ok(())
    }

    pub async fn active_sessions(&self) -> usize {
        let now = Utc::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.is_expired(now))
            .count()
    }
}
