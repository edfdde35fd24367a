// src/auth/middleware.rs

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use uuid::Uuid;

use super::operator::{OperatorAuthManager, SESSION_COOKIE};
use crate::config::SharedConfig;
use crate::error::{AppError, AppResult};
use crate::identity::IdentityStore;
use crate::storage::DeviceRegistry;
use crate::utils::CryptoUtils;

pub const API_KEY_HEADER: &str = "x-api-key";

/// 请求的认证类别，注入 request extensions 供处理器读取
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// 操作员浏览器会话
    Operator,
    /// 服务器自身 API 密钥（操作员工具）
    Server,
    /// 已配对设备
    Device { id: Uuid, name: String },
}

impl AuthContext {
    pub fn device_id(&self) -> Option<Uuid> {
        match self {
            AuthContext::Device { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// 审计标签
    pub fn label(&self) -> String {
        match self {
            AuthContext::Operator => "operator".to_string(),
            AuthContext::Server => "server".to_string(),
            AuthContext::Device { name, .. } => format!("device:{}", name),
        }
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub registry: Arc<DeviceRegistry>,
    pub identity: Arc<IdentityStore>,
    pub operator: Arc<OperatorAuthManager>,
}

/// 从连接信息取来源 IP
pub fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

/// 解析 Cookie 头中的会话令牌
pub fn session_cookie(request: &Request) -> Option<String> {
    let header = request.headers().get(axum::http::header::COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(SESSION_COOKIE) {
            return parts.next().map(|t| t.to_string());
        }
    }
    None
}

impl AuthState {
    /// 识别并校验请求凭证
    pub async fn authenticate(&self, request: &Request) -> AppResult<AuthContext> {
        let ip = client_ip(request);

        if let Some(header) = request.headers().get(API_KEY_HEADER) {
            let key = header
                .to_str()
                .map_err(|_| AppError::InvalidCredential)?
                .trim();
            if key.is_empty() {
                return Err(AppError::MissingCredential);
            }
            return self.authenticate_key(key, ip).await;
        }

        if let Some(token) = session_cookie(request) {
            self.operator.validate(&token, ip).await?;
            return Ok(AuthContext::Operator);
        }

        Err(AppError::MissingCredential)
    }

    /// 按密钥认证：服务器密钥或设备密钥，比较走摘要
    pub async fn authenticate_key(&self, key: &str, ip: IpAddr) -> AppResult<AuthContext> {
        if CryptoUtils::digest(key) == self.identity.api_key_digest().await {
            return Ok(AuthContext::Server);
        }

        let device = self.registry.authorize(key, ip).await?;
        Ok(AuthContext::Device {
            id: device.id,
            name: device.name,
        })
    }
}

/// 认证中间件：设备或操作员均可通过
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let context = state.authenticate(&request).await?;
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

/// 操作员专用路由的追加检查，叠在 auth_middleware 之后
pub async fn require_operator(request: Request, next: Next) -> Result<Response, AppError> {
    match request.extensions().get::<AuthContext>() {
        Some(AuthContext::Operator) | Some(AuthContext::Server) => Ok(next.run(request).await),
        Some(_) => Err(AppError::InvalidCredential),
        None => Err(AppError::MissingCredential),
    }
}

/// 能力开关检查状态
#[derive(Clone)]
pub struct ToggleState {
    pub config: SharedConfig,
    pub service: &'static str,
}

/// 路由组的能力开关中间件
pub async fn service_toggle_middleware(
    State(state): State<ToggleState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let config = state.config.get().await;
    if !config.services.is_enabled(state.service) {
        return Err(AppError::ServiceDisabled(state.service.to_string()));
    }
    Ok(next.run(request).await)
}
