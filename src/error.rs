// src/error.rs

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 统一错误响应体，`code` 为机器可读的稳定错误码
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
    pub code: String,
}

#[derive(Error, Debug)]
pub enum AppError {
    // ==================== 认证 ====================
    #[error("Missing credential")]
    MissingCredential,

    #[error("Invalid credential")]
    InvalidCredential,

    #[error("Credential has been revoked")]
    RevokedCredential,

    #[error("Service '{0}' is disabled")]
    ServiceDisabled(String),

    #[error("Too many requests")]
    RateLimited,

    // ==================== 校验 ====================
    #[error("Access to path denied: {0}")]
    PathForbidden(String),

    #[error("Invalid path: {0}")]
    PathInvalid(String),

    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    #[error("Chunk index out of range: {0}")]
    ChunkOutOfRange(String),

    #[error("Target already exists: {0}")]
    ConflictExists(String),

    #[error("Range not satisfiable")]
    RangeNotSatisfiable,

    // ==================== 传输 ====================
    #[error("Transfer is paused")]
    TransferPaused,

    #[error("Transfer is stale")]
    TransferStale,

    #[error("Transfer was cancelled")]
    TransferCancelled,

    #[error("Insufficient disk space")]
    DiskFull,

    // ==================== 配对 ====================
    #[error("Pairing request denied by operator")]
    PairingDenied,

    #[error("Pairing request timed out")]
    PairingTimeout,

    #[error("Invalid device name: {0}")]
    PairingInvalidName(String),

    // ==================== 通用 ====================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// 机器可读错误码，客户端依赖其稳定性
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MissingCredential => "missing_credential",
            AppError::InvalidCredential => "invalid_credential",
            AppError::RevokedCredential => "revoked_credential",
            AppError::ServiceDisabled(_) => "service_disabled",
            AppError::RateLimited => "rate_limited",
            AppError::PathForbidden(_) => "path_forbidden",
            AppError::PathInvalid(_) => "path_invalid",
            AppError::SizeMismatch(_) => "size_mismatch",
            AppError::ChunkOutOfRange(_) => "chunk_out_of_range",
            AppError::ConflictExists(_) => "conflict_exists",
            AppError::RangeNotSatisfiable => "range_not_satisfiable",
            AppError::TransferPaused => "transfer_paused",
            AppError::TransferStale => "transfer_stale",
            AppError::TransferCancelled => "transfer_cancelled",
            AppError::DiskFull => "disk_full",
            AppError::PairingDenied => "pairing_denied",
            AppError::PairingTimeout => "pairing_timeout",
            AppError::PairingInvalidName(_) => "pairing_invalid_name",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation_error",
            AppError::Config(_) => "config_error",
            AppError::Io(_) => "io_error",
            AppError::Json(_) => "serialization_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::MissingCredential | AppError::InvalidCredential | AppError::RevokedCredential => {
                StatusCode::UNAUTHORIZED
            }
            AppError::ServiceDisabled(_) | AppError::PathForbidden(_) | AppError::PairingDenied => {
                StatusCode::FORBIDDEN
            }
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::PathInvalid(_) | AppError::Validation(_) | AppError::PairingInvalidName(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::SizeMismatch(_)
            | AppError::ChunkOutOfRange(_)
            | AppError::ConflictExists(_)
            | AppError::TransferPaused => StatusCode::CONFLICT,
            AppError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::TransferStale | AppError::TransferCancelled => StatusCode::GONE,
            AppError::DiskFull => StatusCode::INSUFFICIENT_STORAGE,
            AppError::PairingTimeout => StatusCode::REQUEST_TIMEOUT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // 内部错误只返回事件编号，细节进日志
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let incident_id = uuid::Uuid::new_v4();
            tracing::error!(%incident_id, error = %self, "Internal server error");
            let body = Json(ErrorResponse {
                detail: format!("Internal server error (incident {})", incident_id),
                code: self.code().to_string(),
            });
            return (status, body).into_response();
        }

        tracing::warn!(code = self.code(), "Request failed: {}", self);
        let body = Json(ErrorResponse {
            detail: self.to_string(),
            code: self.code().to_string(),
        });
        (status, body).into_response()
    }
}
