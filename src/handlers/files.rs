// src/handlers/files.rs

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::{AppError, AppResult};
use crate::models::ConflictPolicy;
use crate::server::AppContext;
use crate::transfer::parse_range;

/// 流式读取的缓冲大小
const READ_BUFFER: usize = 64 * 1024;

fn owner_id(auth: &AuthContext) -> Uuid {
    // 服务器密钥与操作员工具记为 nil 所有者
    auth.device_id().unwrap_or(Uuid::nil())
}

/// 通配路由捕获的路径不带前导分隔符，还原为绝对路径。
/// Windows 盘符路径本身就是绝对的，原样保留
fn absolutize(raw: String) -> String {
    if std::path::Path::new(&raw).is_absolute() {
        raw
    } else {
        format!("/{}", raw)
    }
}

// ==================== 分片上传 ====================

#[derive(Debug, Deserialize)]
pub struct UploadInitiatePayload {
    pub target_path: String,
    pub total_size: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Serialize)]
pub struct UploadInitiateResponse {
    pub transfer_id: Uuid,
    pub chunk_size: u64,
}

pub async fn initiate_upload(
    State(ctx): State<Arc<AppContext>>,
    Extension(auth): Extension<AuthContext>,
    Json(payload): Json<UploadInitiatePayload>,
) -> AppResult<Json<UploadInitiateResponse>> {
    let progress = ctx
        .engine
        .initiate_upload(
            owner_id(&auth),
            &payload.target_path,
            payload.total_size,
            payload.conflict_policy,
        )
        .await?;

    Ok(Json(UploadInitiateResponse {
        transfer_id: progress.transfer_id,
        chunk_size: progress.chunk_size,
    }))
}

/// 分片写入。暂停中的会话返回 409 与恢复元数据
pub async fn put_chunk(
    State(ctx): State<Arc<AppContext>>,
    Path((id, chunk_index)): Path<(Uuid, u32)>,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    match ctx.engine.put_chunk(id, chunk_index, &body).await {
        Ok(progress) => Ok(Json(progress).into_response()),
        Err(AppError::TransferPaused) => {
            let progress = ctx.engine.upload_status(id).await?;
            let body = Json(json!({
                "detail": "Transfer is paused",
                "code": "transfer_paused",
                "received_bytes": progress.received_bytes,
                "written_chunks": progress.written_chunks,
            }));
            Ok((StatusCode::CONFLICT, body).into_response())
        }
        Err(e) => Err(e),
    }
}

pub async fn upload_status(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<crate::transfer::UploadProgress>> {
    Ok(Json(ctx.engine.upload_status(id).await?))
}

pub async fn pause_upload(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<crate::transfer::UploadProgress>> {
    Ok(Json(ctx.engine.pause_upload(id).await?))
}

pub async fn resume_upload(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<crate::transfer::UploadProgress>> {
    Ok(Json(ctx.engine.resume_upload(id).await?))
}

pub async fn cancel_upload(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    ctx.engine.cancel_upload(id).await?;
    Ok(Json(json!({"status": "cancelled"})))
}

/// 客户端传输参数
pub async fn transfer_config(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let config = ctx.config.get().await;
    Json(json!({
        "chunk_size": config.files.chunk_size,
        "max_upload_mb": config.files.max_upload_mb,
        "supports_resume": true,
        "supports_pause": true,
        "supports_concurrent_chunks": true,
        "supports_range_requests": true,
    }))
}

// ==================== 直传快路径 ====================

#[derive(Debug, Deserialize)]
pub struct DirectUploadQuery {
    #[serde(default)]
    pub conflict_policy: Option<ConflictPolicy>,
}

/// 小文件单次上传，不支持续传
pub async fn direct_upload(
    State(ctx): State<Arc<AppContext>>,
    Path(path): Path<String>,
    Query(query): Query<DirectUploadQuery>,
    body: Body,
) -> AppResult<Json<serde_json::Value>> {
    let policy = query.conflict_policy.unwrap_or(ConflictPolicy::KeepBoth);
    let stream = body.into_data_stream();

    let (final_path, written) = ctx
        .engine
        .direct_upload(&absolutize(path), policy, stream)
        .await?;
    Ok(Json(json!({
        "status": "completed",
        "path": final_path,
        "bytes_written": written,
    })))
}

// ==================== 下载 ====================

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub path: String,
}

/// Range 下载，Content-Disposition 标记为附件
pub async fn download(
    State(ctx): State<Arc<AppContext>>,
    Extension(auth): Extension<AuthContext>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    serve_file(&ctx, owner_id(&auth), &absolutize(path), &headers, true).await
}

/// 媒体流：同一 Range 路径，内联播放
pub async fn stream(
    State(ctx): State<Arc<AppContext>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    serve_file(&ctx, owner_id(&auth), &query.path, &headers, false).await
}

async fn serve_file(
    ctx: &AppContext,
    owner: Uuid,
    raw_path: &str,
    headers: &HeaderMap,
    attachment: bool,
) -> AppResult<Response> {
    let source = ctx.engine.open_download(owner, raw_path).await?;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let range = parse_range(range_header, source.file_size)?;

    let mut file = tokio::fs::File::open(&source.path).await?;
    let mime = mime_guess::from_path(&source.path).first_or_octet_stream();
    let file_name = source
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download")
        .to_string();

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.as_ref()).unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&file_name, attachment),
    );

    let (status, start, end) = match range {
        Some((start, end)) => {
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, source.file_size))
                    .expect("range header is ascii"),
            );
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        None => (StatusCode::OK, 0, source.file_size.saturating_sub(1)),
    };

    let body = if source.file_size == 0 {
        Body::empty()
    } else {
        file.seek(SeekFrom::Start(start)).await?;
        let len = end - start + 1;
        let reader = ReaderStream::with_capacity(file.take(len), READ_BUFFER);
        Body::from_stream(reader)
    };
    let content_length = if source.file_size == 0 { 0 } else { end - start + 1 };
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&content_length.to_string()).expect("length is ascii"),
    );

    ctx.engine
        .record_download_progress(source.session_id, end + 1)
        .await;

    Ok((status, response_headers, body).into_response())
}

/// RFC 5987 文件名编码，非 ASCII 用 filename* 形式
fn content_disposition(file_name: &str, attachment: bool) -> HeaderValue {
    let kind = if attachment { "attachment" } else { "inline" };

    if file_name.is_ascii() && !file_name.contains(['"', '\\']) {
        HeaderValue::from_str(&format!("{}; filename=\"{}\"", kind, file_name))
            .unwrap_or(HeaderValue::from_static("attachment"))
    } else {
        let encoded: String = file_name
            .bytes()
            .map(|b| {
                if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b'~') {
                    (b as char).to_string()
                } else {
                    format!("%{:02X}", b)
                }
            })
            .collect();
        HeaderValue::from_str(&format!("{}; filename*=UTF-8''{}", kind, encoded))
            .unwrap_or(HeaderValue::from_static("attachment"))
    }
}
