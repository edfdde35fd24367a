// src/transfer/download.rs

use std::path::PathBuf;
use uuid::Uuid;

use super::TransferEngine;
use crate::error::{AppError, AppResult};
use crate::models::{TransferDirection, TransferSession, TransferState};
use crate::storage::resolve_existing_path;

/// 解析 Range 头。支持 `bytes=a-b` 与 `bytes=a-`，
/// 返回闭区间 (start, end)；None 表示整个文件
pub fn parse_range(header: Option<&str>, file_size: u64) -> AppResult<Option<(u64, u64)>> {
    let Some(raw) = header else {
        return Ok(None);
    };

    let value = raw
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::Validation(format!("invalid Range header: {}", raw)))?;
    let mut parts = value.splitn(2, '-');
    let start_str = parts.next().unwrap_or("");
    let end_str = parts.next().unwrap_or("");

    let start: u64 = start_str
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid Range header: {}", raw)))?;

    let end: u64 = if end_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        end_str
            .parse()
            .map_err(|_| AppError::Validation(format!("invalid Range header: {}", raw)))?
    };

    if start >= file_size || end < start {
        return Err(AppError::RangeNotSatisfiable);
    }
    // 超出文件尾的 end 截断到最后一个字节
    Ok(Some((start, end.min(file_size.saturating_sub(1)))))
}

/// 已校验的下载目标
pub struct DownloadSource {
    pub session_id: Uuid,
    pub path: PathBuf,
    pub file_size: u64,
}

impl TransferEngine {
    /// 打开下载：校验路径、建立或复用会话
    pub async fn open_download(&self, owner: Uuid, raw_path: &str) -> AppResult<DownloadSource> {
        let config = self.config.get().await;
        let path = resolve_existing_path(raw_path, &config.files.allowed_roots).await?;

        let meta = tokio::fs::metadata(&path).await?;
        if meta.is_dir() {
            return Err(AppError::ConflictExists(format!(
                "path is a directory: {}",
                path.display()
            )));
        }
        let file_size = meta.len();

        // 同一文件的进行中会话直接复用
        {
            let downloads = self.downloads.read().await;
            if let Some(existing) = downloads
                .values()
                .find(|s| s.target_path == path && s.owner_device_id == owner && !s.state.is_terminal())
            {
                return Ok(DownloadSource {
                    session_id: existing.transfer_id,
                    path,
                    file_size,
                });
            }
        }

        let session = TransferSession::new_download(owner, path.clone(), file_size);
        let id = session.transfer_id;
        self.catalog.save(&session).await?;
        self.downloads.write().await.insert(id, session);

        tracing::info!("Opened download session {} for {}", id, path.display());
        Ok(DownloadSource {
            session_id: id,
            path,
            file_size,
        })
    }

    /// 记录发送进度；发完最后一个字节即退休会话
    pub async fn record_download_progress(&self, id: Uuid, end_byte_exclusive: u64) {
        let mut finished = false;
        {
            let mut downloads = self.downloads.write().await;
            if let Some(session) = downloads.get_mut(&id) {
                // 字节数单调不减
                if end_byte_exclusive > session.transferred_bytes {
                    session.transferred_bytes = end_byte_exclusive;
                }
                session.last_activity = chrono::Utc::now();
                if session.transferred_bytes >= session.total_size {
                    session.state = TransferState::Completed;
                    finished = true;
                }
                let _ = self.catalog.save(session).await;
                self.emit_update(session).await;
            }
        }
        if finished {
            if let Some(session) = self.downloads.write().await.remove(&id) {
                self.catalog.remove_meta(session.transfer_id).await;
                tracing::info!("Download session {} completed", id);
            }
        }
    }

    pub async fn download_sessions(&self) -> Vec<TransferSession> {
        self.downloads
            .read()
            .await
            .values()
            .filter(|s| s.direction == TransferDirection::Download)
            .cloned()
            .collect()
    }
}
