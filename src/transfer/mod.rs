// src/transfer/mod.rs

pub mod catalog;
pub mod cleanup;
pub mod download;

pub use catalog::TransferCatalog;
pub use cleanup::CleanupReport;
pub use download::parse_range;

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::SharedConfig;
use crate::error::{AppError, AppResult};
use crate::hub::SessionHub;
use crate::models::{ConflictPolicy, EventEnvelope, EventKind, TransferDirection, TransferSession, TransferState};
use crate::storage::resolve_target_path;

/// 分片写入协调对象：同一 (会话, 下标) 的并发 PUT 在此互斥
struct ChunkRecord {
    written: bool,
}

struct UploadSession {
    staging: PathBuf,
    meta: Mutex<TransferSession>,
    chunks: Mutex<HashMap<u32, Arc<Mutex<ChunkRecord>>>>,
}

/// 上传进度快照，也是暂停时 409 响应的恢复元数据
#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub transfer_id: Uuid,
    pub state: TransferState,
    pub received_bytes: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    pub written_chunks: Vec<u32>,
}

impl UploadProgress {
    fn from_session(session: &TransferSession) -> Self {
        Self {
            transfer_id: session.transfer_id,
            state: session.state,
            received_bytes: session.transferred_bytes,
            total_size: session.total_size,
            chunk_size: session.chunk_size,
            written_chunks: session.written_chunks.iter().copied().collect(),
        }
    }
}

/// 传输引擎：断点续传上传、Range 下载与过期清理
pub struct TransferEngine {
    catalog: TransferCatalog,
    config: SharedConfig,
    hub: Arc<SessionHub>,
    uploads: RwLock<HashMap<Uuid, Arc<UploadSession>>>,
    downloads: RwLock<HashMap<Uuid, TransferSession>>,
}

fn is_disk_full(e: &std::io::Error) -> bool {
    // ENOSPC / ERROR_DISK_FULL
    matches!(e.raw_os_error(), Some(28) | Some(112))
}

impl TransferEngine {
    /// 初始化并恢复磁盘目录中的非终态会话
    pub async fn new(
        data_dir: &Path,
        config: SharedConfig,
        hub: Arc<SessionHub>,
    ) -> AppResult<Arc<Self>> {
        let catalog = TransferCatalog::new(data_dir).await?;
        let engine = Self {
            catalog,
            config,
            hub,
            uploads: RwLock::new(HashMap::new()),
            downloads: RwLock::new(HashMap::new()),
        };
        engine.recover().await?;
        Ok(Arc::new(engine))
    }

    /// 重启恢复：Active/Paused 上传重建内存态，终态条目清理掉
    async fn recover(&self) -> AppResult<()> {
        let mut restored_uploads = 0usize;
        let mut restored_downloads = 0usize;

        for session in self.catalog.load_all().await? {
            let id = session.transfer_id;
            if session.state.is_terminal() {
                self.catalog.remove_meta(id).await;
                self.catalog.remove_staging(id).await;
                continue;
            }

            match session.direction {
                TransferDirection::Upload => {
                    let staging = self.catalog.staging_path(id);
                    if !staging.exists() {
                        tracing::warn!("Upload {} lost its staging file, dropping", id);
                        self.catalog.remove_meta(id).await;
                        continue;
                    }
                    let mut chunks = HashMap::new();
                    for index in &session.written_chunks {
                        chunks.insert(*index, Arc::new(Mutex::new(ChunkRecord { written: true })));
                    }
                    self.uploads.write().await.insert(
                        id,
                        Arc::new(UploadSession {
                            staging,
                            meta: Mutex::new(session),
                            chunks: Mutex::new(chunks),
                        }),
                    );
                    restored_uploads += 1;
                }
                TransferDirection::Download => {
                    if !session.target_path.exists() {
                        self.catalog.remove_meta(id).await;
                        continue;
                    }
                    self.downloads.write().await.insert(id, session);
                    restored_downloads += 1;
                }
            }
        }

        if restored_uploads > 0 || restored_downloads > 0 {
            tracing::info!(
                "Restored {} upload(s) and {} download(s) from catalog",
                restored_uploads,
                restored_downloads
            );
        }
        Ok(())
    }

    async fn emit_update(&self, session: &TransferSession) {
        self.hub
            .publish_all(EventEnvelope::new(
                EventKind::TransferUpdate,
                json!({
                    "transfer_id": session.transfer_id,
                    "direction": session.direction,
                    "state": session.state,
                    "transferred_bytes": session.transferred_bytes,
                    "total_size": session.total_size,
                }),
            ))
            .await;
    }

    // ==================== 上传 ====================

    /// 发起分片上传
    pub async fn initiate_upload(
        &self,
        owner: Uuid,
        target_raw: &str,
        total_size: u64,
        conflict_policy: ConflictPolicy,
    ) -> AppResult<UploadProgress> {
        let config = self.config.get().await;
        let target = resolve_target_path(target_raw, &config.files.allowed_roots).await?;

        if conflict_policy == ConflictPolicy::Abort && tokio::fs::metadata(&target).await.is_ok() {
            return Err(AppError::ConflictExists(target.display().to_string()));
        }

        let session = TransferSession::new_upload(
            owner,
            target,
            total_size,
            config.files.chunk_size,
            conflict_policy,
        );
        let id = session.transfer_id;

        // 预分配暂存文件，之后按偏移随机写
        let staging = self.catalog.staging_path(id);
        let file = tokio::fs::File::create(&staging).await?;
        file.set_len(total_size).await?;
        drop(file);

        self.catalog.save(&session).await?;
        self.emit_update(&session).await;

        let progress = UploadProgress::from_session(&session);
        self.uploads.write().await.insert(
            id,
            Arc::new(UploadSession {
                staging,
                meta: Mutex::new(session),
                chunks: Mutex::new(HashMap::new()),
            }),
        );

        tracing::info!("Initiated upload {} ({} bytes)", id, total_size);
        Ok(progress)
    }

    async fn upload(&self, id: Uuid) -> AppResult<Arc<UploadSession>> {
        self.uploads
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("upload session {}", id)))
    }

    /// 不变量被破坏时立刻终结会话并删除暂存
    async fn fail_upload(&self, id: Uuid, reason: &str) {
        if let Some(session) = self.uploads.write().await.remove(&id) {
            let mut meta = session.meta.lock().await;
            meta.state = TransferState::Cancelled;
            tracing::warn!("Upload {} failed: {}", id, reason);
            self.emit_update(&meta).await;
        }
        self.catalog.remove_meta(id).await;
        self.catalog.remove_staging(id).await;
    }

    /// 写入一个分片。重复 PUT 幂等；不同下标可并发
    pub async fn put_chunk(&self, id: Uuid, index: u32, bytes: &[u8]) -> AppResult<UploadProgress> {
        let session = self.upload(id).await?;

        // 状态与边界检查
        {
            let meta = session.meta.lock().await;
            match meta.state {
                TransferState::Active => {}
                TransferState::Paused => return Err(AppError::TransferPaused),
                TransferState::Cancelled => return Err(AppError::TransferCancelled),
                TransferState::Stale => return Err(AppError::TransferStale),
                TransferState::Completed => {
                    return Err(AppError::Validation("upload already completed".to_string()))
                }
            }

            if index >= meta.chunk_count() {
                let reason = format!("chunk index {} out of range", index);
                drop(meta);
                self.fail_upload(id, &reason).await;
                return Err(AppError::ChunkOutOfRange(reason));
            }
            let expected = meta.expected_chunk_len(index);
            if bytes.len() as u64 != expected {
                let reason = format!(
                    "chunk {} has {} bytes, expected {}",
                    index,
                    bytes.len(),
                    expected
                );
                drop(meta);
                self.fail_upload(id, &reason).await;
                return Err(AppError::SizeMismatch(reason));
            }
        }

        // 取分片锁，同一下标串行
        let record = {
            let mut chunks = session.chunks.lock().await;
            chunks
                .entry(index)
                .or_insert_with(|| Arc::new(Mutex::new(ChunkRecord { written: false })))
                .clone()
        };
        let mut record = record.lock().await;

        if record.written {
            // 先前的写已成功，重试是幂等的
            let meta = session.meta.lock().await;
            return Ok(UploadProgress::from_session(&meta));
        }

        let offset = index as u64 * session.meta.lock().await.chunk_size;
        if let Err(e) = self.write_chunk_with_retry(&session.staging, offset, bytes).await {
            let disk_full = is_disk_full(&e);
            let mut meta = session.meta.lock().await;
            meta.state = TransferState::Paused;
            meta.error = Some(e.to_string());
            meta.last_activity = chrono::Utc::now();
            let _ = self.catalog.save(&meta).await;
            self.emit_update(&meta).await;
            return Err(if disk_full { AppError::DiskFull } else { AppError::Io(e) });
        }
        record.written = true;
        drop(record);

        // 更新元数据并落盘
        let (progress, completed) = {
            let mut meta = session.meta.lock().await;
            if meta.written_chunks.insert(index) {
                meta.transferred_bytes += bytes.len() as u64;
            }
            meta.last_activity = chrono::Utc::now();
            let completed = meta.is_complete();
            self.catalog.save(&meta).await?;
            self.emit_update(&meta).await;
            (UploadProgress::from_session(&meta), completed)
        };

        if completed {
            self.finalize_upload(id, &session).await?;
            let meta = session.meta.lock().await;
            return Ok(UploadProgress::from_session(&meta));
        }
        Ok(progress)
    }

    /// 瞬时 IO 错误内部重试一次
    async fn write_chunk_with_retry(
        &self,
        staging: &Path,
        offset: u64,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        let mut last_err = None;
        for attempt in 0..2 {
            match self.write_chunk_once(staging, offset, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt == 0 {
                        tracing::warn!("Chunk write failed, retrying once: {}", e);
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap())
    }

    async fn write_chunk_once(
        &self,
        staging: &Path,
        offset: u64,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(staging).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// 收尾：fsync 暂存文件、按冲突策略定名、原子 rename
    async fn finalize_upload(&self, id: Uuid, session: &Arc<UploadSession>) -> AppResult<()> {
        let mut meta = session.meta.lock().await;
        if meta.state != TransferState::Active {
            return Ok(());
        }

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&session.staging)
            .await?;
        file.sync_all().await?;
        drop(file);

        let final_target = match claim_target(&meta.target_path, meta.conflict_policy).await {
            Ok(path) => path,
            Err(e) => {
                // 目标被占用：暂停会话保留数据，让客户端决定
                meta.state = TransferState::Paused;
                meta.error = Some(e.to_string());
                self.catalog.save(&meta).await?;
                self.emit_update(&meta).await;
                return Err(e);
            }
        };

        tokio::fs::rename(&session.staging, &final_target).await?;
        meta.state = TransferState::Completed;
        meta.target_path = final_target.clone();
        self.catalog.remove_meta(id).await;
        self.emit_update(&meta).await;
        drop(meta);

        self.uploads.write().await.remove(&id);
        tracing::info!("Completed upload {} -> {}", id, final_target.display());
        Ok(())
    }

    /// 暂停上传，之后的分片 PUT 返回 409 与恢复元数据
    pub async fn pause_upload(&self, id: Uuid) -> AppResult<UploadProgress> {
        let session = self.upload(id).await?;
        let mut meta = session.meta.lock().await;

        if meta.state == TransferState::Active {
            meta.state = TransferState::Paused;
            meta.last_activity = chrono::Utc::now();
            self.catalog.save(&meta).await?;
            self.emit_update(&meta).await;
        }
        Ok(UploadProgress::from_session(&meta))
    }

    /// 恢复被暂停的上传
    pub async fn resume_upload(&self, id: Uuid) -> AppResult<UploadProgress> {
        let session = self.upload(id).await?;
        let mut meta = session.meta.lock().await;

        if meta.state == TransferState::Paused {
            meta.state = TransferState::Active;
            meta.error = None;
            meta.last_activity = chrono::Utc::now();
            self.catalog.save(&meta).await?;
            self.emit_update(&meta).await;
        }
        Ok(UploadProgress::from_session(&meta))
    }

    /// 取消上传并删除暂存
    pub async fn cancel_upload(&self, id: Uuid) -> AppResult<()> {
        let session = self.upload(id).await?;
        {
            let mut meta = session.meta.lock().await;
            meta.state = TransferState::Cancelled;
            self.emit_update(&meta).await;
        }
        self.uploads.write().await.remove(&id);
        self.catalog.remove_meta(id).await;
        self.catalog.remove_staging(id).await;
        tracing::info!("Cancelled upload {}", id);
        Ok(())
    }

    pub async fn upload_status(&self, id: Uuid) -> AppResult<UploadProgress> {
        let session = self.upload(id).await?;
        let meta = session.meta.lock().await;
        Ok(UploadProgress::from_session(&meta))
    }

    /// 列出全部非终态会话（上传与下载）
    pub async fn active_sessions(&self) -> Vec<TransferSession> {
        let mut sessions = Vec::new();
        for upload in self.uploads.read().await.values() {
            sessions.push(upload.meta.lock().await.clone());
        }
        for download in self.downloads.read().await.values() {
            sessions.push(download.clone());
        }
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sessions
    }

    // ==================== 直传快路径 ====================

    /// 单次流式上传：不建分片目录，不支持续传
    pub async fn direct_upload(
        &self,
        target_raw: &str,
        conflict_policy: ConflictPolicy,
        mut body: impl futures::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin,
    ) -> AppResult<(PathBuf, u64)> {
        use futures::StreamExt;

        let config = self.config.get().await;
        let target = resolve_target_path(target_raw, &config.files.allowed_roots).await?;

        let staging = self.catalog.staging_path(Uuid::new_v4());
        let mut file = tokio::fs::File::create(&staging).await?;
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&staging).await;
                    return Err(AppError::Internal(format!("body stream error: {}", e)));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(if is_disk_full(&e) { AppError::DiskFull } else { e.into() });
            }
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        let final_target = match claim_target(&target, conflict_policy).await {
            Ok(path) => path,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&staging, &final_target).await?;

        tracing::info!("Direct upload completed: {} ({} bytes)", final_target.display(), written);
        Ok((final_target, written))
    }
}

/// 按冲突策略确定最终文件名并原子占位。
/// 返回的路径可以被 rename 覆盖（占位文件属于我们）。
async fn claim_target(target: &Path, policy: ConflictPolicy) -> AppResult<PathBuf> {
    match policy {
        ConflictPolicy::Overwrite => {
            match tokio::fs::remove_file(target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            Ok(target.to_path_buf())
        }
        ConflictPolicy::Abort => {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(target)
                .await
            {
                Ok(_) => Ok(target.to_path_buf()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(AppError::ConflictExists(target.display().to_string()))
                }
                Err(e) => Err(e.into()),
            }
        }
        ConflictPolicy::KeepBoth => {
            let stem = target
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("file")
                .to_string();
            let ext = target.extension().and_then(|e| e.to_str()).map(|e| e.to_string());
            let parent = target.parent().unwrap_or_else(|| Path::new("."));

            let mut n = 0u32;
            loop {
                let candidate = if n == 0 {
                    target.to_path_buf()
                } else {
                    let name = match &ext {
                        Some(ext) => format!("{} ({}).{}", stem, n, ext),
                        None => format!("{} ({})", stem, n),
                    };
                    parent.join(name)
                };
                match tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&candidate)
                    .await
                {
                    Ok(_) => return Ok(candidate),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                        n += 1;
                        if n > 10_000 {
                            return Err(AppError::Internal(
                                "could not find a free file name".to_string(),
                            ));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigStore};
    use tempfile::tempdir;

    struct TestRig {
        _data: tempfile::TempDir,
        pub files: tempfile::TempDir,
        pub engine: Arc<TransferEngine>,
        pub data_dir: PathBuf,
        pub config: SharedConfig,
        pub hub: Arc<SessionHub>,
    }

    async fn rig_with_chunk_size(chunk_size: u64) -> TestRig {
        let data = tempdir().unwrap();
        let files = tempdir().unwrap();

        let mut config = Config::default();
        config.files.allowed_roots = vec![files.path().to_path_buf()];
        config.files.chunk_size = chunk_size;
        let config = Arc::new(ConfigStore::new(data.path(), config));

        let hub = SessionHub::new();
        let engine = TransferEngine::new(data.path(), config.clone(), hub.clone())
            .await
            .unwrap();
        let data_dir = data.path().to_path_buf();
        TestRig {
            _data: data,
            files,
            engine,
            data_dir,
            config,
            hub,
        }
    }

    async fn rig() -> TestRig {
        rig_with_chunk_size(256).await
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[tokio::test]
    async fn test_in_order_upload_completes() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");
        let source = pattern(1024, 7);

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 1024, ConflictPolicy::Abort)
            .await
            .unwrap();
        let id = progress.transfer_id;

        for index in 0..4u32 {
            let chunk = &source[index as usize * 256..(index as usize + 1) * 256];
            rig.engine.put_chunk(id, index, chunk).await.unwrap();
        }

        assert_eq!(tokio::fs::read(&target).await.unwrap(), source);
        // 会话已完成并从目录移除
        assert!(rig.engine.upload_status(id).await.is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_and_duplicate_chunks() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");
        let source = pattern(1024, 3);

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 1024, ConflictPolicy::Abort)
            .await
            .unwrap();
        let id = progress.transfer_id;
        let chunk = |i: usize| &source[i * 256..(i + 1) * 256];

        // 乱序 + 重复：0,3,3,1,2
        rig.engine.put_chunk(id, 0, chunk(0)).await.unwrap();
        rig.engine.put_chunk(id, 3, chunk(3)).await.unwrap();
        let p = rig.engine.put_chunk(id, 3, chunk(3)).await.unwrap();
        // 重复分片不重复计数
        assert_eq!(p.received_bytes, 512);
        rig.engine.put_chunk(id, 1, chunk(1)).await.unwrap();
        rig.engine.put_chunk(id, 2, chunk(2)).await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), source);
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");
        let source = pattern(1024, 11);
        let chunk = |i: usize| &source[i * 256..(i + 1) * 256];

        let id = {
            let progress = rig
                .engine
                .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 1024, ConflictPolicy::Abort)
                .await
                .unwrap();
            let id = progress.transfer_id;
            rig.engine.put_chunk(id, 0, chunk(0)).await.unwrap();
            rig.engine.put_chunk(id, 1, chunk(1)).await.unwrap();
            rig.engine.put_chunk(id, 3, chunk(3)).await.unwrap();
            id
        };

        // 模拟进程重启：用同一数据目录重建引擎
        let engine2 = TransferEngine::new(&rig.data_dir, rig.config.clone(), rig.hub.clone())
            .await
            .unwrap();

        let status = engine2.upload_status(id).await.unwrap();
        assert_eq!(status.received_bytes, 768);
        assert_eq!(status.written_chunks, vec![0, 1, 3]);

        // 重试分片 3（幂等），再补缺失的分片 2，后者触发收尾
        engine2.put_chunk(id, 3, chunk(3)).await.unwrap();
        engine2.put_chunk(id, 2, chunk(2)).await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), source);
    }

    #[tokio::test]
    async fn test_pause_blocks_puts_with_resume_metadata() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");
        let source = pattern(512, 2);

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 512, ConflictPolicy::Abort)
            .await
            .unwrap();
        let id = progress.transfer_id;

        rig.engine.put_chunk(id, 0, &source[..256]).await.unwrap();
        let paused = rig.engine.pause_upload(id).await.unwrap();
        assert_eq!(paused.state, TransferState::Paused);
        assert_eq!(paused.written_chunks, vec![0]);

        let err = rig.engine.put_chunk(id, 1, &source[256..]).await.unwrap_err();
        assert!(matches!(err, AppError::TransferPaused));

        rig.engine.resume_upload(id).await.unwrap();
        rig.engine.put_chunk(id, 1, &source[256..]).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), source);
    }

    #[tokio::test]
    async fn test_cancel_removes_staging() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 512, ConflictPolicy::Abort)
            .await
            .unwrap();
        let id = progress.transfer_id;
        rig.engine.put_chunk(id, 0, &pattern(256, 1)).await.unwrap();

        rig.engine.cancel_upload(id).await.unwrap();
        assert!(rig.engine.upload_status(id).await.is_err());
        assert!(!rig.engine.catalog.staging_path(id).exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_chunk_out_of_range_fails_session() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 512, ConflictPolicy::Abort)
            .await
            .unwrap();
        let id = progress.transfer_id;

        let err = rig.engine.put_chunk(id, 9, &pattern(256, 1)).await.unwrap_err();
        assert!(matches!(err, AppError::ChunkOutOfRange(_)));
        // 会话立即终结，暂存删除
        assert!(rig.engine.upload_status(id).await.is_err());
        assert!(!rig.engine.catalog.staging_path(id).exists());
    }

    #[tokio::test]
    async fn test_size_mismatch_fails_session() {
        let rig = rig().await;
        let target = rig.files.path().join("out.bin");

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 512, ConflictPolicy::Abort)
            .await
            .unwrap();
        let id = progress.transfer_id;

        let err = rig.engine.put_chunk(id, 0, &pattern(100, 1)).await.unwrap_err();
        assert!(matches!(err, AppError::SizeMismatch(_)));
        assert!(rig.engine.upload_status(id).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_policy_rejects_existing_target() {
        let rig = rig().await;
        let target = rig.files.path().join("exists.bin");
        tokio::fs::write(&target, b"already here").await.unwrap();

        let err = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 512, ConflictPolicy::Abort)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConflictExists(_)));
    }

    #[tokio::test]
    async fn test_overwrite_policy_replaces_target() {
        let rig = rig().await;
        let target = rig.files.path().join("exists.bin");
        tokio::fs::write(&target, b"old contents").await.unwrap();
        let source = pattern(512, 9);

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 512, ConflictPolicy::Overwrite)
            .await
            .unwrap();
        let id = progress.transfer_id;
        rig.engine.put_chunk(id, 0, &source[..256]).await.unwrap();
        rig.engine.put_chunk(id, 1, &source[256..]).await.unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), source);
    }

    #[tokio::test]
    async fn test_keep_both_policy_picks_fresh_name() {
        let rig = rig().await;
        let target = rig.files.path().join("photo.jpg");
        tokio::fs::write(&target, b"original").await.unwrap();
        let source = pattern(256, 4);

        let progress = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 256, ConflictPolicy::KeepBoth)
            .await
            .unwrap();
        rig.engine
            .put_chunk(progress.transfer_id, 0, &source)
            .await
            .unwrap();

        // 原文件不动，新文件带编号后缀
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"original");
        let renamed = rig.files.path().join("photo (1).jpg");
        assert_eq!(tokio::fs::read(&renamed).await.unwrap(), source);
    }

    #[tokio::test]
    async fn test_direct_upload_streams_to_target() {
        let rig = rig().await;
        let target = rig.files.path().join("direct.bin");
        let source = pattern(1000, 5);

        let stream = futures::stream::iter(
            source
                .chunks(100)
                .map(|c| Ok::<_, axum::Error>(axum::body::Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        );

        let (path, written) = rig
            .engine
            .direct_upload(target.to_str().unwrap(), ConflictPolicy::Abort, stream)
            .await
            .unwrap();

        assert_eq!(written, 1000);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), source);
    }

    #[tokio::test]
    async fn test_upload_outside_roots_is_forbidden() {
        let rig = rig().await;
        let outside = tempdir().unwrap();
        let target = outside.path().join("evil.bin");

        let err = rig
            .engine
            .initiate_upload(Uuid::new_v4(), target.to_str().unwrap(), 256, ConflictPolicy::Abort)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PathForbidden(_)));
    }
}
