// src/transfer/catalog.rs

use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::TransferSession;
use crate::utils::atomic_write;

pub const TRANSFERS_DIR: &str = "transfers";

/// 磁盘会话目录：<id>.meta 存元数据，<id>.staging 存上传中的字节。
/// 重启后据此恢复未完成的会话。
pub struct TransferCatalog {
    dir: PathBuf,
}

impl TransferCatalog {
    pub async fn new(data_dir: &Path) -> AppResult<Self> {
        let dir = data_dir.join(TRANSFERS_DIR);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn meta_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.meta", id))
    }

    pub fn staging_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.staging", id))
    }

    pub async fn save(&self, session: &TransferSession) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(session)?;
        atomic_write(&self.meta_path(session.transfer_id), &json).await
    }

    pub async fn remove_meta(&self, id: Uuid) {
        if let Err(e) = tokio::fs::remove_file(self.meta_path(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove transfer meta {}: {}", id, e);
            }
        }
    }

    pub async fn remove_staging(&self, id: Uuid) {
        if let Err(e) = tokio::fs::remove_file(self.staging_path(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove staging file {}: {}", id, e);
            }
        }
    }

    /// 删除既无元数据又不在活跃集合里的孤儿暂存文件
    /// （直传中断等情况遗留）
    pub async fn sweep_orphan_staging(&self, keep: &std::collections::HashSet<Uuid>) -> usize {
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("staging") {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            if keep.contains(&id) || self.meta_path(id).exists() {
                continue;
            }
            // 进行中的直传也没有元数据，按修改时间留出安全窗口
            let old_enough = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok())
                .map(|age| age.as_secs() > 24 * 3600)
                .unwrap_or(false);
            if old_enough && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// 读取全部会话元数据，损坏的单个文件跳过并告警
    pub async fn load_all(&self) -> AppResult<Vec<TransferSession>> {
        let mut sessions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<TransferSession>(&bytes) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        tracing::warn!("Skipping corrupt transfer meta {}: {}", path.display(), e)
                    }
                },
                Err(e) => tracing::warn!("Failed to read transfer meta {}: {}", path.display(), e),
            }
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConflictPolicy;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempdir().unwrap();
        let catalog = TransferCatalog::new(dir.path()).await.unwrap();

        let session = TransferSession::new_upload(
            Uuid::new_v4(),
            dir.path().join("target.bin"),
            1024,
            256,
            ConflictPolicy::Overwrite,
        );
        catalog.save(&session).await.unwrap();

        let loaded = catalog.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].transfer_id, session.transfer_id);

        catalog.remove_meta(session.transfer_id).await;
        assert!(catalog.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_meta_is_skipped() {
        let dir = tempdir().unwrap();
        let catalog = TransferCatalog::new(dir.path()).await.unwrap();

        tokio::fs::write(catalog.meta_path(Uuid::new_v4()), b"garbage")
            .await
            .unwrap();

        assert!(catalog.load_all().await.unwrap().is_empty());
    }
}
