// src/models/transfer.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Active,
    Paused,
    Completed,
    Cancelled,
    Stale,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Cancelled | TransferState::Stale)
    }
}

/// 目标文件已存在时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Abort,
    Overwrite,
    KeepBoth,
}

/// 传输会话元数据，即 transfers/<id>.meta 的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSession {
    pub transfer_id: Uuid,
    pub direction: TransferDirection,
    pub owner_device_id: Uuid,
    pub target_path: PathBuf,
    pub total_size: u64,
    pub chunk_size: u64,
    /// 上传为已收字节，下载为已发字节
    pub transferred_bytes: u64,
    pub state: TransferState,
    pub conflict_policy: ConflictPolicy,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// 已完整写入的分片下标，重启恢复用
    #[serde(default)]
    pub written_chunks: BTreeSet<u32>,
    /// 暂停原因（写失败时记录），恢复后清除
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferSession {
    pub fn new_upload(
        owner_device_id: Uuid,
        target_path: PathBuf,
        total_size: u64,
        chunk_size: u64,
        conflict_policy: ConflictPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: Uuid::new_v4(),
            direction: TransferDirection::Upload,
            owner_device_id,
            target_path,
            total_size,
            chunk_size,
            transferred_bytes: 0,
            state: TransferState::Active,
            conflict_policy,
            created_at: now,
            last_activity: now,
            written_chunks: BTreeSet::new(),
            error: None,
        }
    }

    pub fn new_download(owner_device_id: Uuid, source_path: PathBuf, total_size: u64) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: Uuid::new_v4(),
            direction: TransferDirection::Download,
            owner_device_id,
            target_path: source_path,
            total_size,
            chunk_size: 0,
            transferred_bytes: 0,
            state: TransferState::Active,
            conflict_policy: ConflictPolicy::Abort,
            created_at: now,
            last_activity: now,
            written_chunks: BTreeSet::new(),
            error: None,
        }
    }

    /// 会话的分片总数
    pub fn chunk_count(&self) -> u32 {
        if self.total_size == 0 || self.chunk_size == 0 {
            return 0;
        }
        self.total_size.div_ceil(self.chunk_size) as u32
    }

    /// 指定分片的期望字节数，末片可短
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size;
        (self.total_size - start).min(self.chunk_size)
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes == self.total_size
            && self.written_chunks.len() as u32 == self.chunk_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(total: u64, chunk: u64) -> TransferSession {
        TransferSession::new_upload(
            Uuid::new_v4(),
            PathBuf::from("/tmp/target.bin"),
            total,
            chunk,
            ConflictPolicy::Abort,
        )
    }

    #[test]
    fn test_chunk_count_rounds_up() {
        assert_eq!(upload(1024, 256).chunk_count(), 4);
        assert_eq!(upload(1025, 256).chunk_count(), 5);
        assert_eq!(upload(1, 256).chunk_count(), 1);
        assert_eq!(upload(0, 256).chunk_count(), 0);
    }

    #[test]
    fn test_last_chunk_may_be_short() {
        let session = upload(1000, 256);
        assert_eq!(session.expected_chunk_len(0), 256);
        assert_eq!(session.expected_chunk_len(3), 1000 - 3 * 256);
    }

    #[test]
    fn test_completion_requires_all_chunks() {
        let mut session = upload(512, 256);
        session.transferred_bytes = 512;
        session.written_chunks.insert(0);
        assert!(!session.is_complete());
        session.written_chunks.insert(1);
        assert!(session.is_complete());
    }

    #[test]
    fn test_meta_roundtrip() {
        let mut session = upload(1024, 256);
        session.written_chunks.insert(0);
        session.written_chunks.insert(2);

        let json = serde_json::to_string(&session).unwrap();
        let back: TransferSession = serde_json::from_str(&json).unwrap();

        assert_eq!(back.transfer_id, session.transfer_id);
        assert_eq!(back.written_chunks, session.written_chunks);
        assert_eq!(back.state, TransferState::Active);
    }
}
