// src/transfer/cleanup.rs

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::TransferEngine;
use crate::models::TransferState;

/// 清理结果统计
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupReport {
    pub cleaned_uploads: usize,
    pub cleaned_downloads: usize,
}

impl TransferEngine {
    /// 将超过不活跃阈值的会话置为 Stale 并回收磁盘资源。
    /// 周期任务与操作员手动触发共用此入口
    pub async fn cleanup_stale(&self) -> CleanupReport {
        let config = self.config.get().await;
        let cutoff = Utc::now() - Duration::days(config.files.stale_after_days as i64);
        let mut report = CleanupReport::default();

        // 上传
        let stale_uploads: Vec<Uuid> = {
            let uploads = self.uploads.read().await;
            let mut ids = Vec::new();
            for (id, session) in uploads.iter() {
                if session.meta.lock().await.last_activity < cutoff {
                    ids.push(*id);
                }
            }
            ids
        };
        for id in stale_uploads {
            if let Some(session) = self.uploads.write().await.remove(&id) {
                let mut meta = session.meta.lock().await;
                meta.state = TransferState::Stale;
                self.emit_update(&meta).await;
            }
            self.catalog.remove_staging(id).await;
            self.catalog.remove_meta(id).await;
            report.cleaned_uploads += 1;
            tracing::info!("Cleaned stale upload {}", id);
        }

        // 下载
        let stale_downloads: Vec<Uuid> = {
            let downloads = self.downloads.read().await;
            downloads
                .iter()
                .filter(|(_, s)| s.last_activity < cutoff)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in stale_downloads {
            if let Some(mut session) = self.downloads.write().await.remove(&id) {
                session.state = TransferState::Stale;
                self.emit_update(&session).await;
            }
            self.catalog.remove_meta(id).await;
            report.cleaned_downloads += 1;
            tracing::info!("Cleaned stale download {}", id);
        }

        // 孤儿暂存文件（无元数据、不属于任何活跃会话）
        let keep: std::collections::HashSet<Uuid> =
            self.uploads.read().await.keys().copied().collect();
        let orphans = self.catalog.sweep_orphan_staging(&keep).await;
        if orphans > 0 {
            tracing::info!("Removed {} orphan staging file(s)", orphans);
        }

        if report.cleaned_uploads > 0 || report.cleaned_downloads > 0 {
            tracing::info!(
                "Stale cleanup: {} upload(s), {} download(s)",
                report.cleaned_uploads,
                report.cleaned_downloads
            );
        }
        report
    }

    /// 后台周期清理任务
    pub fn start_cleanup_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let interval_secs = self.config.get().await.files.cleanup_interval_secs;
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs.max(60)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.cleanup_stale().await;
            }
        });
    }
}
