// src/utils/fs.rs

use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::error::AppResult;

/// 原子写入：先写临时文件再 rename，避免半写状态
pub async fn atomic_write(path: &Path, data: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
