// src/singleton.rs

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

const LOCK_FILENAME: &str = "pclink.lock";

/// 单实例锁：数据目录下的建议性文件锁。
/// 句柄存活期间持锁，进程退出（含崩溃）后由系统释放。
pub struct InstanceLock {
    path: PathBuf,
    _file: File,
}

impl InstanceLock {
    /// 尝试获取锁。已有实例运行时返回错误
    pub fn acquire(data_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(LOCK_FILENAME);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(AppError::Config(
                "another PCLink instance is already running".to_string(),
            ));
        }

        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        tracing::info!("Acquired instance lock: {}", path.display());

        Ok(Self { path, _file: file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        tracing::info!("Released instance lock: {}", self.path.display());
    }
}
