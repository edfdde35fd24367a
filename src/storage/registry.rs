// src/storage/registry.rs

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::Device;
use crate::utils::{atomic_write, sanitize_log_input, CryptoUtils};

pub const REGISTRY_FILENAME: &str = "devices.json";
/// 被吊销密钥摘要的侧车文件，重启后仍能区分 Revoked 与 Invalid
pub const REVOKED_FILENAME: &str = "devices.revoked.json";

/// 认证结果：`Server` 表示用服务器 API 密钥访问，审计时区分
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    Server,
    Device(Device),
}

struct RegistryInner {
    /// device_key 摘要 -> Device
    by_digest: HashMap<String, Device>,
    /// device_id -> device_key 摘要
    by_id: HashMap<Uuid, String>,
    /// 被吊销密钥的摘要，区分 Revoked 与 Invalid
    revoked: HashSet<String>,
}

impl RegistryInner {
    fn from_devices(devices: Vec<Device>, revoked: HashSet<String>) -> Self {
        let mut by_digest = HashMap::new();
        let mut by_id = HashMap::new();
        for device in devices {
            let digest = CryptoUtils::digest(&device.device_key);
            by_id.insert(device.id, digest.clone());
            by_digest.insert(digest, device);
        }
        Self {
            by_digest,
            by_id,
            revoked,
        }
    }

    fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.by_digest.values().cloned().collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        devices
    }
}

/// 已配对设备注册表，每次变更整体重写 devices.json 与吊销侧车
pub struct DeviceRegistry {
    path: PathBuf,
    revoked_path: PathBuf,
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    /// 加载注册表。文件损坏时启动失败，由操作员决定是否删除
    pub async fn load(data_dir: &Path) -> AppResult<Self> {
        let path = data_dir.join(REGISTRY_FILENAME);
        let revoked_path = data_dir.join(REVOKED_FILENAME);

        let devices = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<Device>>(&bytes).map_err(|e| {
                AppError::Config(format!(
                    "device registry {} is corrupt ({}); remove the file to reset pairing state",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let revoked = match tokio::fs::read(&revoked_path).await {
            Ok(bytes) => serde_json::from_slice::<HashSet<String>>(&bytes).map_err(|e| {
                AppError::Config(format!(
                    "revoked key list {} is corrupt ({}); remove the file to reset pairing state",
                    revoked_path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Loaded {} paired device(s), {} revoked key(s)",
            devices.len(),
            revoked.len()
        );
        Ok(Self {
            path,
            revoked_path,
            inner: RwLock::new(RegistryInner::from_devices(devices, revoked)),
        })
    }

    async fn persist(&self, inner: &RegistryInner) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(&inner.snapshot())?;
        atomic_write(&self.path, &json).await?;

        let mut revoked: Vec<&String> = inner.revoked.iter().collect();
        revoked.sort();
        let json = serde_json::to_vec_pretty(&revoked)?;
        atomic_write(&self.revoked_path, &json).await
    }

    /// 按密钥认证。成功时更新 last_seen 与 IP；密钥曾存在但被移除时返回 Revoked
    pub async fn authorize(&self, key: &str, ip: IpAddr) -> AppResult<Device> {
        let digest = CryptoUtils::digest(key);
        let mut inner = self.inner.write().await;

        let Some(device) = inner.by_digest.get_mut(&digest) else {
            if inner.revoked.contains(&digest) {
                return Err(AppError::RevokedCredential);
            }
            tracing::warn!(
                "Invalid device key attempt: {}…",
                sanitize_log_input(&key.chars().take(8).collect::<String>())
            );
            return Err(AppError::InvalidCredential);
        };

        let ip_str = ip.to_string();
        if device.ip != ip_str {
            tracing::info!("Device {} IP changed: {} -> {}", device.name, device.ip, ip_str);
            device.ip = ip_str;
        }
        device.last_seen = chrono::Utc::now();
        let device = device.clone();

        self.persist(&inner).await?;
        Ok(device)
    }

    /// 批准配对：生成新设备与其专属密钥
    pub async fn approve(
        &self,
        name: String,
        platform: String,
        client_version: String,
        ip: IpAddr,
    ) -> AppResult<Device> {
        let device_key = CryptoUtils::generate_api_key();
        let device = Device::new(name, platform, client_version, ip.to_string(), device_key);

        let mut inner = self.inner.write().await;
        let digest = CryptoUtils::digest(&device.device_key);
        inner.by_id.insert(device.id, digest.clone());
        inner.by_digest.insert(digest, device.clone());
        self.persist(&inner).await?;

        tracing::info!("Approved device: {} ({})", device.name, device.id);
        Ok(device)
    }

    /// 吊销设备。返回后该密钥的一切后续请求都将失败
    pub async fn revoke(&self, device_id: Uuid) -> AppResult<Option<Device>> {
        let mut inner = self.inner.write().await;

        let Some(digest) = inner.by_id.remove(&device_id) else {
            return Ok(None);
        };
        let device = inner.by_digest.remove(&digest);
        inner.revoked.insert(digest);
        self.persist(&inner).await?;

        if let Some(d) = &device {
            tracing::info!("Revoked device: {} ({})", d.name, d.id);
        }
        Ok(device)
    }

    /// 原子清空注册表
    pub async fn revoke_all(&self) -> AppResult<usize> {
        let mut inner = self.inner.write().await;
        let count = inner.by_digest.len();

        let digests: Vec<String> = inner.by_id.values().cloned().collect();
        inner.revoked.extend(digests);
        inner.by_digest.clear();
        inner.by_id.clear();
        self.persist(&inner).await?;

        tracing::info!("Revoked all {} device(s)", count);
        Ok(count)
    }

    pub async fn get(&self, device_id: Uuid) -> Option<Device> {
        let inner = self.inner.read().await;
        inner
            .by_id
            .get(&device_id)
            .and_then(|digest| inner.by_digest.get(digest))
            .cloned()
    }

    pub async fn list(&self) -> Vec<Device> {
        self.inner.read().await.snapshot()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_digest.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const IP: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 20));

    async fn registry(dir: &Path) -> DeviceRegistry {
        DeviceRegistry::load(dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_approve_then_authorize() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let device = reg
            .approve("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await
            .unwrap();

        let authed = reg.authorize(&device.device_key, IP).await.unwrap();
        assert_eq!(authed.id, device.id);
        assert!(authed.last_seen >= device.last_seen);
    }

    #[tokio::test]
    async fn test_unknown_key_is_invalid() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let err = reg.authorize("never-issued", IP).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCredential));
    }

    #[tokio::test]
    async fn test_revoked_key_is_distinguished() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let device = reg
            .approve("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await
            .unwrap();
        reg.revoke(device.id).await.unwrap();

        let err = reg.authorize(&device.device_key, IP).await.unwrap_err();
        assert!(matches!(err, AppError::RevokedCredential));
    }

    #[tokio::test]
    async fn test_registry_survives_restart() {
        let dir = tempdir().unwrap();
        let key;
        {
            let reg = registry(dir.path()).await;
            let device = reg
                .approve("phone-A".into(), "android".into(), "1.0".into(), IP)
                .await
                .unwrap();
            key = device.device_key;
        }

        let reg = registry(dir.path()).await;
        assert_eq!(reg.count().await, 1);
        assert!(reg.authorize(&key, IP).await.is_ok());
    }

    #[tokio::test]
    async fn test_revocation_survives_restart() {
        let dir = tempdir().unwrap();
        let key;
        {
            let reg = registry(dir.path()).await;
            let device = reg
                .approve("phone-A".into(), "android".into(), "1.0".into(), IP)
                .await
                .unwrap();
            key = device.device_key;
            reg.revoke(device.id).await.unwrap();
        }

        // 重启后旧密钥仍按 Revoked 分类，而不是 Invalid
        let reg = registry(dir.path()).await;
        let err = reg.authorize(&key, IP).await.unwrap_err();
        assert!(matches!(err, AppError::RevokedCredential));
    }

    #[tokio::test]
    async fn test_revoke_all_survives_restart() {
        let dir = tempdir().unwrap();
        let (key_a, key_b);
        {
            let reg = registry(dir.path()).await;
            let a = reg.approve("a".into(), "ios".into(), "1".into(), IP).await.unwrap();
            let b = reg.approve("b".into(), "ios".into(), "1".into(), IP).await.unwrap();
            key_a = a.device_key;
            key_b = b.device_key;
            reg.revoke_all().await.unwrap();
        }

        let reg = registry(dir.path()).await;
        assert_eq!(reg.count().await, 0);
        assert!(matches!(
            reg.authorize(&key_a, IP).await.unwrap_err(),
            AppError::RevokedCredential
        ));
        assert!(matches!(
            reg.authorize(&key_b, IP).await.unwrap_err(),
            AppError::RevokedCredential
        ));
    }

    #[tokio::test]
    async fn test_corrupt_registry_fails_loudly() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join(REGISTRY_FILENAME), b"{not json")
            .await
            .unwrap();

        let err = DeviceRegistry::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_revoke_all_clears_everything() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let a = reg.approve("a".into(), "ios".into(), "1".into(), IP).await.unwrap();
        let b = reg.approve("b".into(), "ios".into(), "1".into(), IP).await.unwrap();

        assert_eq!(reg.revoke_all().await.unwrap(), 2);
        assert_eq!(reg.count().await, 0);
        assert!(matches!(
            reg.authorize(&a.device_key, IP).await.unwrap_err(),
            AppError::RevokedCredential
        ));
        assert!(matches!(
            reg.authorize(&b.device_key, IP).await.unwrap_err(),
            AppError::RevokedCredential
        ));
    }

    #[tokio::test]
    async fn test_ip_change_is_recorded() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path()).await;

        let device = reg
            .approve("phone-A".into(), "android".into(), "1.0".into(), IP)
            .await
            .unwrap();

        let new_ip = IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 7));
        let authed = reg.authorize(&device.device_key, new_ip).await.unwrap();
        assert_eq!(authed.ip, "10.0.0.7");
    }
}
