// src/identity.rs

use chrono::{DateTime, Datelike, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::utils::{atomic_write, local_ipv4_addresses, CryptoUtils};

pub const API_KEY_FILE: &str = "api_key";
pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "identity.json";

/// 证书有效期（年）
const CERT_VALIDITY_YEARS: i32 = 10;

/// 证书元数据侧车文件，用于启动时校验
#[derive(Debug, Serialize, Deserialize)]
struct IdentityMeta {
    fingerprint: String,
    not_after: DateTime<Utc>,
    generated_at: DateTime<Utc>,
}

/// 服务器身份存储：API 密钥与 TLS 证书材料
pub struct IdentityStore {
    data_dir: PathBuf,
    api_key: RwLock<String>,
}

impl IdentityStore {
    pub fn cert_path(&self) -> PathBuf {
        self.data_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }

    /// 加载身份材料；任一缺失或校验失败时全部原子重建
    pub async fn load_or_init(data_dir: &Path) -> AppResult<Self> {
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            api_key: RwLock::new(String::new()),
        };

        match store.validate_existing().await {
            Ok(api_key) => {
                *store.api_key.write().await = api_key;
                tracing::info!("Server identity loaded from {}", data_dir.display());
            }
            Err(reason) => {
                tracing::warn!("Regenerating server identity: {}", reason);
                let api_key = store.regenerate().await?;
                *store.api_key.write().await = api_key;
            }
        }

        Ok(store)
    }

    /// 校验通过时返回 API 密钥，否则返回失败原因
    async fn validate_existing(&self) -> Result<String, String> {
        let api_key = tokio::fs::read_to_string(self.data_dir.join(API_KEY_FILE))
            .await
            .map_err(|e| format!("api_key unreadable: {}", e))?;
        let api_key = api_key.trim().to_string();
        Uuid::parse_str(&api_key).map_err(|_| "api_key is not a valid UUID".to_string())?;

        let meta_bytes = tokio::fs::read(self.data_dir.join(META_FILE))
            .await
            .map_err(|e| format!("identity meta unreadable: {}", e))?;
        let meta: IdentityMeta =
            serde_json::from_slice(&meta_bytes).map_err(|e| format!("identity meta corrupt: {}", e))?;

        if Utc::now() >= meta.not_after {
            return Err("certificate has expired".to_string());
        }

        let fingerprint = self
            .fingerprint()
            .await
            .map_err(|e| format!("certificate unreadable: {}", e))?;
        if fingerprint != meta.fingerprint {
            return Err("certificate fingerprint mismatch".to_string());
        }

        let key_pem = tokio::fs::read(self.data_dir.join(KEY_FILE))
            .await
            .map_err(|e| format!("private key unreadable: {}", e))?;
        rustls_pemfile::private_key(&mut key_pem.as_slice())
            .map_err(|e| format!("private key unparsable: {}", e))?
            .ok_or_else(|| "no private key in key.pem".to_string())?;

        Ok(api_key)
    }

    /// 重建全部三项材料：临时文件写入后 rename
    async fn regenerate(&self) -> AppResult<String> {
        let api_key = CryptoUtils::generate_api_key();
        let (cert_pem, key_pem, fingerprint, not_after) = generate_certificate()?;

        atomic_write(&self.data_dir.join(CERT_FILE), cert_pem.as_bytes()).await?;
        atomic_write(&self.data_dir.join(KEY_FILE), key_pem.as_bytes()).await?;
        atomic_write(&self.data_dir.join(API_KEY_FILE), api_key.as_bytes()).await?;

        let meta = IdentityMeta {
            fingerprint: fingerprint.clone(),
            not_after,
            generated_at: Utc::now(),
        };
        atomic_write(&self.data_dir.join(META_FILE), &serde_json::to_vec_pretty(&meta)?).await?;

        restrict_permissions(&self.data_dir.join(API_KEY_FILE)).await;
        restrict_permissions(&self.data_dir.join(KEY_FILE)).await;

        tracing::info!(fingerprint = %fingerprint, "Generated new server identity");
        Ok(api_key)
    }

    pub async fn api_key(&self) -> String {
        self.api_key.read().await.clone()
    }

    /// 服务器密钥的摘要，认证比较用
    pub async fn api_key_digest(&self) -> String {
        CryptoUtils::digest(&self.api_key.read().await)
    }

    /// 轮换 API 密钥，不触碰证书；所有设备密钥随策略失效
    pub async fn rotate_api_key(&self) -> AppResult<String> {
        let new_key = CryptoUtils::generate_api_key();
        atomic_write(&self.data_dir.join(API_KEY_FILE), new_key.as_bytes()).await?;
        restrict_permissions(&self.data_dir.join(API_KEY_FILE)).await;

        *self.api_key.write().await = new_key.clone();
        tracing::info!("Server API key rotated");
        Ok(new_key)
    }

    /// 证书指纹：每次从磁盘重新计算，文件重写后立即生效
    pub async fn fingerprint(&self) -> AppResult<String> {
        let pem = tokio::fs::read(self.data_dir.join(CERT_FILE)).await?;
        let der = rustls_pemfile::certs(&mut pem.as_slice())
            .next()
            .ok_or_else(|| AppError::Config("no certificate in cert.pem".to_string()))?
            .map_err(|e| AppError::Config(format!("certificate unparsable: {}", e)))?;
        Ok(CryptoUtils::cert_fingerprint(&der))
    }
}

/// 生成自签名证书：CN 为主机名，SAN 覆盖回环与所有物理网卡 IPv4
fn generate_certificate() -> AppResult<(String, String, String, DateTime<Utc>)> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "pclink".to_string());

    let mut params = CertificateParams::new(vec![host.clone(), "localhost".to_string()])
        .map_err(|e| AppError::Config(format!("certificate params invalid: {}", e)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host.clone());
    params.distinguished_name = dn;

    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    for ip in local_ipv4_addresses() {
        params.subject_alt_names.push(SanType::IpAddress(IpAddr::V4(ip)));
    }

    let now = Utc::now();
    params.not_before = rcgen::date_time_ymd(now.year() - 1, 1, 1);
    params.not_after = rcgen::date_time_ymd(now.year() + CERT_VALIDITY_YEARS, now.month() as u8, 1);

    let key_pair =
        KeyPair::generate().map_err(|e| AppError::Config(format!("key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AppError::Config(format!("certificate generation failed: {}", e)))?;

    let fingerprint = CryptoUtils::cert_fingerprint(cert.der());
    let not_after = Utc::now() + chrono::Duration::days(365 * CERT_VALIDITY_YEARS as i64);

    Ok((cert.pem(), key_pair.serialize_pem(), fingerprint, not_after))
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        tracing::warn!("Failed to restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}
