// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};
use crate::utils::atomic_write;

pub const CONFIG_FILENAME: &str = "config.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub services: ServiceToggles,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_beacon_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_beacon_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesConfig {
    /// 文件访问白名单根目录，路径校验的唯一依据
    #[serde(default = "default_allowed_roots")]
    pub allowed_roots: Vec<PathBuf>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
    #[serde(default = "default_stale_days")]
    pub stale_after_days: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// 服务能力开关，中间件在路由前检查
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceToggles {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default = "default_true")]
    pub file_browser: bool,
    #[serde(default = "default_true")]
    pub input: bool,
    #[serde(default = "default_true")]
    pub media: bool,
    #[serde(default = "default_true")]
    pub clipboard: bool,
    #[serde(default = "default_true")]
    pub screen: bool,
    #[serde(default = "default_true")]
    pub power: bool,
    #[serde(default)]
    pub extensions: bool,
}

impl ServiceToggles {
    pub fn is_enabled(&self, key: &str) -> bool {
        match key {
            "terminal" => self.terminal,
            "file_browser" => self.file_browser,
            "input" => self.input,
            "media" => self.media,
            "clipboard" => self.clipboard,
            "screen" => self.screen,
            "power" => self.power,
            "extensions" => self.extensions,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// argon2 PHC 字符串，盐值内嵌
    pub password_hash: Option<String>,
    #[serde(default)]
    pub setup_completed: bool,
}

// 默认值函数
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    38080
}
fn default_true() -> bool {
    true
}
fn default_beacon_interval() -> u64 {
    3
}
fn default_beacon_port() -> u16 {
    38099
}
fn default_allowed_roots() -> Vec<PathBuf> {
    dirs_home().map(|h| vec![h]).unwrap_or_default()
}
fn default_chunk_size() -> u64 {
    256 * 1024
}
fn default_max_upload_mb() -> usize {
    4096
}
fn default_stale_days() -> u64 {
    7
}
fn default_cleanup_interval() -> u64 {
    3600
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_beacon_interval(),
            port: default_beacon_port(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            allowed_roots: default_allowed_roots(),
            chunk_size: default_chunk_size(),
            max_upload_mb: default_max_upload_mb(),
            stale_after_days: default_stale_days(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for ServiceToggles {
    fn default() -> Self {
        Self {
            terminal: false,
            file_browser: true,
            input: true,
            media: true,
            clipboard: true,
            screen: true,
            power: true,
            extensions: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            discovery: DiscoveryConfig::default(),
            files: FilesConfig::default(),
            services: ServiceToggles::default(),
            auth: AuthConfig::default(),
        }
    }
}

/// 返回数据目录，`PCLINK_DATA_DIR` 优先
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("PCLINK_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs_home().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("pclink")
}

impl Config {
    /// 分层加载：config/default < config/local < 数据目录 config.json < 环境变量
    pub fn load(data_dir: &Path) -> AppResult<Self> {
        dotenvy::dotenv().ok();

        let runtime_file = data_dir.join(CONFIG_FILENAME);

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::File::from(runtime_file).required(false))
            .add_source(
                config::Environment::with_prefix("PCLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        builder
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))
    }
}

/// 配置存储：内存态 + 变更时整体重写 config.json
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<Config>,
}

pub type SharedConfig = Arc<ConfigStore>;

impl ConfigStore {
    pub fn new(data_dir: &Path, config: Config) -> Self {
        Self {
            path: data_dir.join(CONFIG_FILENAME),
            inner: RwLock::new(config),
        }
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn setup_completed(&self) -> bool {
        self.inner.read().await.auth.setup_completed
    }

    /// 修改配置并落盘，写失败时内存态回滚
    pub async fn update<F>(&self, mutate: F) -> AppResult<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().await;
        let previous = guard.clone();
        mutate(&mut guard);

        let json = serde_json::to_vec_pretty(&*guard)?;
        if let Err(e) = atomic_write(&self.path, &json).await {
            *guard = previous;
            return Err(e);
        }
        Ok(guard.clone())
    }
}
