// src/discovery.rs

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use crate::config::SharedConfig;
use crate::identity::IdentityStore;

pub const BEACON_MAGIC: &str = "PCLINK_DISCOVERY_BEACON_V1";

/// 发现信标载荷，客户端按 `magic` 识别
#[derive(Debug, Serialize)]
struct BeaconPayload<'a> {
    magic: &'static str,
    hostname: &'a str,
    port: u16,
    https: bool,
    fingerprint: &'a str,
}

/// UDP 发现信标。首次设置完成前静默；
/// 发送失败只记日志，任务在网卡变动时也不退出。
pub struct DiscoveryBeacon {
    config: SharedConfig,
    identity: Arc<IdentityStore>,
}

impl DiscoveryBeacon {
    pub fn new(config: SharedConfig, identity: Arc<IdentityStore>) -> Self {
        Self { config, identity }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let socket = loop {
            match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => {
                    if let Err(e) = s.set_broadcast(true) {
                        tracing::warn!("Failed to enable UDP broadcast: {}", e);
                    }
                    break s;
                }
                Err(e) => {
                    tracing::warn!("Discovery socket unavailable, retrying: {}", e);
                    tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                }
            }
        };

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "pclink".to_string());

        let interval_secs = self.config.get().await.discovery.interval_secs.max(1);
        let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        tracing::info!("Discovery beacon task started (every {}s)", interval_secs);

        loop {
            ticker.tick().await;

            let config = self.config.get().await;
            if !config.discovery.enabled {
                continue;
            }
            // 移动端 API 未激活前不广播
            if !config.auth.setup_completed {
                continue;
            }

            // 每次发送即时取指纹与端口，信标内容与当前状态一致
            let fingerprint = match self.identity.fingerprint().await {
                Ok(fp) => fp,
                Err(e) => {
                    tracing::warn!("Beacon skipped, fingerprint unavailable: {}", e);
                    continue;
                }
            };
            let payload = BeaconPayload {
                magic: BEACON_MAGIC,
                hostname: &hostname,
                port: config.server.port,
                https: true,
                fingerprint: &fingerprint,
            };
            let bytes = match serde_json::to_vec(&payload) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("Beacon serialization failed: {}", e);
                    continue;
                }
            };

            for addr in crate::utils::broadcast_addresses() {
                let target = SocketAddr::from((addr, config.discovery.port));
                if let Err(e) = socket.send_to(&bytes, target).await {
                    tracing::debug!("Beacon send to {} failed: {}", target, e);
                }
            }
        }
    }
}
