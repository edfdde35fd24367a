// src/server.rs

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, patch, post, put},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::auth::{
    auth_middleware, middleware::service_toggle_middleware, require_operator, AuthState,
    OperatorAuthManager, RateLimiter, RateLimiterConfig, ToggleState,
};
use crate::config::{Config, ConfigStore, SharedConfig};
use crate::discovery::DiscoveryBeacon;
use crate::error::{AppError, AppResult};
use crate::handlers::{devices, files, operator, pairing, server_ctl, status, transfers, ws};
use crate::hub::{SessionHub, SubscriberClass};
use crate::identity::IdentityStore;
use crate::models::{EventEnvelope, EventKind};
use crate::pairing::PairingBroker;
use crate::storage::DeviceRegistry;
use crate::transfer::TransferEngine;

/// 服务器状态广播周期
const STATUS_BROADCAST_SECS: u64 = 5;

/// 全部共享组件。监听器可以独立起停，组件内的状态
/// （操作员会话、传输会话、设备注册表）不随之丢失
pub struct AppContext {
    pub data_dir: PathBuf,
    pub config: SharedConfig,
    pub identity: Arc<IdentityStore>,
    pub registry: Arc<DeviceRegistry>,
    pub operator: Arc<OperatorAuthManager>,
    pub hub: Arc<SessionHub>,
    pub broker: Arc<PairingBroker>,
    pub engine: Arc<TransferEngine>,
    pub pairing_limiter: Arc<RateLimiter>,
    pub login_limiter: Arc<RateLimiter>,
    pub shutdown_tx: mpsc::Sender<()>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// 请求体上限（字节），监听器启动时从配置取定
    max_body_bytes: usize,
    listener: Mutex<Option<axum_server::Handle>>,
}

impl AppContext {
    /// 装配全部组件并恢复磁盘状态
    pub async fn new(data_dir: &Path) -> AppResult<(Arc<Self>, mpsc::Receiver<()>)> {
        tokio::fs::create_dir_all(data_dir).await?;

        let config = Config::load(data_dir)?;
        let max_body_bytes = config.files.max_upload_mb.saturating_mul(1024 * 1024);
        let config: SharedConfig = Arc::new(ConfigStore::new(data_dir, config));

        let identity = Arc::new(IdentityStore::load_or_init(data_dir).await?);
        let registry = Arc::new(DeviceRegistry::load(data_dir).await?);
        let operator = Arc::new(OperatorAuthManager::new(config.clone()));
        let hub = SessionHub::new();
        let broker = PairingBroker::new();
        let engine = TransferEngine::new(data_dir, config.clone(), hub.clone()).await?;

        let pairing_limiter = Arc::new(RateLimiter::new(RateLimiterConfig::pairing()));
        let login_limiter = Arc::new(RateLimiter::new(RateLimiterConfig::login()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let ctx = Arc::new(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            identity,
            registry,
            operator,
            hub,
            broker,
            engine,
            pairing_limiter,
            login_limiter,
            shutdown_tx,
            started_at: chrono::Utc::now(),
            max_body_bytes,
            listener: Mutex::new(None),
        });
        Ok((ctx, shutdown_rx))
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            registry: self.registry.clone(),
            identity: self.identity.clone(),
            operator: self.operator.clone(),
        }
    }

    /// 启动后台任务：发现信标、过期清理、限速器回收、状态广播
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        DiscoveryBeacon::new(self.config.clone(), self.identity.clone()).spawn();
        self.engine.clone().start_cleanup_task();
        self.pairing_limiter.clone().start_cleanup_task();
        self.login_limiter.clone().start_cleanup_task();

        let ctx = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(STATUS_BROADCAST_SECS));
            let hostname = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "pclink".to_string());
            loop {
                interval.tick().await;
                let devices = ctx.hub.connected_devices().await;
                ctx.hub
                    .publish(
                        SubscriberClass::Operator,
                        EventEnvelope::new(
                            EventKind::ServerStatus,
                            json!({
                                "hostname": hostname,
                                "version": env!("CARGO_PKG_VERSION"),
                                "uptime_secs": (chrono::Utc::now() - ctx.started_at).num_seconds(),
                                "connected_devices": devices.len(),
                            }),
                        ),
                    )
                    .await;
            }
        });
    }
}

/// 请求编号中间件：注入编号、回写响应头，5xx 带编号记日志
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    request.extensions_mut().insert(RequestId(id));

    let mut response = next.run(request).await;
    if response.status().is_server_error() {
        tracing::error!(request_id = %id, status = %response.status(), "Handler returned server error");
    }
    if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// 构建路由。中间件顺序：请求编号 → 认证 → 能力开关 → 处理器
pub fn build_router(ctx: Arc<AppContext>) -> Router {
    let auth_state = ctx.auth_state();
    let max_body = ctx.max_body_bytes;

    // 公开端点（登录与配对限速在处理器内按 IP 执行）
    let public = Router::new()
        .route("/status", get(status::status))
        .route("/qr-payload", get(status::qr_payload))
        .route("/pairing/request", post(pairing::request))
        .route("/auth/setup", post(operator::setup))
        .route("/auth/login", post(operator::login))
        .route("/auth/status", get(operator::auth_status))
        .route("/ws", get(ws::device_ws))
        .route("/ws/ui", get(ws::operator_ws));

    // 设备或操作员均可
    let protected = Router::new()
        .route("/ping", get(status::ping))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth_middleware,
        ));

    // 文件能力组：认证 + file_browser 开关
    let files_router = Router::new()
        .route("/files/config", get(files::transfer_config))
        .route("/files/upload", post(files::initiate_upload))
        .route("/files/upload/:id", delete(files::cancel_upload))
        .route("/files/upload/:id/status", get(files::upload_status))
        .route("/files/upload/:id/pause", post(files::pause_upload))
        .route("/files/upload/:id/resume", post(files::resume_upload))
        .route("/files/upload/:id/:chunk", put(files::put_chunk))
        .route("/files/download/*path", get(files::download))
        .route("/files/stream", get(files::stream))
        .route("/files/*path", put(files::direct_upload))
        .layer(middleware::from_fn_with_state(
            ToggleState {
                config: ctx.config.clone(),
                service: "file_browser",
            },
            service_toggle_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            auth_middleware,
        ));

    // 操作员专用
    let operator_router = Router::new()
        .route("/pairing/approve", post(pairing::approve))
        .route("/pairing/deny", post(pairing::deny))
        .route("/devices", get(devices::list))
        .route("/devices/revoke", post(devices::revoke))
        .route("/devices/remove-all", post(devices::remove_all))
        .route("/auth/logout", post(operator::logout))
        .route("/auth/change-password", post(operator::change_password))
        .route("/auth/check", get(operator::auth_check))
        .route("/auth/rotate-api-key", post(operator::rotate_api_key))
        .route("/server/start", post(server_ctl::start))
        .route("/server/stop", post(server_ctl::stop))
        .route("/server/restart", post(server_ctl::restart))
        .route("/server/shutdown", post(server_ctl::shutdown))
        .route("/transfers/active", get(transfers::active))
        .route("/transfers/cleanup/status", get(transfers::cleanup_status))
        .route("/transfers/cleanup/config", patch(transfers::cleanup_config))
        .route("/transfers/cleanup/execute", post(transfers::cleanup_execute))
        .layer(middleware::from_fn(require_operator))
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware));

    public
        .merge(protected)
        .merge(files_router)
        .merge(operator_router)
        .with_state(ctx)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// 启动 TLS 监听器。已在运行时为空操作
pub async fn start_listener(ctx: Arc<AppContext>) -> AppResult<()> {
    let mut slot = ctx.listener.lock().await;
    if slot.is_some() {
        return Ok(());
    }

    let config = ctx.config.get().await;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| AppError::Config(format!("invalid listen address: {}", e)))?;

    let rustls = RustlsConfig::from_pem_file(ctx.identity.cert_path(), ctx.identity.key_path())
        .await
        .map_err(|e| AppError::Config(format!("TLS material unusable: {}", e)))?;

    // 同步绑定，端口被占用时立刻失败
    let std_listener = bind_with_retry(addr).await?;

    let handle = axum_server::Handle::new();
    let router = build_router(ctx.clone());
    let serve_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = axum_server::from_tcp_rustls(std_listener, rustls)
            .handle(serve_handle)
            .serve(router.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            tracing::error!("Listener terminated: {}", e);
        }
    });

    *slot = Some(handle);
    tracing::info!("HTTPS listener started on {}", addr);
    Ok(())
}

/// 重启窗口内旧套接字可能尚未完全释放，短暂重试
async fn bind_with_retry(addr: SocketAddr) -> AppResult<std::net::TcpListener> {
    let mut last_err = None;
    for _ in 0..5 {
        match std::net::TcpListener::bind(addr) {
            Ok(listener) => {
                listener
                    .set_nonblocking(true)
                    .map_err(|e| AppError::Config(format!("listener setup failed: {}", e)))?;
                return Ok(listener);
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
            }
        }
    }
    Err(AppError::Config(format!(
        "cannot bind {}: {}",
        addr,
        last_err.expect("at least one attempt")
    )))
}

/// 停止监听器。进行中的请求有短暂的收尾窗口
pub async fn stop_listener(ctx: &Arc<AppContext>) {
    let mut slot = ctx.listener.lock().await;
    if let Some(handle) = slot.take() {
        handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        tracing::info!("HTTPS listener stopping");
    }
}

/// 同配置重启。操作员会话存于 AppContext，Cookie 不失效
pub async fn restart_listener(ctx: Arc<AppContext>) -> AppResult<()> {
    stop_listener(&ctx).await;
    tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;
    start_listener(ctx).await
}

pub async fn listener_running(ctx: &Arc<AppContext>) -> bool {
    ctx.listener.lock().await.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    const PEER: SocketAddr = SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 50)),
        40000,
    );

    async fn test_ctx() -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let (ctx, _rx) = AppContext::new(dir.path()).await.unwrap();
        (ctx, dir)
    }

    fn request(method: &str, uri: &str, api_key: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut().insert(ConnectInfo(PEER));
        req
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    }

    #[tokio::test]
    async fn test_status_is_public() {
        let (ctx, _dir) = test_ctx().await;
        let router = build_router(ctx);

        let response = router.oneshot(request("GET", "/status", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["setup_completed"], false);
    }

    #[tokio::test]
    async fn test_protected_route_requires_credential() {
        let (ctx, _dir) = test_ctx().await;
        let router = build_router(ctx);

        let response = router.oneshot(request("GET", "/ping", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "missing_credential");
    }

    #[tokio::test]
    async fn test_server_key_is_accepted() {
        let (ctx, _dir) = test_ctx().await;
        let key = ctx.identity.api_key().await;
        let router = build_router(ctx);

        let response = router
            .oneshot(request("GET", "/ping", Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_garbage_key_is_rejected() {
        let (ctx, _dir) = test_ctx().await;
        let router = build_router(ctx);

        let response = router
            .oneshot(request("GET", "/ping", Some("not-a-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "invalid_credential");
    }

    #[tokio::test]
    async fn test_device_key_cannot_reach_operator_routes() {
        let (ctx, _dir) = test_ctx().await;
        let device = ctx
            .registry
            .approve("phone".into(), "android".into(), "1".into(), PEER.ip())
            .await
            .unwrap();
        let router = build_router(ctx);

        let response = router
            .oneshot(request("POST", "/devices/remove-all", Some(&device.device_key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_revoked_device_gets_revoked_code() {
        let (ctx, _dir) = test_ctx().await;
        let device = ctx
            .registry
            .approve("phone".into(), "android".into(), "1".into(), PEER.ip())
            .await
            .unwrap();
        ctx.registry.revoke(device.id).await.unwrap();
        let router = build_router(ctx);

        let response = router
            .oneshot(request("GET", "/ping", Some(&device.device_key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "revoked_credential");
    }

    #[tokio::test]
    async fn test_service_toggle_blocks_files_group() {
        let (ctx, _dir) = test_ctx().await;
        ctx.config
            .update(|c| c.services.file_browser = false)
            .await
            .unwrap();
        let key = ctx.identity.api_key().await;
        let router = build_router(ctx);

        let response = router
            .oneshot(request("GET", "/files/config", Some(&key)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["code"], "service_disabled");
    }

    #[tokio::test]
    async fn test_pairing_round_trip_through_router() {
        let (ctx, _dir) = test_ctx().await;
        let router = build_router(ctx.clone());

        // 另一侧扮演操作员：收到票据即批准
        let approver = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    let tickets = ctx.broker.pending_count().await;
                    if tickets == 0 {
                        continue;
                    }
                    // 从注册请求中恢复票据编号：测试里直接遍历等待中的票据
                    if let Some(id) = ctx.broker.first_pending().await {
                        if let crate::pairing::Claim::Granted(ticket) =
                            ctx.broker.claim(id).await.unwrap()
                        {
                            let device = ctx
                                .registry
                                .approve(
                                    ticket.device_name,
                                    ticket.platform,
                                    ticket.client_version,
                                    ticket.client_ip,
                                )
                                .await
                                .unwrap();
                            ctx.broker.finish_approved(id, device.device_key).await;
                        }
                        return;
                    }
                }
            })
        };

        let mut req = HttpRequest::builder()
            .method("POST")
            .uri("/pairing/request")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"device_name": "phone-A", "platform": "android"}).to_string(),
            ))
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(PEER));

        let response = router.oneshot(req).await.unwrap();
        approver.await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        // 32 位十六进制密钥 + 64 位十六进制指纹
        assert_eq!(body["api_key"].as_str().unwrap().len(), 32);
        assert_eq!(body["cert_fingerprint"].as_str().unwrap().len(), 64);

        let devices = ctx.registry.list().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "phone-A");
    }

    #[tokio::test]
    async fn test_denied_pairing_returns_403() {
        let (ctx, _dir) = test_ctx().await;
        let router = build_router(ctx.clone());

        let denier = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                    if let Some(id) = ctx.broker.first_pending().await {
                        ctx.broker.deny(id).await.unwrap();
                        return;
                    }
                }
            })
        };

        let mut req = HttpRequest::builder()
            .method("POST")
            .uri("/pairing/request")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"device_name": "phone-B"}).to_string(),
            ))
            .unwrap();
        req.extensions_mut().insert(ConnectInfo(PEER));

        let response = router.oneshot(req).await.unwrap();
        denier.await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["code"], "pairing_denied");
        assert!(ctx.registry.list().await.is_empty());
    }
}
