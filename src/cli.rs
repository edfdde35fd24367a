// src/cli.rs

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::Path;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::identity::{API_KEY_FILE, CERT_FILE};
use crate::utils::CryptoUtils;

/// 进程退出码
pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_ALREADY_RUNNING: i32 = 2;
pub const EXIT_BAD_CONFIG: i32 = 3;

#[derive(Parser)]
#[command(name = "pclink")]
#[command(about = "PCLink remote control server", long_about = None)]
#[command(version)]
pub struct Cli {
    /// 随系统启动模式：不打开浏览器，日志仅写文件
    #[arg(long)]
    pub startup: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 启动服务器（默认命令）
    Start,
    /// 停止正在运行的实例
    Stop,
    /// 重启正在运行实例的监听器
    Restart,
    /// 查询运行状态
    Status,
    /// 输出最近的日志
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// 打印配对二维码载荷
    Qr,
    /// 设置操作员口令
    Setup,
    /// 打印配对引导信息
    Pair,
}

/// 本机控制通道：对运行中的实例走 HTTPS 回环。
/// 证书是自签名的，客户端信任由本机数据目录背书
fn control_client() -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| AppError::Internal(format!("control client: {}", e)))
}

async fn control_post(data_dir: &Path, path: &str) -> AppResult<reqwest::Response> {
    let config = Config::load(data_dir)?;
    let api_key = std::fs::read_to_string(data_dir.join(API_KEY_FILE))
        .map_err(|_| AppError::Config("no api_key file; is the server initialized?".to_string()))?;

    let url = format!("https://127.0.0.1:{}{}", config.server.port, path);
    control_client()?
        .post(&url)
        .header("x-api-key", api_key.trim())
        .send()
        .await
        .map_err(|e| AppError::Internal(format!("server unreachable: {}", e)))
}

/// `stop`：请求运行中的实例退出
pub async fn run_stop(data_dir: &Path) -> i32 {
    match control_post(data_dir, "/server/shutdown").await {
        Ok(resp) if resp.status().is_success() => {
            println!("Server is shutting down.");
            EXIT_OK
        }
        Ok(resp) => {
            eprintln!("Server refused: {}", resp.status());
            EXIT_ERROR
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_ERROR
        }
    }
}

/// `restart`：重启监听器
pub async fn run_restart(data_dir: &Path) -> i32 {
    match control_post(data_dir, "/server/restart").await {
        Ok(resp) if resp.status().is_success() => {
            println!("Listener restarting.");
            EXIT_OK
        }
        Ok(resp) => {
            eprintln!("Server refused: {}", resp.status());
            EXIT_ERROR
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_ERROR
        }
    }
}

/// `status`：探测 /status
pub async fn run_status(data_dir: &Path) -> i32 {
    let config = match Config::load(data_dir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };
    let url = format!("https://127.0.0.1:{}/status", config.server.port);

    let client = match control_client() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_ERROR;
        }
    };
    match client.get(&url).send().await {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(body) => {
                println!("running (port {})", config.server.port);
                if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
                    println!("version: {}", version);
                }
                if let Some(devices) = body.get("connected_devices") {
                    println!("connected devices: {}", devices);
                }
                EXIT_OK
            }
            Err(_) => {
                println!("running (port {})", config.server.port);
                EXIT_OK
            }
        },
        Err(_) => {
            println!("stopped");
            EXIT_OK
        }
    }
}

/// `logs`：输出日志尾部
pub fn run_logs(data_dir: &Path, lines: usize) -> i32 {
    let log_path = data_dir.join("logs").join("pclink.log");
    match std::fs::read_to_string(&log_path) {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            for line in &all[start..] {
                println!("{}", line);
            }
            EXIT_OK
        }
        Err(_) => {
            eprintln!("No log file at {}", log_path.display());
            EXIT_ERROR
        }
    }
}

/// 从磁盘拼配对载荷，不要求服务器在运行
fn local_qr_payload(data_dir: &Path) -> AppResult<serde_json::Value> {
    let config = Config::load(data_dir)?;
    let api_key = std::fs::read_to_string(data_dir.join(API_KEY_FILE))
        .map_err(|_| AppError::Config("no api_key file; start the server once first".to_string()))?;

    let pem = std::fs::read(data_dir.join(CERT_FILE))
        .map_err(|_| AppError::Config("no certificate; start the server once first".to_string()))?;
    let der = rustls_pemfile::certs(&mut pem.as_slice())
        .next()
        .ok_or_else(|| AppError::Config("no certificate in cert.pem".to_string()))?
        .map_err(|e| AppError::Config(format!("certificate unparsable: {}", e)))?;
    let fingerprint = CryptoUtils::cert_fingerprint(&der);

    let ip = crate::utils::local_ipv4_addresses()
        .first()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    Ok(serde_json::json!({
        "protocol": "https",
        "ip": ip,
        "port": config.server.port,
        "apiKey": api_key.trim(),
        "certFingerprint": fingerprint,
    }))
}

/// `qr`：打印配对载荷 JSON
pub fn run_qr(data_dir: &Path) -> i32 {
    match local_qr_payload(data_dir) {
        Ok(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_ERROR
        }
    }
}

/// `pair`：配对引导
pub fn run_pair(data_dir: &Path) -> i32 {
    match local_qr_payload(data_dir) {
        Ok(payload) => {
            println!("Scan this payload with the mobile client, or enter it manually:");
            println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_default());
            println!();
            println!("The client will then send a pairing request; approve it in the web UI.");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_ERROR
        }
    }
}

fn prompt(label: &str) -> std::io::Result<String> {
    print!("{}", label);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// `setup`：交互式设置操作员口令（直接写配置文件）
pub async fn run_setup(data_dir: &Path) -> i32 {
    let config = match Config::load(data_dir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            return EXIT_BAD_CONFIG;
        }
    };
    if config.auth.setup_completed {
        eprintln!("Setup is already completed. Use the web UI to change the password.");
        return EXIT_ERROR;
    }

    let password = match prompt("Operator password (min 8 chars): ") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Input error: {}", e);
            return EXIT_ERROR;
        }
    };
    let confirm = match prompt("Confirm password: ") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Input error: {}", e);
            return EXIT_ERROR;
        }
    };
    if password != confirm {
        eprintln!("Passwords do not match.");
        return EXIT_ERROR;
    }
    if password.chars().count() < 8 {
        eprintln!("Password must be at least 8 characters.");
        return EXIT_ERROR;
    }

    let hash = match CryptoUtils::hash_password(&password) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_ERROR;
        }
    };

    let store = crate::config::ConfigStore::new(data_dir, config);
    let result = store
        .update(|c| {
            c.auth.password_hash = Some(hash);
            c.auth.setup_completed = true;
        })
        .await;
    match result {
        Ok(_) => {
            println!("Setup complete. Restart the server if it is currently running.");
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_ERROR
        }
    }
}
