// src/main.rs

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pclink::cli::{self, Cli, Commands};
use pclink::config;
use pclink::error::AppError;
use pclink::server::{self, AppContext};
use pclink::singleton::InstanceLock;

fn init_tracing(data_dir: &std::path::Path, startup_mode: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pclink=info,tower_http=warn".into());

    let log_dir = data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_layer = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("pclink.log"))
        .ok()
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
        });

    // --startup 模式只写文件
    let stdout_layer = if startup_mode {
        None
    } else {
        Some(tracing_subscriber::fmt::layer())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn run_server(data_dir: &std::path::Path) -> i32 {
    // 单实例锁先于一切副作用
    let _lock = match InstanceLock::acquire(data_dir) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("{}", e);
            return cli::EXIT_ALREADY_RUNNING;
        }
    };

    let (ctx, mut shutdown_rx) = match AppContext::new(data_dir).await {
        Ok(pair) => pair,
        Err(e @ AppError::Config(_)) => {
            eprintln!("{}", e);
            return cli::EXIT_BAD_CONFIG;
        }
        Err(e) => {
            eprintln!("{}", e);
            return cli::EXIT_ERROR;
        }
    };

    ctx.spawn_background_tasks();

    if let Err(e) = server::start_listener(ctx.clone()).await {
        eprintln!("{}", e);
        return cli::EXIT_BAD_CONFIG;
    }

    tracing::info!("PCLink v{} ready", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("Shutdown requested via API");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Signal handler failed: {}", e);
            }
            tracing::info!("Interrupt received, shutting down");
        }
    }

    server::stop_listener(&ctx).await;
    tracing::info!("PCLink stopped");
    cli::EXIT_OK
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    let data_dir = config::data_dir();

    let code = match args.command.unwrap_or(Commands::Start) {
        Commands::Start => {
            init_tracing(&data_dir, args.startup);
            run_server(&data_dir).await
        }
        Commands::Stop => cli::run_stop(&data_dir).await,
        Commands::Restart => cli::run_restart(&data_dir).await,
        Commands::Status => cli::run_status(&data_dir).await,
        Commands::Logs { lines } => cli::run_logs(&data_dir, lines),
        Commands::Qr => cli::run_qr(&data_dir),
        Commands::Setup => cli::run_setup(&data_dir).await,
        Commands::Pair => cli::run_pair(&data_dir),
    };
    std::process::exit(code);
}
