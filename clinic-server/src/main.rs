//! 诊所服务器主程序

use anyhow::Result;
use clap::Parser;
use clinic_admin::{init_logging, ConfigManager};
use clinic_core::ClinicStore;
use clinic_database::{DatabasePool, DatabaseQueries, MemoryStore, PgStore};
use clinic_web::{AccessGate, AppState, WebServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 诊所服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "clinic-server")]
#[command(about = "诊所患者流转服务：候诊队列、预约号源和患者名册")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 服务器端口，覆盖配置
    #[arg(short, long)]
    port: Option<u16>,

    /// 日志级别，覆盖配置
    #[arg(short, long)]
    log_level: Option<String>,

    /// 使用内存存储
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut manager = ConfigManager::load(args.config.as_deref())?;
    {
        let config = manager.config_mut();
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(level) = args.log_level {
            config.logging.level = level;
        }
        if args.in_memory {
            config.database.in_memory = true;
        }
    }

    // 初始化日志
    init_logging(&manager.config().logging)?;
    manager.validate_config()?;
    let config = manager.into_config();

    info!("启动诊所服务器...");
    info!("诊所服务器配置:");
    info!("  监听地址: {}:{}", config.server.host, config.server.port);
    info!("  预约窗口: {} 天", config.scheduling.booking_window_days);
    info!("  锁等待上限: {} 毫秒", config.database.lock_timeout_ms);

    let store: Arc<dyn ClinicStore> = if config.database.in_memory {
        warn!("使用内存存储，重启后数据将丢失");
        Arc::new(MemoryStore::new(config.database.lock_timeout()))
    } else {
        let pool = DatabasePool::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.connect_timeout(),
        )
        .await?;
        DatabaseQueries::new(&pool).create_tables().await?;
        info!("  数据库: 已连接并完成表结构初始化");
        Arc::new(PgStore::new(pool, config.database.lock_timeout()))
    };

    let gate = AccessGate::new(&config.auth.jwt_secret, config.auth.token_ttl_hours);
    let state = AppState::new(store, gate, config.scheduling.booking_window_days);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let server = WebServer::new(addr, state, &config.web.cors_allowed_origins);

    // 启动服务器
    if let Err(e) = server.run().await {
        error!("服务器启动失败: {}", e);
        return Err(e);
    }

    Ok(())
}
