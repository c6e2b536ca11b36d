//! Gate IM 网关服务器
//!
//! 负责终结客户端连接：HTTP 凭据交换、WebSocket 升级、
//! 在线状态同步与消息转发。

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use gate_im_core::balancer::{HealthChecker, LoadBalancer, ServiceRegistry};
use gate_im_core::config::load_config;
use gate_im_core::db::DatabaseManager;
use gate_im_core::service_names::{DATABASE, STATUS};
use tracing::{error, info, warn};

use gate_server::context::ServerContext;
use gate_server::http::rate_limit::RateLimiter;
use gate_server::listener::Listener;
use gate_server::status::StatusClientPool;
use gate_server::ws::{ConnectionRegistry, WebSocketManager};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("Usage: gate-server <address> <port>");
        eprintln!("Example:");
        eprintln!("    gate-server 0.0.0.0 8080");
        return ExitCode::FAILURE;
    }

    let address: IpAddr = match args[1].parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("Invalid address {}: {}", args[1], err);
            return ExitCode::FAILURE;
        }
    };
    let port: u16 = match args[2].parse() {
        Ok(port) => port,
        Err(err) => {
            eprintln!("Invalid port {}: {}", args[2], err);
            return ExitCode::FAILURE;
        }
    };

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    config.logging.install();

    // 注册后端副本：数据库与状态服务共用同一个负载均衡器
    let balancer = Arc::new(LoadBalancer::new());
    let registry = Arc::new(ServiceRegistry::new(balancer.clone()));
    for replica in &config.database.replicas {
        registry.register_service(DATABASE, &replica.host, replica.port, replica.weight);
    }
    for replica in &config.status.replicas {
        registry.register_service(STATUS, &replica.host, replica.port, replica.weight);
    }

    let db = Arc::new(DatabaseManager::new(balancer.clone(), config.database.clone()));
    if let Err(err) = db.connect().await {
        error!(error = %err, "Failed to connect to database, aborting startup");
        return ExitCode::FAILURE;
    }

    let status_pool = Arc::new(StatusClientPool::new(
        balancer.clone(),
        config.status.clone(),
    ));
    if let Err(err) = status_pool.initialize() {
        warn!(error = %err, "Status client pool initialization failed, stubs will be built on demand");
    }

    let health_checker = HealthChecker::new(
        balancer.clone(),
        registry.clone(),
        Duration::from_secs(config.health_check.timeout_secs),
    );
    health_checker.start(Duration::from_secs(config.health_check.interval_secs));

    let ctx = Arc::new(ServerContext {
        config: config.clone(),
        balancer,
        db,
        status_pool,
        connections: Arc::new(ConnectionRegistry::new()),
        sessions: Arc::new(WebSocketManager::new()),
        rate_limiter: Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            Duration::from_secs(config.rate_limit.window_secs),
        )),
    });

    // 过期会话清扫
    let sweep_ctx = ctx.clone();
    let sweep_interval = Duration::from_secs(config.session.sweep_interval_secs);
    let idle_timeout = Duration::from_secs(config.session.idle_timeout_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let removed = sweep_ctx.connections.sweep_expired(idle_timeout);
            if !removed.is_empty() {
                info!(count = removed.len(), "Swept expired sessions");
            }
        }
    });

    let addr = SocketAddr::new(address, port);
    let listener = Listener::new(ctx.clone());
    let bound = match listener.start(addr).await {
        Ok(bound) => bound,
        Err(err) => {
            error!(error = %err, addr = %addr, "Failed to start listener");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %bound, "GateServer listening");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to wait for shutdown signal");
    }
    info!("Shutdown signal received, stopping");
    listener.stop().await;
    health_checker.stop();
    ctx.sessions.cleanup();
    ctx.db.disconnect().await;
    ExitCode::SUCCESS
}
