//! Gate IM 状态服务
//!
//! 用户状态、最后在线时间与好友关系的权威服务。
//! 持久层为共享数据库驱动，状态更新写穿 Redis 缓存。

mod service;

use std::process::ExitCode;
use std::sync::Arc;

use gate_im_core::balancer::{LoadBalancer, ServiceRegistry};
use gate_im_core::cache::{PresenceCache, RedisManager};
use gate_im_core::config::load_config;
use gate_im_core::db::DatabaseManager;
use gate_im_core::service_names::DATABASE;
use gate_proto::status::status_service_server::StatusServiceServer;
use tonic::transport::Server;
use tracing::{error, info};

use crate::service::StatusServiceImpl;

/// 默认监听端口
const DEFAULT_PORT: u16 = 50051;

#[tokio::main]
async fn main() -> ExitCode {
    let mut port = DEFAULT_PORT;
    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("--port=") {
            match value.parse() {
                Ok(parsed) => port = parsed,
                Err(err) => {
                    eprintln!("Invalid --port value {}: {}", value, err);
                    return ExitCode::FAILURE;
                }
            }
        } else {
            eprintln!("Usage: gate-status [--port=<n>]");
            return ExitCode::FAILURE;
        }
    }

    let config = match load_config(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load config: {:#}", err);
            return ExitCode::FAILURE;
        }
    };
    config.logging.install();

    let balancer = Arc::new(LoadBalancer::new());
    let registry = ServiceRegistry::new(balancer.clone());
    for replica in &config.database.replicas {
        registry.register_service(DATABASE, &replica.host, replica.port, replica.weight);
    }

    let db = Arc::new(DatabaseManager::new(balancer, config.database.clone()));
    if let Err(err) = db.connect().await {
        error!(error = %err, "Failed to connect to database, aborting startup");
        return ExitCode::FAILURE;
    }

    let cache = match RedisManager::new(&config.redis) {
        Ok(cache) => PresenceCache::new(Arc::new(cache)),
        Err(err) => {
            error!(error = %err, "Invalid redis configuration, aborting startup");
            return ExitCode::FAILURE;
        }
    };

    let addr = match format!("0.0.0.0:{}", port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "Invalid listen address");
            return ExitCode::FAILURE;
        }
    };
    let service = StatusServiceImpl::new(db.clone(), cache);

    info!(addr = %addr, "Starting status service");
    if let Err(err) = Server::builder()
        .add_service(StatusServiceServer::new(service))
        .serve(addr)
        .await
    {
        error!(error = %err, "gRPC server failed");
        return ExitCode::FAILURE;
    }

    db.disconnect().await;
    ExitCode::SUCCESS
}
