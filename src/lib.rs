//! Gate IM 公共库
//!
//! 为网关（gate-server）和状态服务（gate-status）提供统一的
//! 配置加载、错误类型、负载均衡、数据库与缓存访问能力。

pub mod auth;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod service_names;

pub use auth::{generate_token, mint_session_id, sha256_hex, verify_token};
pub use balancer::{
    BalanceAlgorithm, HealthChecker, LoadBalancer, ServiceInstance, ServiceRegistry,
};
pub use cache::RedisManager;
pub use config::{load_config, AppConfig, LoggingConfig};
pub use db::DatabaseManager;
pub use error::{GateError, Result};
pub use service_names::{get_service_name, DATABASE, STATUS};
