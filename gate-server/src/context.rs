//! 服务器根上下文
//!
//! 进程级共享服务以 `Arc` 字段形式挂在根上下文上，
//! 由监听器逐层传给 HTTP 会话和 WebSocket 会话。

use std::sync::Arc;

use gate_im_core::balancer::LoadBalancer;
use gate_im_core::config::AppConfig;
use gate_im_core::db::DatabaseManager;

use crate::http::rate_limit::RateLimiter;
use crate::status::StatusClientPool;
use crate::ws::{ConnectionRegistry, WebSocketManager};

/// 网关根上下文
///
/// Redis 缓存不在此列：状态写穿与缓存优先读取都发生在状态服务侧，
/// 网关本身不直接持有缓存连接。
pub struct ServerContext {
    pub config: AppConfig,
    pub balancer: Arc<LoadBalancer>,
    pub db: Arc<DatabaseManager>,
    pub status_pool: Arc<StatusClientPool>,
    /// 连接注册表：用户 → 会话集合，含活动时间
    pub connections: Arc<ConnectionRegistry>,
    /// WebSocket 管理器：用户 → 存活会话句柄
    pub sessions: Arc<WebSocketManager>,
    pub rate_limiter: Arc<RateLimiter>,
}
