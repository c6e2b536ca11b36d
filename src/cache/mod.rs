//! Redis 缓存访问模块
//!
//! 连接池前置的键值访问：字符串、哈希、有序集合与发布/订阅。
//! 每次操作从池中借出一条连接，用完归还；池满时多余连接直接丢弃。

mod presence;

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::RedisConfig;
use crate::error::Result;

pub use presence::PresenceCache;

/// Redis 管理器
pub struct RedisManager {
    client: redis::Client,
    pool: Mutex<Vec<ConnectionManager>>,
    pool_size: usize,
}

impl RedisManager {
    /// 创建管理器；连接惰性建立，此处不做网络 IO
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let url = format!("redis://{}:{}/", config.host, config.port);
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            pool: Mutex::new(Vec::new()),
            pool_size: config.pool_size,
        })
    }

    /// 从池中借出连接，池空时新建
    async fn get_connection(&self) -> Result<ConnectionManager> {
        if let Some(conn) = self.pool.lock().await.pop() {
            return Ok(conn);
        }
        Ok(ConnectionManager::new(self.client.clone()).await?)
    }

    /// 归还连接，池满时丢弃
    async fn return_connection(&self, conn: ConnectionManager) {
        let mut pool = self.pool.lock().await;
        if pool.len() < self.pool_size {
            pool.push(conn);
        }
    }

    // ==================== 字符串操作 ====================

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = conn.set(key, value).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    /// 原子递增，返回递增后的值
    pub async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<i64> = conn.incr(key, 1i64).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = conn.del(key).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    // ==================== 哈希操作 ====================

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = conn.hset(key, field, value).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    /// 一次写入多个哈希字段
    pub async fn hset_multiple(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = conn.hset_multiple(key, fields).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<Option<String>> = conn.hget(key, field).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = conn.hdel(key, field).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<HashMap<String, String>> = conn.hgetall(key).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    // ==================== 有序集合操作 ====================

    pub async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<()> = conn.zadd(key, member, score).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    pub async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<Vec<String>> = conn.zrange(key, start, stop).await;
        self.return_connection(conn).await;
        Ok(result?)
    }

    // ==================== 发布/订阅 ====================

    pub async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let result: redis::RedisResult<i64> = conn.publish(channel, message).await;
        self.return_connection(conn).await;
        result?;
        Ok(())
    }

    /// 订阅频道，消息以 (频道, 负载) 形式从返回的接收端读取
    ///
    /// 订阅连接独立于连接池，由后台任务持有；
    /// 接收端被丢弃后任务随之退出。
    pub async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> Result<mpsc::UnboundedReceiver<(String, String)>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &channels {
            pubsub.subscribe(channel).await?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "Failed to decode pubsub payload");
                        continue;
                    }
                };
                if tx.send((channel, payload)).is_err() {
                    debug!("Pubsub receiver dropped, stopping subscription task");
                    break;
                }
            }
        });
        Ok(rx)
    }
}
