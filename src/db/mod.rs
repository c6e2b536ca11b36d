//! 数据库驱动模块
//!
//! 对复制的关系库做串行化访问：驱动不可重入，单把互斥锁覆盖
//! 全部操作；公有方法加锁，`_impl` 辅助函数假设锁已持有。
//! 连接为惰性建立，失败时把当前实例标记为不健康并换下一个副本重试。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, PgConnection, Row};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{info, warn};

use crate::auth::sha256_hex;
use crate::balancer::{BalanceAlgorithm, LoadBalancer};
use crate::config::DatabaseConfig;
use crate::error::{GateError, Result};
use crate::service_names::DATABASE;

/// 用户搜索返回的行数上限
const SEARCH_LIMIT: i64 = 20;

/// 一条历史消息
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub sender_id: i32,
    pub receiver_id: i32,
    pub content: String,
    pub ts: DateTime<Utc>,
}

/// 数据库驱动
pub struct DatabaseManager {
    balancer: Arc<LoadBalancer>,
    config: DatabaseConfig,
    conn: Mutex<Option<PgConnection>>,
}

impl DatabaseManager {
    pub fn new(balancer: Arc<LoadBalancer>, config: DatabaseConfig) -> Self {
        Self {
            balancer,
            config,
            conn: Mutex::new(None),
        }
    }

    /// 建立连接，幂等
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        self.connect_impl(&mut slot).await
    }

    /// 断开连接，幂等
    pub async fn disconnect(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            if let Err(err) = conn.close().await {
                warn!(error = %err, "Error while closing database connection");
            }
            info!("Disconnected from database");
        }
    }

    /// 当前是否持有存活连接
    pub async fn is_connected(&self) -> bool {
        let mut slot = self.conn.lock().await;
        match slot.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    /// 无锁的连接实现，假设调用者已持有 `self.conn` 的锁
    ///
    /// 逐个尝试负载均衡器给出的副本；连接失败的实例被标记为
    /// 不健康，直到副本耗尽。
    async fn connect_impl(&self, slot: &mut Option<PgConnection>) -> Result<()> {
        if slot.is_some() {
            return Ok(());
        }

        let attempts = self.balancer.instances(DATABASE).len().max(1);
        for _ in 0..attempts {
            let Some(inst) = self.balancer.pick(DATABASE, BalanceAlgorithm::RoundRobin) else {
                break;
            };
            let options = PgConnectOptions::new()
                .host(&inst.host)
                .port(inst.port)
                .username(&self.config.user)
                .password(&self.config.password)
                .database(&self.config.dbname)
                .options([("statement_timeout", "10000")]);

            let timeout = Duration::from_secs(self.config.connect_timeout_secs);
            match time::timeout(timeout, options.connect()).await {
                Ok(Ok(conn)) => {
                    info!(host = %inst.host, port = inst.port, "Connected to database");
                    *slot = Some(conn);
                    return Ok(());
                }
                Ok(Err(err)) => {
                    warn!(
                        host = %inst.host,
                        port = inst.port,
                        error = %err,
                        "Database connect failed, marking instance unhealthy"
                    );
                    self.balancer
                        .update_health(DATABASE, &inst.host, inst.port, false);
                }
                Err(_) => {
                    warn!(
                        host = %inst.host,
                        port = inst.port,
                        "Database connect timed out, marking instance unhealthy"
                    );
                    self.balancer
                        .update_health(DATABASE, &inst.host, inst.port, false);
                }
            }
        }

        Err(GateError::BackendUnavailable(
            "no healthy database instance".to_string(),
        ))
    }

    /// 确保连接可用并返回其可变引用，假设锁已持有
    async fn ensure_impl<'a>(
        &self,
        slot: &'a mut Option<PgConnection>,
    ) -> Result<&'a mut PgConnection> {
        let alive = match slot.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };
        if !alive {
            if slot.take().is_some() {
                warn!("Database connection lost, reconnecting");
            }
            self.connect_impl(slot).await?;
        }
        slot.as_mut()
            .ok_or_else(|| GateError::BackendUnavailable("database connection missing".to_string()))
    }

    /// 无锁的用户存在性检查，假设锁已持有
    async fn user_exists_impl(conn: &mut PgConnection, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT id FROM users WHERE username = $1 LIMIT 1")
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// 创建用户，返回分配的用户 ID
    ///
    /// 密码以 SHA-256 十六进制入库，用户名重复时返回冲突错误。
    pub async fn create_user(&self, username: &str, password: &str, email: &str) -> Result<i32> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        if Self::user_exists_impl(conn, username).await? {
            return Err(GateError::Conflict("Username already exists".to_string()));
        }

        let password_hash = sha256_hex(password);
        let row =
            sqlx::query("INSERT INTO users (username, password, email) VALUES ($1, $2, $3) RETURNING id")
                .bind(username)
                .bind(&password_hash)
                .bind(email)
                .fetch_one(&mut *conn)
                .await?;
        let user_id: i32 = row.try_get("id")?;
        info!(user_id = user_id, username = %username, "User created");
        Ok(user_id)
    }

    /// 按用户名查询 (用户 ID, 密码哈希)
    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<(i32, String)>> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let row = sqlx::query("SELECT id, password FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("id")?, row.try_get("password")?))),
            None => Ok(None),
        }
    }

    pub async fn user_exists(&self, username: &str) -> Result<bool> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;
        Self::user_exists_impl(conn, username).await
    }

    /// 按用户 ID 查询用户名
    pub async fn get_username(&self, user_id: i32) -> Result<Option<String>> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let row = sqlx::query("SELECT username FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("username")?)),
            None => Ok(None),
        }
    }

    /// 持久化一条单聊消息
    pub async fn store_message(&self, sender_id: i32, receiver_id: i32, content: &str) -> Result<()> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        sqlx::query("INSERT INTO messages (sender_id, receiver_id, content, ts) VALUES ($1, $2, $3, NOW())")
            .bind(sender_id)
            .bind(receiver_id)
            .bind(content)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// 按用户名子串搜索用户，行数受限
    pub async fn search_users(&self, query: &str) -> Result<Vec<(i32, String)>> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query("SELECT id, username FROM users WHERE username LIKE $1 ORDER BY id LIMIT $2")
            .bind(&pattern)
            .bind(SEARCH_LIMIT)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("id")?, row.try_get("username")?)))
            .collect()
    }

    /// 查询两个用户之间最近的聊天记录，按时间升序返回
    pub async fn chat_history(
        &self,
        user_id: i32,
        peer_id: i32,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let rows = sqlx::query(
            "SELECT sender_id, receiver_id, content, ts FROM messages \
             WHERE (sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1) \
             ORDER BY ts DESC LIMIT $3",
        )
        .bind(user_id)
        .bind(peer_id)
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;

        let mut records: Vec<MessageRecord> = rows
            .iter()
            .map(|row| {
                Ok(MessageRecord {
                    sender_id: row.try_get("sender_id")?,
                    receiver_id: row.try_get("receiver_id")?,
                    content: row.try_get("content")?,
                    ts: row.try_get("ts")?,
                })
            })
            .collect::<Result<_>>()?;
        records.reverse();
        Ok(records)
    }

    /// 幂等写入用户状态（INSERT ... ON CONFLICT 更新）
    pub async fn update_user_status(
        &self,
        user_id: i32,
        status: &str,
        session_token: &str,
    ) -> Result<()> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        sqlx::query(
            "INSERT INTO user_status (user_id, status, last_seen, session_token) \
             VALUES ($1, $2, NOW(), $3) \
             ON CONFLICT (user_id) DO UPDATE SET \
             status = EXCLUDED.status, last_seen = NOW(), session_token = EXCLUDED.session_token",
        )
        .bind(user_id)
        .bind(status)
        .bind(session_token)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 读取用户状态与最后在线时间
    pub async fn get_user_status(&self, user_id: i32) -> Result<Option<(String, DateTime<Utc>)>> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let row = sqlx::query("SELECT status, last_seen FROM user_status WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("status")?, row.try_get("last_seen")?))),
            None => Ok(None),
        }
    }

    /// 好友关系是否已存在（单向判定）
    pub async fn friend_exists(&self, user_id: i32, friend_id: i32) -> Result<bool> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let row = sqlx::query("SELECT 1 AS present FROM user_friends WHERE user_id = $1 AND friend_id = $2")
            .bind(user_id)
            .bind(friend_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// 写入双向好友关系
    pub async fn add_friend(&self, user_id: i32, friend_id: i32) -> Result<()> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        for (a, b) in [(user_id, friend_id), (friend_id, user_id)] {
            sqlx::query(
                "INSERT INTO user_friends (user_id, friend_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(a)
            .bind(b)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// 查询好友 ID 及用户名
    pub async fn friends_of(&self, user_id: i32) -> Result<Vec<(i32, String)>> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_impl(&mut slot).await?;

        let rows = sqlx::query(
            "SELECT f.friend_id, u.username FROM user_friends f \
             JOIN users u ON u.id = f.friend_id \
             WHERE f.user_id = $1 ORDER BY f.friend_id",
        )
        .bind(user_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("friend_id")?, row.try_get("username")?)))
            .collect()
    }
}
