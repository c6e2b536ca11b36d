//! 在线状态缓存键
//!
//! - `user:status:{id}`  哈希：status / session_token / last_updated
//! - `user:friends:{id}` 有序集合：好友 ID，按序号计分
//!
//! 状态写入走写穿（权威库与缓存都写）；读取缓存优先，
//! 未命中时回源并回填。

use std::sync::Arc;

use chrono::Utc;

use super::RedisManager;
use crate::error::Result;

/// 在线状态与好友列表的缓存封装
#[derive(Clone)]
pub struct PresenceCache {
    redis: Arc<RedisManager>,
}

impl PresenceCache {
    pub fn new(redis: Arc<RedisManager>) -> Self {
        Self { redis }
    }

    fn status_key(user_id: i32) -> String {
        format!("user:status:{}", user_id)
    }

    fn friends_key(user_id: i32) -> String {
        format!("user:friends:{}", user_id)
    }

    /// 写入用户状态哈希
    pub async fn write_status(&self, user_id: i32, status: &str, session_token: &str) -> Result<()> {
        let last_updated = Utc::now().timestamp_millis().to_string();
        self.redis
            .hset_multiple(
                &Self::status_key(user_id),
                &[
                    ("status", status),
                    ("session_token", session_token),
                    ("last_updated", last_updated.as_str()),
                ],
            )
            .await
    }

    /// 只刷新状态与时间字段，不动 session_token（用于读路径回填）
    pub async fn touch_status(&self, user_id: i32, status: &str) -> Result<()> {
        let last_updated = Utc::now().timestamp_millis().to_string();
        self.redis
            .hset_multiple(
                &Self::status_key(user_id),
                &[("status", status), ("last_updated", last_updated.as_str())],
            )
            .await
    }

    /// 读取用户状态，返回 (状态, last_updated 毫秒时间戳)
    pub async fn read_status(&self, user_id: i32) -> Result<Option<(String, i64)>> {
        let map = self.redis.hgetall(&Self::status_key(user_id)).await?;
        let Some(status) = map.get("status") else {
            return Ok(None);
        };
        let last_updated = map
            .get("last_updated")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or_default();
        Ok(Some((status.clone(), last_updated)))
    }

    /// 覆盖缓存的好友列表
    pub async fn cache_friends(&self, user_id: i32, friend_ids: &[i32]) -> Result<()> {
        let key = Self::friends_key(user_id);
        self.redis.del(&key).await?;
        for (ordinal, friend_id) in friend_ids.iter().enumerate() {
            self.redis
                .zadd(&key, &friend_id.to_string(), ordinal as f64)
                .await?;
        }
        Ok(())
    }

    /// 读取缓存的好友列表，键不存在时返回 None
    pub async fn cached_friends(&self, user_id: i32) -> Result<Option<Vec<i32>>> {
        let members = self.redis.zrange(&Self::friends_key(user_id), 0, -1).await?;
        if members.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            members
                .iter()
                .filter_map(|member| member.parse::<i32>().ok())
                .collect(),
        ))
    }

    /// 作废缓存的好友列表（关系变更后调用）
    pub async fn invalidate_friends(&self, user_id: i32) -> Result<()> {
        self.redis.del(&Self::friends_key(user_id)).await
    }
}
