//! 连接注册表
//!
//! 进程级索引：用户 → {会话 → 会话信息} 与 会话 → 用户 的双向映射，
//! 两个方向都是常数时间查找。单把互斥锁覆盖全部公有方法。

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

/// 注册表中的会话信息
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub ip: IpAddr,
    pub last_activity: Instant,
}

struct Inner {
    /// 正向映射：用户 → (会话 ID → 会话信息)
    user_sessions: HashMap<i32, HashMap<String, SessionInfo>>,
    /// 反向映射：会话 ID → 用户
    session_user: HashMap<String, i32>,
}

/// 连接注册表
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                user_sessions: HashMap::new(),
                session_user: HashMap::new(),
            }),
        }
    }

    /// 登记一条 (用户, 会话, 来源地址)
    pub fn add(&self, user_id: i32, session_id: &str, ip: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.user_sessions.entry(user_id).or_default().insert(
            session_id.to_string(),
            SessionInfo {
                session_id: session_id.to_string(),
                ip,
                last_activity: Instant::now(),
            },
        );
        inner.session_user.insert(session_id.to_string(), user_id);
    }

    /// 移除一条 (用户, 会话)；用户的会话集合变空时整个键随之移除
    pub fn remove(&self, user_id: i32, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        Self::remove_locked(&mut inner, user_id, session_id);
    }

    fn remove_locked(inner: &mut Inner, user_id: i32, session_id: &str) {
        if let Some(sessions) = inner.user_sessions.get_mut(&user_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                inner.user_sessions.remove(&user_id);
            }
        }
        inner.session_user.remove(session_id);
    }

    pub fn online(&self, user_id: i32) -> bool {
        self.inner
            .lock()
            .unwrap()
            .user_sessions
            .contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<i32> {
        self.inner
            .lock()
            .unwrap()
            .user_sessions
            .keys()
            .copied()
            .collect()
    }

    pub fn session_count(&self, user_id: i32) -> usize {
        self.inner
            .lock()
            .unwrap()
            .user_sessions
            .get(&user_id)
            .map(|sessions| sessions.len())
            .unwrap_or(0)
    }

    /// 反向查找会话所属用户
    pub fn user_of(&self, session_id: &str) -> Option<i32> {
        self.inner
            .lock()
            .unwrap()
            .session_user
            .get(session_id)
            .copied()
    }

    /// 刷新会话活动时间
    pub fn touch(&self, user_id: i32, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(info) = inner
            .user_sessions
            .get_mut(&user_id)
            .and_then(|sessions| sessions.get_mut(session_id))
        {
            info.last_activity = Instant::now();
        }
    }

    /// 清扫过期会话（闲置超过 timeout），返回被移除的 (用户, 会话) 对
    pub fn sweep_expired(&self, timeout: Duration) -> Vec<(i32, String)> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let mut expired = Vec::new();
        for (user_id, sessions) in &inner.user_sessions {
            for (session_id, info) in sessions {
                if now.duration_since(info.last_activity) > timeout {
                    expired.push((*user_id, session_id.clone()));
                }
            }
        }
        for (user_id, session_id) in &expired {
            Self::remove_locked(&mut inner, *user_id, session_id);
            info!(user_id = user_id, session_id = %session_id, "Removed expired session");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[test]
    fn add_creates_both_directions() {
        let registry = ConnectionRegistry::new();
        registry.add(1, "s1", ip());
        assert!(registry.online(1));
        assert_eq!(registry.user_of("s1"), Some(1));
        assert_eq!(registry.session_count(1), 1);
    }

    #[test]
    fn remove_clears_both_directions() {
        let registry = ConnectionRegistry::new();
        registry.add(1, "s1", ip());
        registry.remove(1, "s1");
        assert!(!registry.online(1));
        assert_eq!(registry.user_of("s1"), None);
        assert!(registry.online_users().is_empty());
    }

    #[test]
    fn empty_user_entry_is_removed_promptly() {
        let registry = ConnectionRegistry::new();
        registry.add(1, "s1", ip());
        registry.add(1, "s2", ip());
        registry.remove(1, "s1");
        assert!(registry.online(1));
        registry.remove(1, "s2");
        assert!(!registry.online(1));
        assert_eq!(registry.session_count(1), 0);
    }

    #[test]
    fn sweep_removes_only_idle_sessions() {
        let registry = ConnectionRegistry::new();
        registry.add(1, "idle", ip());
        std::thread::sleep(Duration::from_millis(30));
        registry.add(2, "fresh", ip());

        let removed = registry.sweep_expired(Duration::from_millis(20));
        assert_eq!(removed, vec![(1, "idle".to_string())]);
        assert!(!registry.online(1));
        assert!(registry.online(2));
    }

    #[test]
    fn touch_defers_expiry() {
        let registry = ConnectionRegistry::new();
        registry.add(1, "s1", ip());
        std::thread::sleep(Duration::from_millis(30));
        registry.touch(1, "s1");
        let removed = registry.sweep_expired(Duration::from_millis(20));
        assert!(removed.is_empty());
    }
}
