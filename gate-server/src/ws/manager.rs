//! WebSocket 管理器
//!
//! 用户 → 存活会话句柄的单映射，用于定向投递。
//! `put` 直接覆盖：用户重连时新句柄顶掉旧句柄；
//! 清理路径必须用 `remove_if` 比对会话 ID，防止旧会话的
//! 清理把刚建立的新连接一并逐出。

use std::collections::HashMap;
use std::sync::Mutex;

use hyper_tungstenite::tungstenite::Message;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::frame::ServerFrame;

/// 指向存活会话的句柄：会话 ID + 出站队列发送端
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    sender: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    pub fn new(session_id: String, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self { session_id, sender }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 把帧压入目标会话的出站队列，返回是否成功
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(text) => self.sender.send(Message::Text(text)).is_ok(),
            Err(err) => {
                warn!(error = %err, "Failed to serialize frame for delivery");
                false
            }
        }
    }
}

/// WebSocket 管理器
pub struct WebSocketManager {
    sessions: Mutex<HashMap<i32, SessionHandle>>,
}

impl Default for WebSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// 放入会话句柄，同用户的旧句柄被覆盖
    pub fn put(&self, user_id: i32, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(user_id, handle);
        info!(
            user_id = user_id,
            total = sessions.len(),
            "WebSocket session registered"
        );
    }

    pub fn get(&self, user_id: i32) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(&user_id).cloned()
    }

    pub fn remove(&self, user_id: i32) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.remove(&user_id);
        info!(
            user_id = user_id,
            total = sessions.len(),
            "WebSocket session removed"
        );
    }

    /// 比对删除：仅当存储的句柄仍属于给定会话时才移除
    ///
    /// 返回 false 表示句柄已被更新的连接替换，未做删除。
    pub fn remove_if(&self, user_id: i32, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get(&user_id) {
            Some(handle) if handle.session_id() == session_id => {
                sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn users(&self) -> Vec<i32> {
        self.sessions.lock().unwrap().keys().copied().collect()
    }

    /// 清空全部会话句柄；会话自身的清理由其驱动任务完成
    pub fn cleanup(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.clear();
        info!("WebSocket manager cleanup completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(session_id: &str) -> SessionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionHandle::new(session_id.to_string(), tx)
    }

    #[test]
    fn put_overwrites_prior_handle() {
        let manager = WebSocketManager::new();
        manager.put(1, handle("s1"));
        manager.put(1, handle("s2"));
        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get(1).unwrap().session_id(), "s2");
    }

    #[test]
    fn remove_if_only_evicts_matching_session() {
        // 重连竞争：旧会话的清理不得逐出新会话
        let manager = WebSocketManager::new();
        manager.put(1, handle("old"));
        manager.put(1, handle("new"));
        assert!(!manager.remove_if(1, "old"));
        assert_eq!(manager.get(1).unwrap().session_id(), "new");
        assert!(manager.remove_if(1, "new"));
        assert!(manager.get(1).is_none());
    }

    #[test]
    fn users_lists_registered_ids() {
        let manager = WebSocketManager::new();
        manager.put(1, handle("a"));
        manager.put(2, handle("b"));
        let mut users = manager.users();
        users.sort_unstable();
        assert_eq!(users, vec![1, 2]);
        manager.cleanup();
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn delivered_frames_arrive_in_enqueue_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new("s".to_string(), tx);
        for i in 0..10 {
            assert!(handle.send_frame(&ServerFrame::HeartbeatResponse { timestamp: i }));
        }
        for i in 0..10 {
            let Message::Text(text) = rx.try_recv().unwrap() else {
                panic!("expected text frame");
            };
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value["timestamp"], i);
        }
    }
}
