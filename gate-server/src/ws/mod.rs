//! WebSocket 长连接层
//!
//! 会话 actor、帧定义、连接注册表与会话管理器。

pub mod frame;
pub mod manager;
pub mod registry;
pub mod session;

pub use manager::{SessionHandle, WebSocketManager};
pub use registry::ConnectionRegistry;
