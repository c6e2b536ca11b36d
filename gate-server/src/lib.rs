//! Gate IM 网关库
//!
//! 监听器、HTTP 接入层、WebSocket 长连接层与状态服务客户端。
//! 二进制入口见 `src/main.rs`。

pub mod context;
pub mod http;
pub mod listener;
pub mod status;
pub mod ws;
