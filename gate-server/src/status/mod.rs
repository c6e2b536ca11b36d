//! 状态服务客户端层
//!
//! 到状态/好友 RPC 服务的存根与固定容量的存根池。

pub mod client;
pub mod pool;

pub use client::StatusClient;
pub use pool::StatusClientPool;
