//! HTTP 接入层
//!
//! 每个套接字一个 HTTP 会话：解析请求、分发端点、
//! 必要时升级为 WebSocket 会话。

pub mod form;
pub mod rate_limit;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::TcpStream;
use tracing::debug;

use crate::context::ServerContext;

/// 在一个已接受的套接字上运行 HTTP 会话
///
/// keep-alive 场景下同一连接可以处理多个请求；
/// 升级成功后连接的所有权移交给 WebSocket 会话。
pub async fn serve_connection(stream: TcpStream, remote: SocketAddr, ctx: Arc<ServerContext>) {
    let service = service_fn(move |req| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, std::convert::Infallible>(session::handle_request(req, remote, ctx).await)
        }
    });

    if let Err(err) = Http::new()
        .serve_connection(stream, service)
        .with_upgrades()
        .await
    {
        // 对端提前断开不是值得上报的错误
        debug!(remote = %remote, error = %err, "HTTP connection closed with error");
    }
}
