//! 网关端到端行为测试
//!
//! 不依赖外部数据库与缓存：覆盖路由与健康检查、升级鉴权、
//! 限流、WebSocket 帧往返、重连竞争与心跳超时清理。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gate_im_core::auth::generate_token;
use gate_im_core::balancer::LoadBalancer;
use gate_im_core::config::AppConfig;
use gate_im_core::db::DatabaseManager;
use gate_server::context::ServerContext;
use gate_server::http::rate_limit::RateLimiter;
use gate_server::listener::Listener;
use gate_server::status::StatusClientPool;
use gate_server::ws::{ConnectionRegistry, WebSocketManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn test_context(heartbeat_secs: u64, rate_limit_max: u32) -> Arc<ServerContext> {
    let mut config = AppConfig::default();
    config.session.heartbeat_interval_secs = heartbeat_secs;
    config.rate_limit.max_requests = rate_limit_max;
    // 数据库副本指向无人监听的端口，惰性连接按需失败
    config.database.replicas[0].port = 1;

    let balancer = Arc::new(LoadBalancer::new());
    let db = Arc::new(DatabaseManager::new(balancer.clone(), config.database.clone()));
    let status_pool = Arc::new(StatusClientPool::new(
        balancer.clone(),
        config.status.clone(),
    ));
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_requests,
        Duration::from_secs(config.rate_limit.window_secs),
    ));
    Arc::new(ServerContext {
        balancer,
        db,
        status_pool,
        connections: Arc::new(ConnectionRegistry::new()),
        sessions: Arc::new(WebSocketManager::new()),
        rate_limiter,
        config,
    })
}

async fn start_gateway(ctx: Arc<ServerContext>) -> (Listener, SocketAddr) {
    let listener = Listener::new(ctx);
    let addr = listener
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    (listener, addr)
}

async fn http_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

fn get(path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: gate\r\nConnection: close\r\n\r\n",
        path
    )
}

async fn connect_ws(
    addr: SocketAddr,
    token: &str,
) -> WebSocketStream<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, response) =
        tokio_tungstenite::client_async(format!("ws://{}/?token={}", addr, token), stream)
            .await
            .unwrap();
    assert_eq!(response.status(), 101);
    ws
}

/// 读帧直到出现期望的 `type`，其余帧（如服务端心跳）跳过
async fn next_json(ws: &mut WebSocketStream<TcpStream>, expected: &str) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == expected {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("websocket ended unexpectedly: {:?}", other),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn index_health_and_unknown_routes() {
    let ctx = test_context(30, 1000);
    let (listener, addr) = start_gateway(ctx).await;
    assert!(listener.running());

    let response = http_request(addr, &get("/")).await;
    assert!(response.contains("200 OK"));
    assert!(response.contains("server: GateServer") || response.contains("Server: GateServer"));
    assert!(response.contains(env!("CARGO_PKG_VERSION")));

    let response = http_request(addr, &get("/health")).await;
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"database_connected\":false"));
    assert!(response.contains("\"online_users\":0"));

    let response = http_request(addr, &get("/missing")).await;
    assert!(response.contains("404"));

    listener.stop().await;
    assert!(!listener.running());
    // stop 幂等
    listener.stop().await;
}

#[tokio::test]
async fn upgrade_with_invalid_token_is_rejected() {
    let ctx = test_context(30, 1000);
    let (_listener, addr) = start_gateway(ctx.clone()).await;

    let request = "GET /?token=garbage HTTP/1.1\r\n\
                   Host: gate\r\n\
                   Upgrade: websocket\r\n\
                   Connection: Upgrade, close\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    let response = http_request(addr, request).await;
    assert!(response.contains("401"));
    assert!(response.contains("Unauthorized: Invalid token"));

    // 未建立任何注册表条目
    assert!(ctx.connections.online_users().is_empty());
    assert_eq!(ctx.sessions.count(), 0);
}

#[tokio::test]
async fn rate_limit_rejects_requests_beyond_window_quota() {
    let ctx = test_context(30, 10);
    let (_listener, addr) = start_gateway(ctx).await;

    for _ in 0..10 {
        let response = http_request(addr, &get("/health")).await;
        assert!(response.contains("200 OK"));
    }
    let response = http_request(addr, &get("/health")).await;
    assert!(response.contains("429"));
    assert!(response.contains("Too many requests"));
}

#[tokio::test]
async fn websocket_session_registers_and_answers_frames() {
    let ctx = test_context(30, 1000);
    let (_listener, addr) = start_gateway(ctx.clone()).await;

    let token = generate_token(7);
    let mut ws = connect_ws(addr, &token).await;

    {
        let ctx = ctx.clone();
        wait_until(move || ctx.connections.online(7)).await;
    }
    assert!(ctx.sessions.get(7).is_some());
    assert_eq!(ctx.connections.session_count(7), 1);

    ws.send(Message::Text(r#"{"type":"login"}"#.to_string()))
        .await
        .unwrap();
    let value = next_json(&mut ws, "login_response").await;
    assert_eq!(value["success"], true);
    assert_eq!(value["userId"], "7");

    ws.send(Message::Text(r#"{"type":"heartbeat"}"#.to_string()))
        .await
        .unwrap();
    let value = next_json(&mut ws, "heartbeat_response").await;
    assert!(value["timestamp"].as_i64().unwrap() > 0);

    ws.send(Message::Text("not json at all".to_string()))
        .await
        .unwrap();
    let value = next_json(&mut ws, "message").await;
    assert_eq!(value["from"], "server");
    assert_eq!(value["content"], "Echo: not json at all");

    // 缺少必填字段的帧按协议错误回显，会话不受影响
    ws.send(Message::Text(r#"{"type":"text_message"}"#.to_string()))
        .await
        .unwrap();
    let value = next_json(&mut ws, "message").await;
    assert_eq!(value["content"], r#"Echo: {"type":"text_message"}"#);

    ws.close(None).await.unwrap();
    {
        let ctx = ctx.clone();
        wait_until(move || !ctx.connections.online(7) && ctx.sessions.get(7).is_none()).await;
    }
}

#[tokio::test]
async fn old_session_teardown_does_not_evict_reconnection() {
    let ctx = test_context(30, 1000);
    let (_listener, addr) = start_gateway(ctx.clone()).await;

    let token = generate_token(5);
    let mut first = connect_ws(addr, &token).await;
    {
        let ctx = ctx.clone();
        wait_until(move || ctx.connections.session_count(5) == 1).await;
    }

    let _second = connect_ws(addr, &token).await;
    {
        let ctx = ctx.clone();
        wait_until(move || ctx.connections.session_count(5) == 2).await;
    }
    let current = ctx.sessions.get(5).unwrap().session_id().to_string();

    // 旧会话关闭后，管理器仍指向重连的新会话
    first.close(None).await.unwrap();
    {
        let ctx = ctx.clone();
        wait_until(move || ctx.connections.session_count(5) == 1).await;
    }
    assert_eq!(ctx.sessions.get(5).unwrap().session_id(), current);
}

#[tokio::test]
async fn idle_session_is_torn_down_on_heartbeat_timeout() {
    // 心跳周期压缩到 1 秒，3 个周期无入站即判死
    let ctx = test_context(1, 1000);
    let (_listener, addr) = start_gateway(ctx.clone()).await;

    let token = generate_token(9);
    let mut ws = connect_ws(addr, &token).await;
    {
        let ctx = ctx.clone();
        wait_until(move || ctx.connections.online(9)).await;
    }

    let mut saw_server_heartbeat = false;
    let close_frame = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "heartbeat" {
                        saw_server_heartbeat = true;
                    }
                }
                Some(Ok(Message::Close(frame))) => break frame,
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break None,
            }
        }
    })
    .await
    .expect("session was not closed in time");

    assert!(saw_server_heartbeat, "expected server heartbeats before timeout");
    if let Some(frame) = close_frame {
        assert_eq!(frame.reason, "heartbeat_timeout");
    }

    {
        let ctx = ctx.clone();
        wait_until(move || !ctx.connections.online(9) && ctx.sessions.get(9).is_none()).await;
    }
}
