//! HTTP 请求分发
//!
//! 端点：`GET /`、`GET /health`、`POST /login`、`POST /register`，
//! 以及携带令牌的 WebSocket 升级。所有解析/数据库错误就地转为
//! JSON 响应，绝不越过会话边界向外传播。

use std::net::SocketAddr;
use std::sync::Arc;

use gate_im_core::auth::{generate_token, sha256_hex, verify_token};
use gate_im_core::error::GateError;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::form;
use crate::context::ServerContext;
use crate::ws;

#[derive(Debug, Deserialize)]
struct LoginPayload {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    username: String,
    password: String,
    #[serde(default)]
    email: String,
}

/// 处理一个 HTTP 请求，返回响应或移交升级
pub async fn handle_request(
    mut req: Request<Body>,
    remote: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Response<Body> {
    if !ctx.rate_limiter.allow(remote.ip()) {
        debug!(remote = %remote, "Rate limit exceeded");
        return json_response(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "Too many requests"}).to_string(),
        );
    }

    if hyper_tungstenite::is_upgrade_request(&req) {
        return handle_upgrade(&mut req, remote, ctx);
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => handle_index(),
        (&Method::GET, "/health") => handle_health(ctx).await,
        (&Method::POST, "/login") => handle_login(req, ctx).await,
        (&Method::POST, "/register") => handle_register(req, ctx).await,
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({"error": "Not found"}).to_string(),
        ),
    }
}

/// WebSocket 升级：结构化校验令牌，成功后把连接交给 WebSocket 会话
fn handle_upgrade(
    req: &mut Request<Body>,
    remote: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Response<Body> {
    let token = extract_token(req);
    let user_id = match token.as_deref().and_then(verify_token) {
        Some(user_id) => user_id,
        None => {
            warn!(remote = %remote, "WebSocket upgrade rejected: missing or invalid token");
            return json_response(
                StatusCode::UNAUTHORIZED,
                "{\"error\":\"Unauthorized: Invalid token\"}".to_string(),
            );
        }
    };
    let token = token.unwrap_or_default();

    match hyper_tungstenite::upgrade(req, None) {
        Ok((mut response, websocket)) => {
            info!(user_id = user_id, remote = %remote, "WebSocket upgrade accepted");
            tokio::spawn(ws::session::run(websocket, user_id, token, remote, ctx));
            response
                .headers_mut()
                .insert(header::SERVER, header::HeaderValue::from_static("GateServer"));
            response
        }
        Err(err) => {
            warn!(remote = %remote, error = %err, "WebSocket upgrade failed");
            json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "Invalid WebSocket upgrade request"}).to_string(),
            )
        }
    }
}

fn handle_index() -> Response<Body> {
    json_response(
        StatusCode::OK,
        json!({
            "message": "GateServer is running",
            "version": env!("CARGO_PKG_VERSION"),
        })
        .to_string(),
    )
}

async fn handle_health(ctx: Arc<ServerContext>) -> Response<Body> {
    let database_connected = ctx.db.is_connected().await;
    let online_users = ctx.connections.online_users().len();
    json_response(
        StatusCode::OK,
        json!({
            "status": "ok",
            "database_connected": database_connected,
            "online_users": online_users,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        })
        .to_string(),
    )
}

async fn handle_login(req: Request<Body>, ctx: Arc<ServerContext>) -> Response<Body> {
    let payload: LoginPayload = match read_payload(req).await {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "Malformed login request");
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"type": "login_failed", "message": "Username and password are required"})
                    .to_string(),
            );
        }
    };

    match ctx.db.get_user_by_username(&payload.username).await {
        Ok(Some((user_id, stored_hash))) if sha256_hex(&payload.password) == stored_hash => {
            let token = generate_token(user_id);
            info!(user_id = user_id, username = %payload.username, "Login succeeded");
            json_response(
                StatusCode::OK,
                json!({
                    "type": "login_success",
                    "token": token,
                    "userId": user_id.to_string(),
                })
                .to_string(),
            )
        }
        Ok(_) => {
            info!(username = %payload.username, "Login failed: invalid credentials");
            json_response(
                StatusCode::UNAUTHORIZED,
                json!({"type": "login_failed", "message": "Invalid username or password"})
                    .to_string(),
            )
        }
        Err(err) => {
            warn!(error = %err, "Login failed: database error");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"type": "login_failed", "message": "Database unavailable"}).to_string(),
            )
        }
    }
}

async fn handle_register(req: Request<Body>, ctx: Arc<ServerContext>) -> Response<Body> {
    let payload: RegisterPayload = match read_payload(req).await {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "Malformed register request");
            return register_failed(
                StatusCode::BAD_REQUEST,
                "Username and password are required",
            );
        }
    };
    if payload.username.is_empty() || payload.password.is_empty() {
        return register_failed(
            StatusCode::BAD_REQUEST,
            "Username and password are required",
        );
    }

    match ctx
        .db
        .create_user(&payload.username, &payload.password, &payload.email)
        .await
    {
        Ok(user_id) => {
            info!(user_id = user_id, username = %payload.username, "User registered");
            json_response(
                StatusCode::OK,
                json!({
                    "type": "register_success",
                    "message": "User registered successfully",
                    "userId": user_id.to_string(),
                })
                .to_string(),
            )
        }
        Err(GateError::Conflict(_)) => {
            register_failed(StatusCode::CONFLICT, "Username already exists")
        }
        Err(err) => {
            warn!(error = %err, "Register failed: database error");
            register_failed(StatusCode::INTERNAL_SERVER_ERROR, "Failed to register user")
        }
    }
}

fn register_failed(status: StatusCode, message: &str) -> Response<Body> {
    json_response(
        status,
        json!({"type": "register_failed", "message": message}).to_string(),
    )
}

/// 读取请求体并按内容类型解析（JSON 或表单）
async fn read_payload<T: serde::de::DeserializeOwned>(
    req: Request<Body>,
) -> Result<T, GateError> {
    let is_json = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/json"))
        .unwrap_or(false);

    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|err| GateError::Protocol(err.to_string()))?;

    if is_json {
        Ok(serde_json::from_slice(&bytes)?)
    } else {
        let body = String::from_utf8_lossy(&bytes);
        let params = form::parse(&body);
        // 经由 JSON 值复用同一套反序列化与必填字段校验
        Ok(serde_json::from_value(serde_json::to_value(params)?)?)
    }
}

/// 从 URL 参数、Authorization 头或 Token 头提取令牌
fn extract_token<B>(req: &Request<B>) -> Option<String> {
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(form::percent_decode(value));
                }
            }
        }
    }
    if let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    req.headers()
        .get("token")
        .and_then(|value| value.to_str().ok())
        .map(|token| token.to_string())
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::SERVER, "GateServer")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn token_from_query_parameter() {
        let req = request("/?token=token_1_2_3", &[]);
        assert_eq!(extract_token(&req).as_deref(), Some("token_1_2_3"));
    }

    #[test]
    fn token_from_bearer_header() {
        let req = request("/", &[("authorization", "Bearer token_9_8_7")]);
        assert_eq!(extract_token(&req).as_deref(), Some("token_9_8_7"));
    }

    #[test]
    fn token_from_token_header() {
        let req = request("/", &[("token", "token_5_6_7")]);
        assert_eq!(extract_token(&req).as_deref(), Some("token_5_6_7"));
    }

    #[test]
    fn missing_token_yields_none() {
        let req = request("/?other=1", &[]);
        assert_eq!(extract_token(&req), None);
    }

    #[tokio::test]
    async fn form_payload_parses_into_struct() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("username=alice&password=secret"))
            .unwrap();
        let payload: LoginPayload = read_payload(req).await.unwrap();
        assert_eq!(payload.username, "alice");
        assert_eq!(payload.password, "secret");
    }

    #[tokio::test]
    async fn json_payload_parses_into_struct() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"username":"bob","password":"pw","email":"b@x"}"#,
            ))
            .unwrap();
        let payload: RegisterPayload = read_payload(req).await.unwrap();
        assert_eq!(payload.email, "b@x");
    }

    #[tokio::test]
    async fn missing_form_fields_fail_payload_parse() {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .body(Body::from("username=alice"))
            .unwrap();
        assert!(read_payload::<LoginPayload>(req).await.is_err());
    }
}
