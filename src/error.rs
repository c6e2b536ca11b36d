//! Gate IM 错误类型定义
//!
//! 所有错误在会话边界处被吸收：HTTP 请求返回 JSON 错误响应，
//! WebSocket 帧错误回显后继续，发送/接收错误触发会话清理。

use thiserror::Error;

/// Gate IM 统一错误类型
#[derive(Debug, Error)]
pub enum GateError {
    /// 传输层错误（读/写/accept）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 协议错误（非法升级、畸形 JSON、缺少必填字段）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 认证错误（凭据错误、令牌非法）
    #[error("Unauthorized: {0}")]
    Auth(String),

    /// 资源未找到（未知用户、未知端点）
    #[error("Not found: {0}")]
    NotFound(String),

    /// 资源冲突（用户名已存在、好友关系已存在）
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 触发限流
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    /// 后端不可用（无健康实例、RPC/DB 传输失败）
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// 操作超时
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Gate IM 结果类型
pub type Result<T> = std::result::Result<T, GateError>;

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Protocol(err.to_string())
    }
}

impl From<sqlx::Error> for GateError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => GateError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                GateError::Conflict(err.to_string())
            }
            sqlx::Error::PoolTimedOut => GateError::Timeout(err.to_string()),
            _ => GateError::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for GateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            GateError::Timeout(err.to_string())
        } else {
            GateError::BackendUnavailable(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for GateError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        GateError::Timeout(err.to_string())
    }
}

impl From<GateError> for tonic::Status {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Auth(_) => tonic::Status::unauthenticated(err.to_string()),
            GateError::NotFound(_) => tonic::Status::not_found(err.to_string()),
            GateError::Conflict(_) => tonic::Status::already_exists(err.to_string()),
            GateError::RateLimit(_) => tonic::Status::resource_exhausted(err.to_string()),
            GateError::Protocol(_) => tonic::Status::invalid_argument(err.to_string()),
            GateError::Timeout(_) => tonic::Status::deadline_exceeded(err.to_string()),
            GateError::Transport(_) | GateError::BackendUnavailable(_) => {
                tonic::Status::unavailable(err.to_string())
            }
            GateError::Other(e) => tonic::Status::internal(format!("Internal error: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlx_row_not_found_maps_to_not_found() {
        let err: GateError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, GateError::NotFound(_)));
    }

    #[test]
    fn auth_error_maps_to_unauthenticated_status() {
        let status: tonic::Status = GateError::Auth("bad token".to_string()).into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);
    }
}
