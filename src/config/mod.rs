//! 配置加载模块
//!
//! 从 TOML 文件加载应用配置，未提供的字段使用默认值。
//! 配置文件路径可通过 `GATE_CONFIG` 环境变量覆盖。

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub status: StatusConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub health_check: HealthCheckConfig,
}

/// 监听地址配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

impl LoggingConfig {
    /// 组装过滤指令
    ///
    /// 显式覆盖（install 时读取 `RUST_LOG`）整体生效；
    /// 否则采用配置级别，并压低底层依赖库的噪音。
    fn directives(&self, overrides: Option<&str>) -> String {
        match overrides {
            Some(spec) if !spec.trim().is_empty() => spec.to_string(),
            _ => format!("{},hyper=warn,sqlx=warn,tonic=warn", self.level),
        }
    }

    /// 安装全局日志订阅器
    ///
    /// 进程内重复安装（典型场景是测试）不是错误，保留先安装的订阅器。
    pub fn install(&self) {
        let overrides = env::var("RUST_LOG").ok();
        let filter = EnvFilter::new(self.directives(overrides.as_deref()));
        let subscriber = fmt()
            .with_env_filter(filter)
            .with_target(self.with_target)
            .with_thread_ids(self.with_thread_ids)
            .with_file(self.with_file)
            .with_line_number(self.with_line_number)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::debug!("global tracing subscriber already installed");
        }
    }
}

/// 服务实例端点（数据库副本、状态服务副本）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            weight: 1,
        }
    }
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub connect_timeout_secs: u64,
    pub replicas: Vec<EndpointConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            user: "im_user".to_string(),
            password: "password".to_string(),
            dbname: "im_database".to_string(),
            connect_timeout_secs: 10,
            replicas: vec![EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: 5432,
                weight: 1,
            }],
        }
    }
}

/// Redis 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            pool_size: 10,
        }
    }
}

/// 状态服务客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub pool_size: usize,
    pub default_addr: String,
    pub replicas: Vec<EndpointConfig>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            default_addr: "http://127.0.0.1:50051".to_string(),
            replicas: vec![EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: 50051,
                weight: 1,
            }],
        }
    }
}

/// 会话生命周期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 过期会话清扫间隔（秒）
    pub sweep_interval_secs: u64,
    /// 会话闲置超时（秒），超过后被清扫
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 60,
            idle_timeout_secs: 300,
        }
    }
}

/// 限流配置：每来源固定窗口计数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

/// 健康检查配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

/// 加载应用配置
///
/// 优先级：`GATE_CONFIG` 环境变量指定的路径 > 传入路径 > 默认路径。
/// 文件不存在时返回默认配置，解析失败时返回错误。
pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    let path = env::var("GATE_CONFIG")
        .unwrap_or_else(|_| path.unwrap_or(DEFAULT_CONFIG_PATH).to_string());

    if !Path::new(&path).exists() {
        return Ok(AppConfig::default());
    }

    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("invalid config format: {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_stable() {
        let config = AppConfig::default();
        assert_eq!(config.session.heartbeat_interval_secs, 30);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.database.connect_timeout_secs, 10);
    }

    #[test]
    fn logging_directives_prefer_explicit_override() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.directives(Some("trace")), "trace");
        // 空白覆盖视同未设置
        assert_eq!(
            logging.directives(Some("  ")),
            "info,hyper=warn,sqlx=warn,tonic=warn"
        );
        let custom = LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        assert!(custom.directives(None).starts_with("debug,"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.redis.pool_size, 10);
    }
}
