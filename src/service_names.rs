//! 服务名定义模块
//!
//! 服务注册和发现必须使用此模块中定义的常量，注册时使用的
//! 服务名必须与选取时使用的服务名完全一致。

/// 状态/好友服务名
pub const STATUS: &str = "gate-status";

/// 数据库服务名（副本集在负载均衡器中以此名注册）
pub const DATABASE: &str = "postgres";

/// 获取服务名，支持环境变量覆盖
///
/// 覆盖格式：`{NAME}_SERVICE`，其中 NAME 为服务名大写、连字符转下划线。
/// 例如 `GATE_STATUS_SERVICE=gate-status-dev`。
pub fn get_service_name(name: &str) -> String {
    let env_var = format!("{}_SERVICE", name.to_uppercase().replace('-', "_"));
    std::env::var(env_var).unwrap_or_else(|_| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_constant_without_env_override() {
        assert_eq!(get_service_name(STATUS), "gate-status");
    }
}
