//! 负载均衡模块
//!
//! 在命名服务（状态服务副本、数据库副本）之间做健康感知的实例选取，
//! 由状态客户端池和数据库驱动共享。

mod health;
mod registry;

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use tracing::{debug, info, warn};

pub use health::HealthChecker;
pub use registry::{ServiceRegistration, ServiceRegistry};

/// 服务实例
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub healthy: bool,
}

impl ServiceInstance {
    /// 实例的 `host:port` 形式地址
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 实例的 HTTP URI 形式地址（用于 tonic Endpoint）
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// 负载均衡算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceAlgorithm {
    /// 轮询（默认）
    #[default]
    RoundRobin,
    /// 加权轮询：按权重随机落点
    WeightedRoundRobin,
    /// 最小连接：当前实现为健康实例中均匀随机选取
    LeastConnections,
}

struct Inner {
    /// 服务名 → 实例列表
    instances: HashMap<String, Vec<ServiceInstance>>,
    /// 服务名 → 轮询游标
    cursors: HashMap<String, usize>,
}

/// 负载均衡器
///
/// 单把互斥锁同时覆盖实例表和游标表。
pub struct LoadBalancer {
    inner: Mutex<Inner>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                cursors: HashMap::new(),
            }),
        }
    }

    /// 注册服务实例，初始为健康
    pub fn register(&self, service_name: &str, host: &str, port: u16, weight: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .instances
            .entry(service_name.to_string())
            .or_default()
            .push(ServiceInstance {
                service_name: service_name.to_string(),
                host: host.to_string(),
                port,
                weight: weight.max(1),
                healthy: true,
            });
        inner.cursors.entry(service_name.to_string()).or_insert(0);
        info!(
            service = %service_name,
            host = %host,
            port = port,
            weight = weight,
            "Registered service instance"
        );
    }

    /// 注销服务实例
    pub fn deregister(&self, service_name: &str, host: &str, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.instances.get_mut(service_name) {
            let before = list.len();
            list.retain(|inst| !(inst.host == host && inst.port == port));
            if list.len() < before {
                info!(service = %service_name, host = %host, port = port, "Removed service instance");
            } else {
                warn!(
                    service = %service_name,
                    host = %host,
                    port = port,
                    "Attempted to remove non-existent service instance"
                );
            }
        }
    }

    /// 更新实例健康状态
    pub fn update_health(&self, service_name: &str, host: &str, port: u16, healthy: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(list) = inner.instances.get_mut(service_name) else {
            warn!(service = %service_name, "Service not found when updating health status");
            return;
        };
        match list
            .iter_mut()
            .find(|inst| inst.host == host && inst.port == port)
        {
            Some(inst) => {
                inst.healthy = healthy;
                info!(
                    service = %service_name,
                    host = %host,
                    port = port,
                    healthy = healthy,
                    "Updated instance health status"
                );
            }
            None => warn!(
                service = %service_name,
                host = %host,
                port = port,
                "Instance not found when updating health status"
            ),
        }
    }

    /// 按算法选取一个健康实例
    ///
    /// 服务不存在、实例为空或全部不健康时返回 None，
    /// 调用方必须将其作为服务不可用处理。
    pub fn pick(&self, service_name: &str, algorithm: BalanceAlgorithm) -> Option<ServiceInstance> {
        let mut inner = self.inner.lock().unwrap();
        let healthy: Vec<ServiceInstance> = inner
            .instances
            .get(service_name)?
            .iter()
            .filter(|inst| inst.healthy)
            .cloned()
            .collect();
        if healthy.is_empty() {
            warn!(service = %service_name, "No healthy instances available");
            return None;
        }

        let selected = match algorithm {
            BalanceAlgorithm::RoundRobin => {
                let cursor = inner.cursors.entry(service_name.to_string()).or_insert(0);
                *cursor = (*cursor + 1) % healthy.len();
                healthy[*cursor].clone()
            }
            BalanceAlgorithm::WeightedRoundRobin => {
                let total: u32 = healthy.iter().map(|inst| inst.weight).sum();
                let draw = rand::thread_rng().gen_range(1..=total);
                let mut cumulative = 0u32;
                let mut chosen = healthy[healthy.len() - 1].clone();
                for inst in &healthy {
                    cumulative += inst.weight;
                    if draw <= cumulative {
                        chosen = inst.clone();
                        break;
                    }
                }
                chosen
            }
            BalanceAlgorithm::LeastConnections => {
                // 无每实例连接计数可用，退化为均匀随机
                let idx = rand::thread_rng().gen_range(0..healthy.len());
                healthy[idx].clone()
            }
        };

        debug!(
            service = %service_name,
            host = %selected.host,
            port = selected.port,
            algorithm = ?algorithm,
            "Selected service instance"
        );
        Some(selected)
    }

    /// 返回某服务的全部实例（含不健康）
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let inner = self.inner.lock().unwrap();
        inner
            .instances
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer_with(instances: &[(&str, u16, u32, bool)]) -> LoadBalancer {
        let lb = LoadBalancer::new();
        for (host, port, weight, healthy) in instances {
            lb.register("svc", host, *port, *weight);
            if !healthy {
                lb.update_health("svc", host, *port, false);
            }
        }
        lb
    }

    #[test]
    fn pick_unknown_service_returns_none() {
        let lb = LoadBalancer::new();
        assert!(lb.pick("missing", BalanceAlgorithm::RoundRobin).is_none());
    }

    #[test]
    fn pick_all_unhealthy_returns_none() {
        let lb = balancer_with(&[("a", 1, 1, false), ("b", 2, 1, false)]);
        for algo in [
            BalanceAlgorithm::RoundRobin,
            BalanceAlgorithm::WeightedRoundRobin,
            BalanceAlgorithm::LeastConnections,
        ] {
            assert!(lb.pick("svc", algo).is_none());
        }
    }

    #[test]
    fn pick_only_returns_healthy_instances() {
        let lb = balancer_with(&[("a", 1, 1, true), ("b", 2, 1, false), ("c", 3, 1, true)]);
        for _ in 0..100 {
            let inst = lb.pick("svc", BalanceAlgorithm::RoundRobin).unwrap();
            assert_ne!(inst.host, "b");
        }
    }

    #[test]
    fn round_robin_cycles_through_healthy() {
        let lb = balancer_with(&[("a", 1, 1, true), ("b", 2, 1, true)]);
        let first = lb.pick("svc", BalanceAlgorithm::RoundRobin).unwrap();
        let second = lb.pick("svc", BalanceAlgorithm::RoundRobin).unwrap();
        assert_ne!(first.host, second.host);
    }

    #[test]
    fn failover_marks_instance_and_routes_to_remaining() {
        // 情景：A 被标记不健康后，后续选取全部落在 B
        let lb = balancer_with(&[("a", 1, 1, true), ("b", 2, 1, true)]);
        lb.update_health("svc", "a", 1, false);
        for _ in 0..100 {
            let inst = lb.pick("svc", BalanceAlgorithm::RoundRobin).unwrap();
            assert_eq!(inst.host, "b");
        }
    }

    #[test]
    fn weighted_draw_converges_to_weight_ratio() {
        let lb = balancer_with(&[("a", 1, 3, true), ("b", 2, 1, true)]);
        let mut hits_a = 0u32;
        let draws = 4000;
        for _ in 0..draws {
            if lb
                .pick("svc", BalanceAlgorithm::WeightedRoundRobin)
                .unwrap()
                .host
                == "a"
            {
                hits_a += 1;
            }
        }
        // 期望频率 3/4，给出宽裕的统计容差
        let ratio = f64::from(hits_a) / f64::from(draws);
        assert!((0.65..0.85).contains(&ratio), "ratio = {}", ratio);
    }

    #[test]
    fn deregister_removes_instance() {
        let lb = balancer_with(&[("a", 1, 1, true)]);
        lb.deregister("svc", "a", 1);
        assert!(lb.pick("svc", BalanceAlgorithm::RoundRobin).is_none());
        assert!(lb.instances("svc").is_empty());
    }
}
