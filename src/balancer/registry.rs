//! 服务注册表
//!
//! 记录注册信息并同步写入负载均衡器，供健康检查器遍历。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::LoadBalancer;

/// 一条服务注册记录
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// 服务注册表
pub struct ServiceRegistry {
    balancer: Arc<LoadBalancer>,
    registered: Mutex<HashMap<String, Vec<ServiceRegistration>>>,
}

impl ServiceRegistry {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self {
            balancer,
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// 注册服务实例，同时加入负载均衡器
    pub fn register_service(&self, service_name: &str, host: &str, port: u16, weight: u32) {
        let mut registered = self.registered.lock().unwrap();
        registered
            .entry(service_name.to_string())
            .or_default()
            .push(ServiceRegistration {
                service_name: service_name.to_string(),
                host: host.to_string(),
                port,
                weight,
            });
        self.balancer.register(service_name, host, port, weight);
        info!(service = %service_name, host = %host, port = port, "Registered service");
    }

    /// 注销服务实例，同时从负载均衡器移除
    pub fn unregister_service(&self, service_name: &str, host: &str, port: u16) {
        let mut registered = self.registered.lock().unwrap();
        if let Some(list) = registered.get_mut(service_name) {
            list.retain(|reg| !(reg.host == host && reg.port == port));
        }
        self.balancer.deregister(service_name, host, port);
        info!(service = %service_name, host = %host, port = port, "Unregistered service");
    }

    /// 返回全部注册记录的快照
    pub fn all_registered(&self) -> HashMap<String, Vec<ServiceRegistration>> {
        self.registered.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalanceAlgorithm;

    #[test]
    fn register_mirrors_into_balancer() {
        let balancer = Arc::new(LoadBalancer::new());
        let registry = ServiceRegistry::new(balancer.clone());
        registry.register_service("svc", "127.0.0.1", 9000, 1);

        assert_eq!(registry.all_registered()["svc"].len(), 1);
        assert!(balancer.pick("svc", BalanceAlgorithm::RoundRobin).is_some());

        registry.unregister_service("svc", "127.0.0.1", 9000);
        assert!(balancer.pick("svc", BalanceAlgorithm::RoundRobin).is_none());
    }
}
