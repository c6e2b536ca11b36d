//! 状态客户端池
//!
//! 固定容量的存根栈。借出时池空则经负载均衡器选取健康实例新建；
//! 未初始化时退回默认地址构造临时存根。归还有上限，
//! 故障存根直接丢弃不回池。

use std::sync::{Arc, Mutex};

use gate_im_core::balancer::{BalanceAlgorithm, LoadBalancer};
use gate_im_core::config::StatusConfig;
use gate_im_core::error::Result;
use gate_im_core::service_names::STATUS;
use tracing::{debug, info};

use super::client::StatusClient;

struct PoolInner {
    clients: Vec<StatusClient>,
    initialized: bool,
}

/// 状态客户端池
pub struct StatusClientPool {
    balancer: Arc<LoadBalancer>,
    config: StatusConfig,
    inner: Mutex<PoolInner>,
}

impl StatusClientPool {
    pub fn new(balancer: Arc<LoadBalancer>, config: StatusConfig) -> Self {
        Self {
            balancer,
            config,
            inner: Mutex::new(PoolInner {
                clients: Vec::new(),
                initialized: false,
            }),
        }
    }

    /// 预建 pool_size 个存根，幂等
    pub fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.initialized {
            return Ok(());
        }
        for _ in 0..self.config.pool_size {
            inner.clients.push(self.build_client()?);
        }
        inner.initialized = true;
        info!(
            pool_size = self.config.pool_size,
            "Status client pool initialized"
        );
        Ok(())
    }

    /// 构造一个新存根：优先用负载均衡器选出的健康实例
    fn build_client(&self) -> Result<StatusClient> {
        match self.balancer.pick(STATUS, BalanceAlgorithm::RoundRobin) {
            Some(inst) => {
                let uri = inst.uri();
                StatusClient::connect_lazy(&uri, Some((inst.host, inst.port)))
            }
            None => StatusClient::connect_lazy(&self.config.default_addr, None),
        }
    }

    /// 借出一个存根
    ///
    /// 未初始化时返回默认地址上的临时存根；池空时新建。
    pub fn acquire(&self) -> Result<StatusClient> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.initialized {
                if let Some(client) = inner.clients.pop() {
                    return Ok(client);
                }
            } else {
                drop(inner);
                return StatusClient::connect_lazy(&self.config.default_addr, None);
            }
        }
        self.build_client()
    }

    /// 归还一个存根；故障存根丢弃，池满丢弃
    pub fn release(&self, client: StatusClient) {
        if client.is_faulted() {
            debug!("Discarding faulted status client");
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.initialized && inner.clients.len() < self.config.pool_size {
            inner.clients.push(client);
        }
    }

    /// 当前池中空闲存根数
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pool_size: usize) -> StatusClientPool {
        let balancer = Arc::new(LoadBalancer::new());
        balancer.register(STATUS, "127.0.0.1", 50051, 1);
        StatusClientPool::new(
            balancer,
            StatusConfig {
                pool_size,
                ..StatusConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn acquire_before_initialize_builds_ad_hoc_stub() {
        let pool = pool(2);
        assert!(pool.acquire().is_ok());
        assert_eq!(pool.available(), 0);
    }

    #[tokio::test]
    async fn acquire_release_cycles_through_pool() {
        let pool = pool(2);
        pool.initialize().unwrap();
        assert_eq!(pool.available(), 2);

        let client = pool.acquire().unwrap();
        assert_eq!(pool.available(), 1);
        pool.release(client);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn release_is_bounded_by_pool_size() {
        let pool = pool(1);
        pool.initialize().unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap(); // 池空，新建
        pool.release(a);
        pool.release(b); // 超出容量，丢弃
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn empty_pool_acquire_builds_from_balancer() {
        let pool = pool(1);
        pool.initialize().unwrap();
        let _a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(b.instance(), Some(("127.0.0.1".to_string(), 50051)));
    }
}
