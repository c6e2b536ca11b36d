//! 健康检查器
//!
//! 周期性对注册表中的每个实例做 TCP 连接探测，
//! 并把结果写回负载均衡器。

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::{LoadBalancer, ServiceRegistry};

/// 健康检查器
pub struct HealthChecker {
    balancer: Arc<LoadBalancer>,
    registry: Arc<ServiceRegistry>,
    probe_timeout: Duration,
    shutdown: std::sync::Mutex<Option<watch::Sender<bool>>>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        registry: Arc<ServiceRegistry>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            balancer,
            registry,
            probe_timeout,
            shutdown: std::sync::Mutex::new(None),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// 启动周期性健康检查，重复启动是无操作
    pub fn start(&self, interval: Duration) {
        let mut handle_guard = self.handle.lock().unwrap();
        if handle_guard.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let balancer = self.balancer.clone();
        let registry = self.registry.clone();
        let probe_timeout = self.probe_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for (service_name, registrations) in registry.all_registered() {
                            for reg in registrations {
                                let healthy =
                                    probe(&reg.host, reg.port, probe_timeout).await;
                                balancer.update_health(
                                    &service_name,
                                    &reg.host,
                                    reg.port,
                                    healthy,
                                );
                                if healthy {
                                    debug!(
                                        service = %service_name,
                                        host = %reg.host,
                                        port = reg.port,
                                        "Health check passed"
                                    );
                                } else {
                                    warn!(
                                        service = %service_name,
                                        host = %reg.host,
                                        port = reg.port,
                                        "Health check failed"
                                    );
                                }
                            }
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *handle_guard = Some(handle);
        info!(interval_secs = interval.as_secs(), "Started health checking");
    }

    /// 停止健康检查，幂等
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        info!("Stopped health checking");
    }
}

/// 单次探测：能在超时内建立 TCP 连接即视为健康
async fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_reports_listening_socket_healthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn probe_reports_closed_port_unhealthy() {
        // 绑定后立即释放，得到一个（大概率）无人监听的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe("127.0.0.1", port, Duration::from_secs(1)).await);
    }
}
