//! TCP 监听器
//!
//! 在配置地址上接受连接，每个套接字交给一个新的 HTTP 会话任务。
//! stop 幂等；挂起的 accept 被取消时不泄漏套接字，也不作为错误上报。

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gate_im_core::error::{GateError, Result};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::context::ServerContext;
use crate::http;

/// 监听器
pub struct Listener {
    ctx: Arc<ServerContext>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// 绑定地址并启动 accept 循环，返回实际绑定的地址
    ///
    /// bind 失败是致命错误，直接返回给调用方终止启动。
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut handle_guard = self.handle.lock().await;
        if handle_guard.is_some() {
            return Err(GateError::Transport("listener already started".to_string()));
        }

        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|err| GateError::Transport(format!("bind {}: {}", addr, err)))?;
        let bound = tcp
            .local_addr()
            .map_err(|err| GateError::Transport(err.to_string()))?;
        info!(addr = %bound, "Listener started");

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(tx);
        self.running.store(true, Ordering::SeqCst);

        let ctx = self.ctx.clone();
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    accepted = tcp.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                http::serve_connection(stream, remote, ctx).await;
                            });
                        }
                        Err(err) => {
                            // 瞬时 accept 错误只记录，循环继续
                            error!(error = %err, "Accept failed");
                        }
                    },
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Listener stopped");
        });
        *handle_guard = Some(handle);
        Ok(bound)
    }

    /// 停止接受连接，幂等
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
