//! 状态服务存根
//!
//! 包装生成的 gRPC 客户端。信道为惰性连接，真正的拨号发生在
//! 首次调用时。观察到传输层错误的存根会打上故障标记，
//! 归还时由池丢弃。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gate_im_core::error::{GateError, Result};
use gate_proto::status::status_service_client::StatusServiceClient;
use gate_proto::status::{
    AddFriendRequest, FriendInfo, FriendStatus, GetFriendsListRequest, GetFriendsStatusRequest,
    GetUserStatusRequest, UserStatus, UserStatusRequest,
};
use tonic::transport::{Channel, Endpoint};
use tonic::Code;

/// 状态服务存根
#[derive(Debug, Clone)]
pub struct StatusClient {
    client: StatusServiceClient<Channel>,
    /// 所属实例 (host, port)；默认地址构造的临时存根为 None
    instance: Option<(String, u16)>,
    faulted: Arc<AtomicBool>,
}

impl StatusClient {
    /// 基于惰性信道构造存根，只有非法地址才会失败
    pub fn connect_lazy(uri: &str, instance: Option<(String, u16)>) -> Result<Self> {
        let endpoint = Endpoint::from_shared(uri.to_string()).map_err(|err| {
            GateError::BackendUnavailable(format!("invalid status endpoint {}: {}", uri, err))
        })?;
        let channel = endpoint.connect_lazy();
        Ok(Self {
            client: StatusServiceClient::new(channel),
            instance,
            faulted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn instance(&self) -> Option<(String, u16)> {
        self.instance.clone()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// 把 RPC 错误映射为本地错误；传输层故障顺带打标记
    fn map_rpc_error(&self, status: tonic::Status) -> GateError {
        match status.code() {
            Code::Unavailable | Code::Unknown => {
                self.faulted.store(true, Ordering::SeqCst);
                GateError::BackendUnavailable(status.message().to_string())
            }
            Code::DeadlineExceeded => {
                self.faulted.store(true, Ordering::SeqCst);
                GateError::Timeout(status.message().to_string())
            }
            _ => GateError::BackendUnavailable(status.message().to_string()),
        }
    }

    pub async fn update_user_status(
        &mut self,
        user_id: i32,
        status: UserStatus,
        session_token: &str,
    ) -> Result<(bool, String)> {
        let request = UserStatusRequest {
            user_id,
            status: status as i32,
            session_token: session_token.to_string(),
        };
        let response = self
            .client
            .update_user_status(request)
            .await
            .map_err(|status| self.map_rpc_error(status))?
            .into_inner();
        Ok((response.success, response.message))
    }

    pub async fn get_user_status(&mut self, user_id: i32) -> Result<(bool, UserStatus, i64, String)> {
        let response = self
            .client
            .get_user_status(GetUserStatusRequest { user_id })
            .await
            .map_err(|status| self.map_rpc_error(status))?
            .into_inner();
        let status = UserStatus::try_from(response.status).unwrap_or(UserStatus::Offline);
        Ok((
            response.success,
            status,
            response.last_seen,
            response.message,
        ))
    }

    pub async fn get_friends_status(
        &mut self,
        user_id: i32,
    ) -> Result<(bool, Vec<FriendStatus>, String)> {
        let response = self
            .client
            .get_friends_status(GetFriendsStatusRequest { user_id })
            .await
            .map_err(|status| self.map_rpc_error(status))?
            .into_inner();
        Ok((response.success, response.friends, response.message))
    }

    pub async fn add_friend(&mut self, user_id: i32, friend_id: i32) -> Result<(bool, String)> {
        let response = self
            .client
            .add_friend(AddFriendRequest { user_id, friend_id })
            .await
            .map_err(|status| self.map_rpc_error(status))?
            .into_inner();
        Ok((response.success, response.message))
    }

    pub async fn get_friends_list(
        &mut self,
        user_id: i32,
    ) -> Result<(bool, Vec<FriendInfo>, String)> {
        let response = self
            .client
            .get_friends_list(GetFriendsListRequest { user_id })
            .await
            .map_err(|status| self.map_rpc_error(status))?
            .into_inner();
        Ok((response.success, response.friends, response.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lazy_construction_rejects_invalid_uri() {
        assert!(StatusClient::connect_lazy("not a uri", None).is_err());
        assert!(StatusClient::connect_lazy("http://127.0.0.1:50051", None).is_ok());
    }

    #[tokio::test]
    async fn transport_failure_marks_stub_faulted() {
        // 端口绑定后立即释放，调用必然遇到连接拒绝
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut stub = StatusClient::connect_lazy(
            &format!("http://127.0.0.1:{}", port),
            Some(("127.0.0.1".to_string(), port)),
        )
        .unwrap();
        assert!(!stub.is_faulted());
        let result = stub.update_user_status(1, UserStatus::Online, "token_1_2_3").await;
        assert!(result.is_err());
        assert!(stub.is_faulted());
    }
}
