//! 状态服务实现
//!
//! 权威数据在数据库；状态更新写穿缓存，读取缓存优先、
//! 未命中回源并回填。缓存故障一律降级为直接读库，只记日志。

use std::sync::Arc;

use gate_im_core::auth::verify_token;
use gate_im_core::cache::PresenceCache;
use gate_im_core::db::DatabaseManager;
use gate_im_core::error::Result;
use gate_proto::status::status_service_server::StatusService;
use gate_proto::status::{
    AddFriendRequest, AddFriendResponse, FriendInfo, FriendStatus, GetFriendsListRequest,
    GetFriendsListResponse, GetFriendsStatusRequest, GetFriendsStatusResponse,
    GetUserStatusRequest, GetUserStatusResponse, UserStatus, UserStatusRequest,
    UserStatusResponse,
};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// 状态服务
pub struct StatusServiceImpl {
    db: Arc<DatabaseManager>,
    cache: PresenceCache,
}

impl StatusServiceImpl {
    pub fn new(db: Arc<DatabaseManager>, cache: PresenceCache) -> Self {
        Self { db, cache }
    }

    /// 校验会话令牌：结构合法且其中的用户 ID 与请求一致
    fn validate_session_token(user_id: i32, token: &str) -> bool {
        verify_token(token) == Some(user_id)
    }

    /// 读取用户状态，缓存优先；未命中回源数据库并回填
    async fn load_status(&self, user_id: i32) -> Result<Option<(UserStatus, i64)>> {
        match self.cache.read_status(user_id).await {
            Ok(Some((status_str, last_updated))) => {
                if let Some(status) = UserStatus::from_str_name(&status_str) {
                    debug!(user_id = user_id, "Status cache hit");
                    return Ok(Some((status, last_updated)));
                }
            }
            Ok(None) => {}
            Err(err) => warn!(user_id = user_id, error = %err, "Status cache read failed"),
        }

        let Some((status_str, last_seen)) = self.db.get_user_status(user_id).await? else {
            return Ok(None);
        };
        let status = UserStatus::from_str_name(&status_str).unwrap_or(UserStatus::Offline);

        // 回填缓存，尽力而为
        if let Err(err) = self.cache.touch_status(user_id, status.as_str_name()).await {
            warn!(user_id = user_id, error = %err, "Status cache backfill failed");
        }
        Ok(Some((status, last_seen.timestamp_millis())))
    }

    /// 读取好友 ID 列表，缓存优先；未命中回源并回填
    async fn load_friend_ids(&self, user_id: i32) -> Result<Vec<i32>> {
        match self.cache.cached_friends(user_id).await {
            Ok(Some(ids)) => {
                debug!(user_id = user_id, "Friends cache hit");
                return Ok(ids);
            }
            Ok(None) => {}
            Err(err) => warn!(user_id = user_id, error = %err, "Friends cache read failed"),
        }

        let friends = self.db.friends_of(user_id).await?;
        let ids: Vec<i32> = friends.iter().map(|(id, _)| *id).collect();
        if let Err(err) = self.cache.cache_friends(user_id, &ids).await {
            warn!(user_id = user_id, error = %err, "Friends cache backfill failed");
        }
        Ok(ids)
    }
}

#[tonic::async_trait]
impl StatusService for StatusServiceImpl {
    async fn update_user_status(
        &self,
        request: Request<UserStatusRequest>,
    ) -> std::result::Result<Response<UserStatusResponse>, Status> {
        let request = request.into_inner();
        if !Self::validate_session_token(request.user_id, &request.session_token) {
            return Ok(Response::new(UserStatusResponse {
                success: false,
                message: "Invalid session token".to_string(),
            }));
        }

        let status = UserStatus::try_from(request.status).unwrap_or(UserStatus::Offline);
        match self
            .db
            .update_user_status(request.user_id, status.as_str_name(), &request.session_token)
            .await
        {
            Ok(()) => {
                // 写穿缓存；缓存失败不影响结果
                if let Err(err) = self
                    .cache
                    .write_status(request.user_id, status.as_str_name(), &request.session_token)
                    .await
                {
                    warn!(user_id = request.user_id, error = %err, "Status cache write failed");
                }
                info!(
                    user_id = request.user_id,
                    status = status.as_str_name(),
                    "User status updated"
                );
                Ok(Response::new(UserStatusResponse {
                    success: true,
                    message: "User status updated successfully".to_string(),
                }))
            }
            Err(err) => {
                warn!(user_id = request.user_id, error = %err, "Status update failed");
                Ok(Response::new(UserStatusResponse {
                    success: false,
                    message: "Failed to update user status in database".to_string(),
                }))
            }
        }
    }

    async fn get_user_status(
        &self,
        request: Request<GetUserStatusRequest>,
    ) -> std::result::Result<Response<GetUserStatusResponse>, Status> {
        let request = request.into_inner();
        match self.load_status(request.user_id).await {
            Ok(Some((status, last_seen))) => Ok(Response::new(GetUserStatusResponse {
                success: true,
                status: status as i32,
                last_seen,
                message: "User status retrieved successfully".to_string(),
            })),
            Ok(None) => Ok(Response::new(GetUserStatusResponse {
                success: false,
                status: UserStatus::Offline as i32,
                last_seen: 0,
                message: "User not found".to_string(),
            })),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_friends_status(
        &self,
        request: Request<GetFriendsStatusRequest>,
    ) -> std::result::Result<Response<GetFriendsStatusResponse>, Status> {
        let request = request.into_inner();
        let friend_ids = self
            .load_friend_ids(request.user_id)
            .await
            .map_err(Status::from)?;

        let mut friends = Vec::with_capacity(friend_ids.len());
        for friend_id in friend_ids {
            let username = self
                .db
                .get_username(friend_id)
                .await
                .map_err(Status::from)?
                .unwrap_or_else(|| format!("user_{}", friend_id));
            let (status, last_seen) = self
                .load_status(friend_id)
                .await
                .map_err(Status::from)?
                .unwrap_or((UserStatus::Offline, 0));
            friends.push(FriendStatus {
                user_id: friend_id,
                username,
                status: status as i32,
                last_seen,
            });
        }

        Ok(Response::new(GetFriendsStatusResponse {
            success: true,
            friends,
            message: "Friends status retrieved successfully".to_string(),
        }))
    }

    async fn add_friend(
        &self,
        request: Request<AddFriendRequest>,
    ) -> std::result::Result<Response<AddFriendResponse>, Status> {
        let request = request.into_inner();

        match self.db.friend_exists(request.user_id, request.friend_id).await {
            Ok(true) => {
                return Ok(Response::new(AddFriendResponse {
                    success: false,
                    message: "Friend relationship already exists".to_string(),
                }));
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "Friend existence check failed");
                return Ok(Response::new(AddFriendResponse {
                    success: false,
                    message: "Failed to add friend relationship to database".to_string(),
                }));
            }
        }

        match self.db.add_friend(request.user_id, request.friend_id).await {
            Ok(()) => {
                // 双向关系变更，作废两侧缓存
                for user_id in [request.user_id, request.friend_id] {
                    if let Err(err) = self.cache.invalidate_friends(user_id).await {
                        warn!(user_id = user_id, error = %err, "Friends cache invalidation failed");
                    }
                }
                info!(
                    user_id = request.user_id,
                    friend_id = request.friend_id,
                    "Friend added"
                );
                Ok(Response::new(AddFriendResponse {
                    success: true,
                    message: "Friend added successfully".to_string(),
                }))
            }
            Err(err) => {
                warn!(error = %err, "Friend insert failed");
                Ok(Response::new(AddFriendResponse {
                    success: false,
                    message: "Failed to add friend relationship to database".to_string(),
                }))
            }
        }
    }

    async fn get_friends_list(
        &self,
        request: Request<GetFriendsListRequest>,
    ) -> std::result::Result<Response<GetFriendsListResponse>, Status> {
        let request = request.into_inner();
        let friend_ids = self
            .load_friend_ids(request.user_id)
            .await
            .map_err(Status::from)?;

        let mut friends = Vec::with_capacity(friend_ids.len());
        for friend_id in friend_ids {
            let username = self
                .db
                .get_username(friend_id)
                .await
                .map_err(Status::from)?
                .unwrap_or_else(|| format!("user_{}", friend_id));
            friends.push(FriendInfo {
                user_id: friend_id,
                username,
            });
        }

        Ok(Response::new(GetFriendsListResponse {
            success: true,
            friends,
            message: "Friends list retrieved successfully".to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_im_core::auth::generate_token;

    #[test]
    fn session_token_must_match_user() {
        let token = generate_token(7);
        assert!(StatusServiceImpl::validate_session_token(7, &token));
        assert!(!StatusServiceImpl::validate_session_token(8, &token));
        assert!(!StatusServiceImpl::validate_session_token(7, "garbage"));
    }
}
