//! WebSocket 会话
//!
//! 每连接一个逻辑 actor，三个并发关注点协作交错：
//! 读循环、排空出站队列的写任务、心跳定时器。
//! 会话状态只在本任务内变更；出站队列经 mpsc 通道共享，
//! 写任务逐帧发送，任一时刻至多一个写在途，先入先出。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use gate_im_core::auth::mint_session_id;
use gate_im_core::error::GateError;
use gate_im_core::service_names::STATUS;
use gate_proto::status::UserStatus;
use hyper::upgrade::Upgraded;
use hyper_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use hyper_tungstenite::tungstenite::protocol::CloseFrame;
use hyper_tungstenite::tungstenite::Message;
use hyper_tungstenite::{HyperWebsocket, WebSocketStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frame::{ChatRecord, ClientFrame, FriendEntry, ServerFrame, UserSummary};
use super::manager::SessionHandle;
use crate::context::ServerContext;
use crate::status::StatusClient;

/// 连续错过多少个心跳周期判定会话死亡
const HEARTBEAT_MISSES: u32 = 3;

/// 历史查询默认与最大行数
const HISTORY_DEFAULT_LIMIT: u32 = 50;
const HISTORY_MAX_LIMIT: u32 = 200;

/// 会话终止原因，四条路径恰好触发其一
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    ReadError,
    WriteError,
    HeartbeatTimeout,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
        }
    }

    fn close_code(self) -> CloseCode {
        match self {
            CloseReason::HeartbeatTimeout => CloseCode::Policy,
            _ => CloseCode::Normal,
        }
    }
}

struct Session {
    session_id: String,
    user_id: i32,
    /// 升级时携带的登录令牌，作为状态服务的 session_token 透传
    token: String,
    ctx: Arc<ServerContext>,
    outbound: mpsc::UnboundedSender<Message>,
    stub: Option<StatusClient>,
    last_activity: Instant,
    torn_down: bool,
}

/// 驱动一个已升级的 WebSocket 连接直至关闭
pub async fn run(
    websocket: HyperWebsocket,
    user_id: i32,
    token: String,
    remote: SocketAddr,
    ctx: Arc<ServerContext>,
) {
    let ws = match websocket.await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(user_id = user_id, remote = %remote, error = %err, "WebSocket handshake failed");
            return;
        }
    };
    let (sink, stream) = ws.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session_id = mint_session_id();

    let mut writer = tokio::spawn(write_loop(sink, outbound_rx));

    // 从池中借出状态服务存根；拿不到也不阻止会话建立
    let stub = match ctx.status_pool.acquire() {
        Ok(stub) => Some(stub),
        Err(err) => {
            warn!(user_id = user_id, error = %err, "Failed to acquire status client");
            None
        }
    };

    ctx.connections.add(user_id, &session_id, remote.ip());
    ctx.sessions.put(
        user_id,
        SessionHandle::new(session_id.clone(), outbound_tx.clone()),
    );
    info!(
        user_id = user_id,
        session_id = %session_id,
        remote = %remote,
        "WebSocket session established"
    );

    let mut session = Session {
        session_id,
        user_id,
        token,
        ctx: ctx.clone(),
        outbound: outbound_tx,
        stub,
        last_activity: Instant::now(),
        torn_down: false,
    };
    session.publish_status(UserStatus::Online);

    let heartbeat_interval = Duration::from_secs(ctx.config.session.heartbeat_interval_secs);
    let dead_after = heartbeat_interval * HEARTBEAT_MISSES;
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    let mut stream = stream;
    let reason = loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    session.dispatch(&text).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    session.touch();
                    let _ = session.outbound.send(Message::Pong(payload));
                }
                Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(user_id = session.user_id, error = %err, "WebSocket read failed");
                    break CloseReason::ReadError;
                }
            },
            _ = heartbeat.tick() => {
                if session.last_activity.elapsed() >= dead_after {
                    break CloseReason::HeartbeatTimeout;
                }
                session.enqueue(&ServerFrame::Heartbeat { timestamp: now_millis() });
            }
            _ = &mut writer => break CloseReason::WriteError,
        }
    };

    session.teardown(reason).await;
    drop(session);
    // 等待写任务把队列尾部（含 Close 帧）排空后再放弃；
    // 写错误路径下任务已经结束，不能再轮询
    if reason != CloseReason::WriteError {
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut writer).await;
    }
    writer.abort();
}

/// 写循环：从队列逐帧取出并发送，保证 FIFO 且单写在途
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<Upgraded>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(err) = sink.send(message).await {
            debug!(error = %err, "WebSocket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Session {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.ctx.connections.touch(self.user_id, &self.session_id);
    }

    fn enqueue(&self, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(text) => {
                let _ = self.outbound.send(Message::Text(text));
            }
            Err(err) => warn!(error = %err, "Failed to serialize outbound frame"),
        }
    }

    fn echo(&self, raw: &str) {
        self.enqueue(&ServerFrame::echo(raw));
    }

    /// 入站帧分发；解析失败按协议错误回显后继续
    async fn dispatch(&mut self, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => self.handle_frame(frame, text).await,
            Err(err) => {
                debug!(user_id = self.user_id, error = %err, "Unparseable frame, echoing");
                self.echo(text);
            }
        }
    }

    async fn handle_frame(&mut self, frame: ClientFrame, raw: &str) {
        match frame {
            ClientFrame::Login => self.enqueue(&ServerFrame::LoginResponse {
                success: true,
                message: "login success".to_string(),
                user_id: self.user_id.to_string(),
            }),
            ClientFrame::Heartbeat => self.enqueue(&ServerFrame::HeartbeatResponse {
                timestamp: now_millis(),
            }),
            ClientFrame::TextMessage {
                content,
                receiver_id,
            } => self.handle_text_message(content, receiver_id, raw).await,
            ClientFrame::SearchUser { keyword } => self.handle_search_user(keyword, raw).await,
            ClientFrame::AddFriendRequest { friend_id } => {
                self.handle_add_friend(friend_id, raw).await
            }
            ClientFrame::GetFriendsList => self.handle_get_friends_list().await,
            ClientFrame::GetChatHistory { peer_id, limit } => {
                self.handle_get_chat_history(peer_id, limit, raw).await
            }
        }
    }

    async fn handle_text_message(
        &mut self,
        content: Option<String>,
        receiver_id: Option<String>,
        raw: &str,
    ) {
        let receiver = receiver_id.as_deref().and_then(|id| id.parse::<i32>().ok());
        let (Some(content), Some(receiver)) = (content, receiver) else {
            self.echo(raw);
            return;
        };

        // 同步持久化；失败只记录，不阻断转发
        if let Err(err) = self
            .ctx
            .db
            .store_message(self.user_id, receiver, &content)
            .await
        {
            warn!(
                sender = self.user_id,
                receiver = receiver,
                error = %err,
                "Failed to persist message"
            );
        }

        match self.ctx.sessions.get(receiver) {
            Some(handle) => {
                let delivered = handle.send_frame(&ServerFrame::TextMessage {
                    sender_id: self.user_id.to_string(),
                    content,
                    timestamp: now_millis(),
                });
                debug!(
                    sender = self.user_id,
                    receiver = receiver,
                    delivered = delivered,
                    "Message forwarded"
                );
            }
            None => debug!(
                sender = self.user_id,
                receiver = receiver,
                "Receiver offline, message stored only"
            ),
        }
    }

    async fn handle_search_user(&mut self, keyword: Option<String>, raw: &str) {
        let Some(keyword) = keyword.filter(|keyword| !keyword.is_empty()) else {
            self.echo(raw);
            return;
        };

        let users = match self.ctx.db.search_users(&keyword).await {
            Ok(rows) => rows
                .into_iter()
                .map(|(user_id, user_name)| UserSummary {
                    user_status: if self.ctx.connections.online(user_id) {
                        "ONLINE".to_string()
                    } else {
                        "OFFLINE".to_string()
                    },
                    user_id: user_id.to_string(),
                    user_name,
                })
                .collect(),
            Err(err) => {
                warn!(user_id = self.user_id, error = %err, "User search failed");
                Vec::new()
            }
        };
        self.enqueue(&ServerFrame::SearchUserResponse { users });
    }

    async fn handle_add_friend(&mut self, friend_id: Option<String>, raw: &str) {
        let Some(friend_id) = friend_id.as_deref().and_then(|id| id.parse::<i32>().ok()) else {
            self.echo(raw);
            return;
        };

        let result = match self.stub.as_mut() {
            Some(stub) => stub.add_friend(self.user_id, friend_id).await,
            None => Err(GateError::BackendUnavailable(
                "status client not available".to_string(),
            )),
        };
        // 只回给请求方本人
        match result {
            Ok((success, message)) => {
                self.enqueue(&ServerFrame::AddFriendResponse { success, message })
            }
            Err(err) => {
                warn!(user_id = self.user_id, error = %err, "AddFriend RPC failed");
                self.note_stub_fault();
                self.enqueue(&ServerFrame::AddFriendResponse {
                    success: false,
                    message: "Status service unavailable".to_string(),
                });
            }
        }
    }

    async fn handle_get_friends_list(&mut self) {
        let result = match self.stub.as_mut() {
            Some(stub) => stub.get_friends_list(self.user_id).await,
            None => Err(GateError::BackendUnavailable(
                "status client not available".to_string(),
            )),
        };
        match result {
            Ok((success, friends, message)) => self.enqueue(&ServerFrame::FriendsListResponse {
                success,
                friends: friends
                    .into_iter()
                    .map(|friend| FriendEntry {
                        user_id: friend.user_id.to_string(),
                        user_name: friend.username,
                    })
                    .collect(),
                message,
            }),
            Err(err) => {
                warn!(user_id = self.user_id, error = %err, "GetFriendsList RPC failed");
                self.note_stub_fault();
                self.enqueue(&ServerFrame::FriendsListResponse {
                    success: false,
                    friends: Vec::new(),
                    message: "Status service unavailable".to_string(),
                });
            }
        }
    }

    async fn handle_get_chat_history(
        &mut self,
        peer_id: Option<String>,
        limit: Option<u32>,
        raw: &str,
    ) {
        let Some(peer_id) = peer_id.as_deref().and_then(|id| id.parse::<i32>().ok()) else {
            self.echo(raw);
            return;
        };
        let limit = limit.unwrap_or(HISTORY_DEFAULT_LIMIT).min(HISTORY_MAX_LIMIT);

        match self.ctx.db.chat_history(self.user_id, peer_id, limit).await {
            Ok(records) => self.enqueue(&ServerFrame::ChatHistoryResponse {
                success: true,
                messages: records
                    .into_iter()
                    .map(|record| ChatRecord {
                        sender_id: record.sender_id.to_string(),
                        receiver_id: record.receiver_id.to_string(),
                        content: record.content,
                        timestamp: record.ts.timestamp_millis(),
                    })
                    .collect(),
            }),
            Err(err) => {
                warn!(user_id = self.user_id, error = %err, "Chat history query failed");
                self.enqueue(&ServerFrame::ChatHistoryResponse {
                    success: false,
                    messages: Vec::new(),
                });
            }
        }
    }

    /// 异步发布在线状态，尽力而为；缓存写穿由状态服务完成
    fn publish_status(&self, status: UserStatus) {
        let Some(stub) = self.stub.clone() else {
            return;
        };
        let ctx = self.ctx.clone();
        let user_id = self.user_id;
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut stub = stub;
            match stub.update_user_status(user_id, status, &token).await {
                Ok((true, _)) => {
                    debug!(user_id = user_id, status = ?status, "Presence published")
                }
                Ok((false, message)) => warn!(
                    user_id = user_id,
                    message = %message,
                    "Presence update rejected"
                ),
                Err(err) => {
                    warn!(user_id = user_id, error = %err, "Presence update failed");
                    if stub.is_faulted() {
                        if let Some((host, port)) = stub.instance() {
                            ctx.balancer.update_health(STATUS, &host, port, false);
                        }
                    }
                }
            }
        });
    }

    /// 存根观察到传输故障时，把所属实例标记为不健康
    fn note_stub_fault(&self) {
        if let Some(stub) = &self.stub {
            if stub.is_faulted() {
                if let Some((host, port)) = stub.instance() {
                    self.ctx.balancer.update_health(STATUS, &host, port, false);
                }
            }
        }
    }

    /// 会话清理，幂等；四条终止路径共用
    async fn teardown(&mut self, reason: CloseReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!(
            user_id = self.user_id,
            session_id = %self.session_id,
            reason = reason.as_str(),
            "WebSocket session closing"
        );

        // 1. 尽力而为地发布离线状态，不阻塞清理
        self.publish_status(UserStatus::Offline);

        // 2. 比对删除管理器条目，再移除注册表双向映射
        if !self.ctx.sessions.remove_if(self.user_id, &self.session_id) {
            debug!(
                user_id = self.user_id,
                "Manager handle already replaced by a newer session"
            );
        }
        self.ctx.connections.remove(self.user_id, &self.session_id);

        // 3. 归还存根；有传输故障的存根由池丢弃
        if let Some(stub) = self.stub.take() {
            self.ctx.status_pool.release(stub);
        }

        // 4. 关闭传输：压入 Close 帧，发送端随会话一起销毁后写任务退出
        let _ = self.outbound.send(Message::Close(Some(CloseFrame {
            code: reason.close_code(),
            reason: reason.as_str().into(),
        })));
    }
}
