//! WebSocket 帧定义
//!
//! 所有帧都是 UTF-8 JSON 文本，按 `type` 字段带标签分发。
//! 入站帧字段在边界处校验：缺失必填字段按协议错误处理（回显）。
//! 用户 ID 在线上以字符串传输。

use serde::{Deserialize, Serialize};

/// 客户端入站帧
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Login,
    Heartbeat,
    TextMessage {
        content: Option<String>,
        receiver_id: Option<String>,
    },
    SearchUser {
        keyword: Option<String>,
    },
    AddFriendRequest {
        friend_id: Option<String>,
    },
    GetFriendsList,
    GetChatHistory {
        peer_id: Option<String>,
        limit: Option<u32>,
    },
}

/// 服务端出站帧
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    LoginResponse {
        success: bool,
        message: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    HeartbeatResponse {
        timestamp: i64,
    },
    /// 服务端主动下发的心跳
    Heartbeat {
        timestamp: i64,
    },
    TextMessage {
        sender_id: String,
        content: String,
        timestamp: i64,
    },
    SearchUserResponse {
        users: Vec<UserSummary>,
    },
    AddFriendResponse {
        success: bool,
        message: String,
    },
    FriendsListResponse {
        success: bool,
        friends: Vec<FriendEntry>,
        message: String,
    },
    ChatHistoryResponse {
        success: bool,
        messages: Vec<ChatRecord>,
    },
    /// 回显包装，未知或畸形入站帧走这里
    Message {
        from: String,
        content: String,
    },
}

impl ServerFrame {
    /// 回显帧：`{type:"message",from:"server",content:"Echo: …"}`
    pub fn echo(raw: &str) -> Self {
        ServerFrame::Message {
            from: "server".to_string(),
            content: format!("Echo: {}", raw),
        }
    }
}

/// 搜索结果行
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "userStatus")]
    pub user_status: String,
}

/// 好友列表行
#[derive(Debug, Clone, Serialize)]
pub struct FriendEntry {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "userName")]
    pub user_name: String,
}

/// 聊天记录行
#[derive(Debug, Clone, Serialize)]
pub struct ChatRecord {
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_message_frame() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"text_message","content":"hi","receiver_id":"2"}"#)
                .unwrap();
        match frame {
            ClientFrame::TextMessage {
                content,
                receiver_id,
            } => {
                assert_eq!(content.as_deref(), Some("hi"));
                assert_eq!(receiver_id.as_deref(), Some("2"));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn parses_unit_frames_with_extra_fields() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"heartbeat","timestamp":123}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Heartbeat));
    }

    #[test]
    fn unknown_type_is_a_parse_error() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"no_such_frame"}"#).is_err());
    }

    #[test]
    fn login_response_wire_shape() {
        let frame = ServerFrame::LoginResponse {
            success: true,
            message: "login success".to_string(),
            user_id: "1".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "login_response");
        assert_eq!(value["userId"], "1");
    }

    #[test]
    fn echo_wraps_raw_payload() {
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&ServerFrame::echo("not json")).unwrap())
                .unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["from"], "server");
        assert_eq!(value["content"], "Echo: not json");
    }

    #[test]
    fn search_response_uses_camel_case_fields() {
        let frame = ServerFrame::SearchUserResponse {
            users: vec![UserSummary {
                user_id: "3".to_string(),
                user_name: "carol".to_string(),
                user_status: "ONLINE".to_string(),
            }],
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["users"][0]["userId"], "3");
        assert_eq!(value["users"][0]["userName"], "carol");
        assert_eq!(value["users"][0]["userStatus"], "ONLINE");
    }
}
