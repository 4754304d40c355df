//! 服务端下发给客户端的事件

use domain::{ConversationId, DisplayProfile, Message, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

use crate::error::ApplicationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 带发送者展示信息的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub timestamp: Timestamp,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
}

impl MessagePayload {
    pub fn new(message: &Message, sender: Option<&DisplayProfile>) -> Self {
        Self {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            text: message.text.as_str().to_owned(),
            timestamp: message.created_at,
            read: message.read,
            sender_username: sender.map(|profile| profile.username.clone()),
            sender_name: sender.and_then(|profile| profile.name.clone()),
            sender_role: sender.and_then(|profile| profile.role.clone()),
        }
    }
}

/// 对方在线但没有订阅会话时收到的轻量提醒
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNotification {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub preview: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    Authenticated {
        user_id: UserId,
    },
    RecentMessages {
        conversation_id: ConversationId,
        messages: Vec<MessagePayload>,
    },
    NewMessage(MessagePayload),
    NewMessageNotification(MessageNotification),
    UserTyping {
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
    },
    UserStatus {
        user_id: UserId,
        status: PresenceStatus,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 事件名，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticated { .. } => "authenticated",
            Self::RecentMessages { .. } => "recentMessages",
            Self::NewMessage(_) => "newMessage",
            Self::NewMessageNotification(_) => "newMessageNotification",
            Self::UserTyping { .. } => "userTyping",
            Self::UserStatus { .. } => "userStatus",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

impl From<&ApplicationError> for ServerEvent {
    fn from(err: &ApplicationError) -> Self {
        ServerEvent::error(err.code(), err.to_string())
    }
}
