use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, MessageId, MessageText, Timestamp, UserId};

/// 待写入的消息。`seq` 和最终的 `created_at` 由存储层分配。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: MessageText,
    pub sent_at: Timestamp,
}

/// 已持久化的消息。除已读状态外不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: MessageText,
    pub created_at: Timestamp,
    /// 插入序号，`created_at` 相同时用它决定先后
    pub seq: i64,
    pub read: bool,
    pub read_at: Option<Timestamp>,
}

impl Message {
    /// 标记为已读；已经读过时返回 `false`
    pub fn mark_read(&mut self, at: Timestamp) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        self.read_at = Some(at);
        true
    }

    /// 会话内全序的排序键
    pub fn order_key(&self) -> (Timestamp, i64) {
        (self.created_at, self.seq)
    }
}
