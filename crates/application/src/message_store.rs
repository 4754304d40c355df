use std::sync::Arc;

use config::RealtimeConfig;
use domain::{
    Conversation, ConversationId, Message, MessageId, MessageRepository, MessageText, NewMessage,
    UserId,
};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ApplicationResult;

/// 会话消息日志：只追加，按 `(created_at, seq)` 全序读取
pub struct MessageStore {
    messages: Arc<dyn MessageRepository>,
    clock: Arc<dyn Clock>,
    settings: RealtimeConfig,
}

impl MessageStore {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        clock: Arc<dyn Clock>,
        settings: RealtimeConfig,
    ) -> Self {
        Self {
            messages,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &RealtimeConfig {
        &self.settings
    }

    /// 校验消息正文，不触碰存储
    pub fn parse_text(&self, raw: &str) -> ApplicationResult<MessageText> {
        Ok(MessageText::parse(raw, self.settings.max_message_len)?)
    }

    /// 调用方必须已经完成成员校验
    pub async fn append(
        &self,
        conversation: &Conversation,
        sender_id: UserId,
        text: MessageText,
    ) -> ApplicationResult<Message> {
        let message = self
            .messages
            .append(NewMessage {
                id: MessageId::from(Uuid::new_v4()),
                conversation_id: conversation.id,
                sender_id,
                text,
                sent_at: self.clock.now(),
            })
            .await?;
        Ok(message)
    }

    /// 最近的消息，旧的在前。`limit` 缺省时用配置的历史条数，超过配置值时截断。
    pub async fn recent(
        &self,
        conversation_id: ConversationId,
        limit: Option<u32>,
    ) -> ApplicationResult<Vec<Message>> {
        let limit = limit
            .unwrap_or(self.settings.history_limit)
            .clamp(1, self.settings.history_limit);
        Ok(self.messages.list_recent(conversation_id, limit).await?)
    }

    /// 标记对方发来的消息为已读，重复调用返回 0
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> ApplicationResult<u64> {
        let changed = self
            .messages
            .mark_read(conversation_id, reader_id, self.clock.now())
            .await?;
        if changed > 0 {
            tracing::debug!(
                conversation_id = %conversation_id,
                reader_id = %reader_id,
                changed,
                "messages marked as read"
            );
        }
        Ok(changed)
    }

    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> ApplicationResult<u64> {
        Ok(self.messages.count_unread(conversation_id, reader_id).await?)
    }
}
