use futures::future::BoxFuture;

use crate::conversation::{Conversation, ParticipantPair};
use crate::errors::RepositoryError;
use crate::message::{Message, NewMessage};
use crate::value_objects::{ConversationId, Timestamp, UserId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;
pub type RepositoryFuture<T> = BoxFuture<'static, RepositoryResult<T>>;

#[cfg_attr(feature = "testing", mockall::automock)]
pub trait ConversationRepository: Send + Sync {
    /// 按规范化参与者对查找私信会话，两种顺序都能匹配
    fn find_direct(&self, pair: ParticipantPair) -> RepositoryFuture<Option<Conversation>>;

    /// 插入新会话。私信会话的参与者对已存在时返回 `RepositoryError::Conflict`。
    fn insert(&self, conversation: Conversation) -> RepositoryFuture<Conversation>;

    fn find_by_id(&self, id: ConversationId) -> RepositoryFuture<Option<Conversation>>;

    /// 用户参与的全部会话，按 `updated_at` 倒序
    fn list_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<Conversation>>;
}

#[cfg_attr(feature = "testing", mockall::automock)]
pub trait MessageRepository: Send + Sync {
    /// 追加消息并推进会话的 `updated_at`，两者在同一事务里完成。
    ///
    /// 会话不存在时返回 `RepositoryError::NotFound`。
    fn append(&self, message: NewMessage) -> RepositoryFuture<Message>;

    /// 最近 `limit` 条消息，按时间正序返回
    fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> RepositoryFuture<Vec<Message>>;

    /// 把会话里不是 `reader_id` 发出的未读消息标为已读，返回实际变更的行数
    fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        at: Timestamp,
    ) -> RepositoryFuture<u64>;

    fn count_unread(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> RepositoryFuture<u64>;
}
