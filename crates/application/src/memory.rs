//! 进程内存储实现
//!
//! 与 Postgres 实现语义一致：私信参与者对唯一、追加时推进会话活跃时间、按 `(created_at, seq)` 排序。
//! 用于测试和 `database.backend = memory` 的本地开发。

use std::cmp::max;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, ConversationRepository, DisplayProfile, Message,
    MessageRepository, NewMessage, ParticipantPair, RepositoryError, RepositoryFuture, Timestamp,
    UserId,
};
use tokio::sync::{Mutex, RwLock};

use crate::error::ApplicationError;
use crate::identity::ProfileDirectory;

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationId, Conversation>,
    direct_index: HashMap<ParticipantPair, ConversationId>,
    messages: HashMap<ConversationId, Vec<Message>>,
    next_seq: i64,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl ConversationRepository for InMemoryStore {
    fn find_direct(&self, pair: ParticipantPair) -> RepositoryFuture<Option<Conversation>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let guard = state.lock().await;
            Ok(guard
                .direct_index
                .get(&pair)
                .and_then(|id| guard.conversations.get(id))
                .cloned())
        })
    }

    fn insert(&self, conversation: Conversation) -> RepositoryFuture<Conversation> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut guard = state.lock().await;
            if guard.conversations.contains_key(&conversation.id) {
                return Err(RepositoryError::Conflict);
            }
            if conversation.is_direct_message {
                let pair = conversation.pair();
                if guard.direct_index.contains_key(&pair) {
                    return Err(RepositoryError::Conflict);
                }
                guard.direct_index.insert(pair, conversation.id);
            }
            guard
                .conversations
                .insert(conversation.id, conversation.clone());
            Ok(conversation)
        })
    }

    fn find_by_id(&self, id: ConversationId) -> RepositoryFuture<Option<Conversation>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move { Ok(state.lock().await.conversations.get(&id).cloned()) })
    }

    fn list_for_user(&self, user_id: UserId) -> RepositoryFuture<Vec<Conversation>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let guard = state.lock().await;
            let mut conversations: Vec<_> = guard
                .conversations
                .values()
                .filter(|conversation| conversation.has_participant(user_id))
                .cloned()
                .collect();
            conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(conversations)
        })
    }
}

impl MessageRepository for InMemoryStore {
    fn append(&self, message: NewMessage) -> RepositoryFuture<Message> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut guard = state.lock().await;
            let state = &mut *guard;
            let conversation = state
                .conversations
                .get_mut(&message.conversation_id)
                .ok_or(RepositoryError::NotFound)?;

            let created_at = max(message.sent_at, conversation.updated_at);
            conversation.touch(created_at);
            state.next_seq += 1;

            let stored = Message {
                id: message.id,
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                text: message.text,
                created_at,
                seq: state.next_seq,
                read: false,
                read_at: None,
            };
            state
                .messages
                .entry(stored.conversation_id)
                .or_default()
                .push(stored.clone());
            Ok(stored)
        })
    }

    fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> RepositoryFuture<Vec<Message>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let guard = state.lock().await;
            let log = guard
                .messages
                .get(&conversation_id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let start = log.len().saturating_sub(limit as usize);
            Ok(log[start..].to_vec())
        })
    }

    fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        at: Timestamp,
    ) -> RepositoryFuture<u64> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let mut guard = state.lock().await;
            let changed = guard
                .messages
                .get_mut(&conversation_id)
                .map(|log| {
                    log.iter_mut()
                        .filter(|message| message.sender_id != reader_id)
                        .map(|message| message.mark_read(at))
                        .filter(|changed| *changed)
                        .count() as u64
                })
                .unwrap_or(0);
            Ok(changed)
        })
    }

    fn count_unread(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> RepositoryFuture<u64> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            let guard = state.lock().await;
            let unread = guard
                .messages
                .get(&conversation_id)
                .map(|log| {
                    log.iter()
                        .filter(|message| message.sender_id != reader_id && !message.read)
                        .count() as u64
                })
                .unwrap_or(0);
            Ok(unread)
        })
    }
}

/// 内存资料目录，开发环境和测试里代替外部用户服务
#[derive(Clone, Default)]
pub struct InMemoryProfileDirectory {
    profiles: Arc<RwLock<HashMap<UserId, DisplayProfile>>>,
}

impl InMemoryProfileDirectory {
    pub async fn insert(&self, profile: DisplayProfile) {
        self.profiles.write().await.insert(profile.user_id, profile);
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryProfileDirectory {
    async fn lookup(&self, user_id: UserId) -> Result<Option<DisplayProfile>, ApplicationError> {
        Ok(self.profiles.read().await.get(&user_id).cloned())
    }
}
