//! 消息扇出
//!
//! 一次发送依次经过：校验 → 持久化 → 向订阅连接广播 → 提醒未订阅的在线参与者。
//! 持久化和广播在该会话自己的锁内完成，保证每个订阅者收到的顺序与存储顺序一致，
//! 不同会话之间互不等待。持久化失败只通知发送者，不会产生任何广播。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use domain::{ConversationId, Message};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::directory::ConversationDirectory;
use crate::error::ApplicationResult;
use crate::events::{MessageNotification, MessagePayload, ServerEvent};
use crate::identity::{resolve_profile, ProfileDirectory};
use crate::message_store::MessageStore;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// 每个会话一把互斥锁，只串行化同一会话内的持久化与广播。
///
/// 锁按需创建，最后一个持有者释放后从表里移除。
#[derive(Default)]
pub struct ConversationLocks {
    locks: StdMutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, conversation_id: ConversationId) -> ConversationGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(conversation_id).or_default())
        };
        let guard = lock.lock_owned().await;
        ConversationGuard {
            locks: self,
            conversation_id,
            guard: Some(guard),
        }
    }

    /// 当前登记的会话锁数量
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, conversation_id: ConversationId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 表里那一份是唯一引用时说明没有人持有或等待
        if locks
            .get(&conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&conversation_id);
        }
    }
}

/// 会话锁守卫，释放时顺带清理空闲的锁
pub struct ConversationGuard<'a> {
    locks: &'a ConversationLocks,
    conversation_id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        // 先释放互斥锁，再让 Arc 引用计数回落
        drop(self.guard.take());
        self.locks.release(self.conversation_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStage {
    Validating,
    Persisting,
    Broadcasting,
    Notifying,
}

impl fmt::Display for SendStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            SendStage::Validating => "validating",
            SendStage::Persisting => "persisting",
            SendStage::Broadcasting => "broadcasting",
            SendStage::Notifying => "notifying",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub message: Message,
    /// 收到 `newMessage` 的连接数
    pub delivered: usize,
    /// 收到 `newMessageNotification` 的连接数
    pub notified: usize,
}

pub struct FanoutEngine {
    directory: Arc<ConversationDirectory>,
    store: Arc<MessageStore>,
    registry: Arc<ConnectionRegistry>,
    profiles: Arc<dyn ProfileDirectory>,
    locks: Arc<ConversationLocks>,
}

impl FanoutEngine {
    pub fn new(
        directory: Arc<ConversationDirectory>,
        store: Arc<MessageStore>,
        registry: Arc<ConnectionRegistry>,
        profiles: Arc<dyn ProfileDirectory>,
        locks: Arc<ConversationLocks>,
    ) -> Self {
        Self {
            directory,
            store,
            registry,
            profiles,
            locks,
        }
    }

    pub async fn send(
        &self,
        from: &ConnectionHandle,
        conversation_id: ConversationId,
        raw_text: &str,
    ) -> ApplicationResult<SendReport> {
        let sender_id = from.user_id();

        let text = self.store.parse_text(raw_text).inspect_err(|err| {
            tracing::debug!(
                conversation_id = %conversation_id,
                sender_id = %sender_id,
                stage = %SendStage::Validating,
                error = %err,
                "message rejected"
            );
        })?;
        let conversation = self
            .directory
            .membership_check(conversation_id, sender_id)
            .await
            .inspect_err(|err| {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    sender_id = %sender_id,
                    stage = %SendStage::Validating,
                    error = %err,
                    "message rejected"
                );
            })?;
        let sender = resolve_profile(self.profiles.as_ref(), sender_id).await;

        let guard = self.locks.lock(conversation_id).await;

        let message = match self.store.append(&conversation, sender_id, text).await {
            Ok(message) => message,
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    sender_id = %sender_id,
                    stage = %SendStage::Persisting,
                    error = %err,
                    "failed to persist message"
                );
                return Err(err);
            }
        };

        let payload = MessagePayload::new(&message, Some(&sender));
        let subscribers = self.registry.subscribers_of(conversation_id).await;
        let delivered = subscribers
            .iter()
            .filter(|handle| handle.deliver(ServerEvent::NewMessage(payload.clone())))
            .count();
        drop(guard);

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            stage = %SendStage::Broadcasting,
            subscribers = subscribers.len(),
            delivered,
            "message broadcast"
        );

        let notification = MessageNotification {
            conversation_id,
            message_id: message.id,
            sender_id,
            sender_name: Some(sender.display_name().to_owned()),
            preview: message.text.preview(self.store.settings().preview_len),
            timestamp: message.created_at,
        };
        let mut notified = 0;
        for participant in conversation.participants() {
            if participant == sender_id
                || self.registry.is_subscribed(participant, conversation_id).await
            {
                continue;
            }
            for handle in self.registry.connections_for(participant).await {
                if handle.deliver(ServerEvent::NewMessageNotification(notification.clone())) {
                    notified += 1;
                }
            }
        }
        if notified > 0 {
            tracing::debug!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                stage = %SendStage::Notifying,
                notified,
                "participants notified outside the conversation"
            );
        }

        Ok(SendReport {
            message,
            delivered,
            notified,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use config::RealtimeConfig;
    use domain::{
        MessageRepository, MockMessageRepository, NewMessage, RepositoryError, RepositoryFuture,
        Timestamp, UserId,
    };
    use uuid::Uuid;

    use super::*;
    use crate::clock::SystemClock;
    use crate::memory::{InMemoryProfileDirectory, InMemoryStore};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        directory: Arc<ConversationDirectory>,
        engine: FanoutEngine,
    }

    fn fixture(store: Arc<InMemoryStore>, messages: Arc<dyn MessageRepository>) -> Fixture {
        let (registry, _changes) = ConnectionRegistry::new();
        let registry = Arc::new(registry);
        let profiles: Arc<dyn ProfileDirectory> = Arc::new(InMemoryProfileDirectory::default());
        let directory = Arc::new(ConversationDirectory::new(
            store,
            Arc::clone(&profiles),
            Arc::new(SystemClock),
        ));
        let message_store = Arc::new(MessageStore::new(
            messages,
            Arc::new(SystemClock),
            RealtimeConfig::default(),
        ));
        let engine = FanoutEngine::new(
            Arc::clone(&directory),
            message_store,
            Arc::clone(&registry),
            profiles,
            Arc::new(ConversationLocks::new()),
        );
        Fixture {
            registry,
            directory,
            engine,
        }
    }

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[tokio::test]
    async fn persistence_failure_reaches_nobody() {
        let store = Arc::new(InMemoryStore::default());
        let mut messages = MockMessageRepository::new();
        messages
            .expect_append()
            .times(1)
            .returning(|_| Box::pin(async { Err(RepositoryError::storage("disk full")) }));
        let fx = fixture(Arc::clone(&store), Arc::new(messages));

        let (a, b) = (user(), user());
        let conversation = fx
            .directory
            .get_or_create_direct(a, b, None, None)
            .await
            .unwrap()
            .conversation;
        let (sender, mut sender_rx) = ConnectionHandle::new(a);
        let (peer, mut peer_rx) = ConnectionHandle::new(b);
        for handle in [&sender, &peer] {
            fx.registry.register(handle.clone()).await;
            fx.registry.subscribe(handle, conversation.id).await;
        }

        let err = fx
            .engine
            .send(&sender, conversation.id, "hello")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNAVAILABLE");
        assert!(sender_rx.try_recv().is_err());
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_member_send_is_forbidden_and_not_persisted() {
        let store = Arc::new(InMemoryStore::default());
        let fx = fixture(Arc::clone(&store), store.clone());
        let (a, b) = (user(), user());
        let conversation = fx
            .directory
            .get_or_create_direct(a, b, None, None)
            .await
            .unwrap()
            .conversation;

        let (outsider, _rx) = ConnectionHandle::new(user());
        fx.registry.register(outsider.clone()).await;
        let err = fx
            .engine
            .send(&outsider, conversation.id, "let me in")
            .await
            .unwrap_err();

        assert_eq!(err.code(), "FORBIDDEN");
        assert!(store.list_recent(conversation.id, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribers_get_message_and_others_get_notification() {
        let store = Arc::new(InMemoryStore::default());
        let fx = fixture(Arc::clone(&store), store.clone());
        let (a, b) = (user(), user());
        let conversation = fx
            .directory
            .get_or_create_direct(a, b, None, None)
            .await
            .unwrap()
            .conversation;

        let (a_phone, mut a_phone_rx) = ConnectionHandle::new(a);
        let (a_laptop, mut a_laptop_rx) = ConnectionHandle::new(a);
        let (b_phone, mut b_phone_rx) = ConnectionHandle::new(b);
        for handle in [&a_phone, &a_laptop, &b_phone] {
            fx.registry.register(handle.clone()).await;
        }
        fx.registry.subscribe(&a_phone, conversation.id).await;
        fx.registry.subscribe(&a_laptop, conversation.id).await;

        let report = fx
            .engine
            .send(&a_phone, conversation.id, "  hello  ")
            .await
            .unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.notified, 1);
        assert_eq!(report.message.text.as_str(), "  hello  ");

        assert!(matches!(a_phone_rx.try_recv(), Ok(ServerEvent::NewMessage(_))));
        assert!(matches!(a_laptop_rx.try_recv(), Ok(ServerEvent::NewMessage(_))));
        match b_phone_rx.try_recv() {
            Ok(ServerEvent::NewMessageNotification(notification)) => {
                assert_eq!(notification.preview, "hello");
                assert_eq!(notification.sender_id, a);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_text_touches_no_storage() {
        let store = Arc::new(InMemoryStore::default());
        let mut messages = MockMessageRepository::new();
        messages.expect_append().never();
        let fx = fixture(store, Arc::new(messages));
        let (sender, _rx) = ConnectionHandle::new(user());

        let err = fx
            .engine
            .send(&sender, ConversationId::from(Uuid::new_v4()), "   ")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    /// 指定会话的追加永远挂起，其余会话照常写入内存存储
    struct StallingMessages {
        inner: Arc<InMemoryStore>,
        stalled: StdMutex<Option<ConversationId>>,
    }

    impl StallingMessages {
        fn stall(&self, conversation_id: ConversationId) {
            *self.stalled.lock().unwrap() = Some(conversation_id);
        }
    }

    impl MessageRepository for StallingMessages {
        fn append(&self, message: NewMessage) -> RepositoryFuture<Message> {
            if *self.stalled.lock().unwrap() == Some(message.conversation_id) {
                return Box::pin(futures::future::pending());
            }
            self.inner.append(message)
        }

        fn list_recent(
            &self,
            conversation_id: ConversationId,
            limit: u32,
        ) -> RepositoryFuture<Vec<Message>> {
            self.inner.list_recent(conversation_id, limit)
        }

        fn mark_read(
            &self,
            conversation_id: ConversationId,
            reader_id: UserId,
            at: Timestamp,
        ) -> RepositoryFuture<u64> {
            self.inner.mark_read(conversation_id, reader_id, at)
        }

        fn count_unread(
            &self,
            conversation_id: ConversationId,
            reader_id: UserId,
        ) -> RepositoryFuture<u64> {
            self.inner.count_unread(conversation_id, reader_id)
        }
    }

    #[tokio::test]
    async fn stalled_append_does_not_block_other_conversations() {
        let store = Arc::new(InMemoryStore::default());
        let messages = Arc::new(StallingMessages {
            inner: Arc::clone(&store),
            stalled: StdMutex::new(None),
        });
        let fx = Arc::new(fixture(Arc::clone(&store), messages.clone()));

        let (a, b, c, d) = (user(), user(), user(), user());
        let stuck = fx
            .directory
            .get_or_create_direct(a, b, None, None)
            .await
            .unwrap()
            .conversation;
        let healthy = fx
            .directory
            .get_or_create_direct(c, d, None, None)
            .await
            .unwrap()
            .conversation;
        messages.stall(stuck.id);

        let (a_conn, _a_rx) = ConnectionHandle::new(a);
        let (c_conn, _c_rx) = ConnectionHandle::new(c);
        let stuck_send = {
            let fx = Arc::clone(&fx);
            tokio::spawn(async move { fx.engine.send(&a_conn, stuck.id, "hello").await })
        };
        // 等挂起的发送拿到锁并卡在持久化上
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            fx.engine.send(&c_conn, healthy.id, "hi"),
        )
        .await
        .expect("send in an unrelated conversation should not wait")
        .unwrap();
        assert_eq!(report.message.conversation_id, healthy.id);
        assert!(!stuck_send.is_finished());
        stuck_send.abort();
    }

    #[tokio::test]
    async fn same_conversation_is_serialized_and_idle_locks_are_dropped() {
        let locks = Arc::new(ConversationLocks::new());
        let (x, y) = (
            ConversationId::from(Uuid::new_v4()),
            ConversationId::from(Uuid::new_v4()),
        );

        let held = locks.lock(x).await;
        // 其他会话立即可得
        let other = tokio::time::timeout(Duration::from_millis(100), locks.lock(y))
            .await
            .expect("different conversation must not wait");
        drop(other);

        // 同一会话要等持有者释放
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(x).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
