use std::sync::Arc;

use config::RealtimeConfig;
use domain::{ConversationId, ConversationRepository, MessageRepository, UserId};
use tokio::sync::mpsc;

use crate::{
    clock::Clock,
    directory::{ConversationDirectory, ConversationView},
    error::ApplicationResult,
    events::{MessagePayload, ServerEvent},
    fanout::{ConversationLocks, FanoutEngine, SendReport},
    identity::ProfileDirectory,
    message_store::MessageStore,
    presence::PresenceBroadcaster,
    registry::{ConnectionHandle, ConnectionRegistry},
};

pub struct ChatServiceDependencies {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<ConnectionRegistry>,
    pub settings: RealtimeConfig,
}

/// 会话列表条目
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub view: ConversationView,
    pub unread_count: u64,
    pub peer_online: bool,
}

/// 实时消息用例的门面，网关和 HTTP 路由都只依赖它
pub struct ChatService {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<ConversationDirectory>,
    store: Arc<MessageStore>,
    presence: Arc<PresenceBroadcaster>,
    fanout: FanoutEngine,
    locks: Arc<ConversationLocks>,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        let directory = Arc::new(ConversationDirectory::new(
            deps.conversations,
            Arc::clone(&deps.profiles),
            Arc::clone(&deps.clock),
        ));
        let store = Arc::new(MessageStore::new(deps.messages, deps.clock, deps.settings));
        let presence = Arc::new(PresenceBroadcaster::new(
            Arc::clone(&deps.registry),
            Arc::clone(&directory),
        ));
        let locks = Arc::new(ConversationLocks::new());
        let fanout = FanoutEngine::new(
            Arc::clone(&directory),
            Arc::clone(&store),
            Arc::clone(&deps.registry),
            deps.profiles,
            Arc::clone(&locks),
        );
        Self {
            registry: deps.registry,
            directory,
            store,
            presence,
            fanout,
            locks,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }

    pub fn presence(&self) -> &Arc<PresenceBroadcaster> {
        &self.presence
    }

    pub fn settings(&self) -> &RealtimeConfig {
        self.store.settings()
    }

    /// 为已认证用户建立连接：先下发 `authenticated`，再注册并触发在线广播
    pub async fn connect(
        &self,
        user_id: UserId,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (handle, receiver) = ConnectionHandle::new(user_id);
        handle.deliver(ServerEvent::Authenticated { user_id });
        self.registry.register(handle.clone()).await;
        tracing::info!(user_id = %user_id, connection_id = %handle.id(), "user connected");
        (handle, receiver)
    }

    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        self.registry.unregister(handle).await;
        tracing::info!(
            user_id = %handle.user_id(),
            connection_id = %handle.id(),
            "user disconnected"
        );
    }

    /// 加入会话：成员校验、读取历史、订阅、标记已读、下发历史。
    ///
    /// 整个过程持有会话锁，期间到达的新消息要么已在历史里，要么在历史之后推送，不重不漏。
    /// 订阅之前的任何失败都不会留下订阅。标记已读失败只记录日志。
    pub async fn join_conversation(
        &self,
        handle: &ConnectionHandle,
        conversation_id: ConversationId,
    ) -> ApplicationResult<usize> {
        let user_id = handle.user_id();
        let conversation = self
            .directory
            .membership_check(conversation_id, user_id)
            .await?;
        let view = self.directory.hydrate(conversation).await;

        let _guard = self.locks.lock(conversation_id).await;
        let history = self.store.recent(conversation_id, None).await?;
        let messages: Vec<_> = history
            .iter()
            .map(|message| MessagePayload::new(message, view.profile_of(message.sender_id)))
            .collect();
        let count = messages.len();
        self.registry.subscribe(handle, conversation_id).await;

        if let Err(err) = self.store.mark_read(conversation_id, user_id).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                user_id = %user_id,
                error = %err,
                "failed to mark messages as read on join"
            );
        }

        handle.deliver(ServerEvent::RecentMessages {
            conversation_id,
            messages,
        });
        tracing::debug!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            connection_id = %handle.id(),
            history = count,
            "joined conversation"
        );
        Ok(count)
    }

    /// 退出会话广播组，没有订阅过也不报错
    pub async fn leave_conversation(
        &self,
        handle: &ConnectionHandle,
        conversation_id: ConversationId,
    ) -> bool {
        let left = self.registry.unsubscribe(handle, conversation_id).await;
        tracing::debug!(
            conversation_id = %conversation_id,
            connection_id = %handle.id(),
            left,
            "left conversation"
        );
        left
    }

    pub async fn send_message(
        &self,
        handle: &ConnectionHandle,
        conversation_id: ConversationId,
        text: &str,
    ) -> ApplicationResult<SendReport> {
        self.fanout.send(handle, conversation_id, text).await
    }

    pub async fn typing(
        &self,
        handle: &ConnectionHandle,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> ApplicationResult<usize> {
        self.presence
            .set_typing(handle, conversation_id, is_typing)
            .await
    }

    pub async fn get_or_create_direct(
        &self,
        initiator: UserId,
        peer: UserId,
        title: Option<String>,
        description: Option<String>,
    ) -> ApplicationResult<ConversationView> {
        self.directory
            .get_or_create_direct(initiator, peer, title, description)
            .await
    }

    pub async fn open_room(
        &self,
        creator: UserId,
        peer: UserId,
        title: String,
        description: Option<String>,
    ) -> ApplicationResult<ConversationView> {
        self.directory
            .open_room(creator, peer, title, description)
            .await
    }

    /// 会话列表，带未读数和对方在线状态
    pub async fn list_conversations(
        &self,
        user_id: UserId,
    ) -> ApplicationResult<Vec<ConversationSummary>> {
        let conversations = self.directory.list_for_user(user_id).await?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let unread_count = self.store.unread_count(conversation.id, user_id).await?;
            let peer_online = match conversation.other_participant(user_id) {
                Some(peer) => self.registry.is_online(peer).await,
                None => false,
            };
            summaries.push(ConversationSummary {
                view: self.directory.hydrate(conversation).await,
                unread_count,
                peer_online,
            });
        }
        Ok(summaries)
    }

    /// 只读历史，不订阅也不改变已读状态
    pub async fn history(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        limit: Option<u32>,
    ) -> ApplicationResult<Vec<MessagePayload>> {
        let conversation = self
            .directory
            .membership_check(conversation_id, user_id)
            .await?;
        let view = self.directory.hydrate(conversation).await;
        let history = self.store.recent(conversation_id, limit).await?;
        Ok(history
            .iter()
            .map(|message| MessagePayload::new(message, view.profile_of(message.sender_id)))
            .collect())
    }
}
