use std::sync::Arc;

use domain::{ConversationId, UserId};
use tokio::task::JoinHandle;

use crate::directory::ConversationDirectory;
use crate::error::ApplicationResult;
use crate::events::{PresenceStatus, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionRegistry, PresenceChanges};

/// 在线状态与输入状态广播。两者都是尽力投递，不持久化。
pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<ConversationDirectory>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, directory: Arc<ConversationDirectory>) -> Self {
        Self {
            registry,
            directory,
        }
    }

    /// 向所有在线连接广播状态，返回成功投递的连接数
    pub async fn broadcast_presence(&self, user_id: UserId, status: PresenceStatus) -> usize {
        let event = ServerEvent::UserStatus { user_id, status };
        let delivered = self
            .registry
            .all_connections()
            .await
            .into_iter()
            .filter(|handle| handle.deliver(event.clone()))
            .count();
        tracing::info!(user_id = %user_id, ?status, delivered, "presence broadcast");
        delivered
    }

    /// 消费注册表产生的状态跃迁，直到注册表被释放
    pub fn spawn(self: Arc<Self>, mut changes: PresenceChanges) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                self.broadcast_presence(change.user_id, change.status).await;
            }
            tracing::debug!("presence stream closed");
        })
    }

    /// 转发输入状态给订阅了会话的其他连接，不包括发起的那条连接。返回投递数。
    pub async fn set_typing(
        &self,
        from: &ConnectionHandle,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> ApplicationResult<usize> {
        self.directory
            .membership_check(conversation_id, from.user_id())
            .await?;

        let event = ServerEvent::UserTyping {
            user_id: from.user_id(),
            conversation_id,
            is_typing,
        };
        let delivered = self
            .registry
            .subscribers_of(conversation_id)
            .await
            .into_iter()
            .filter(|handle| handle.id() != from.id())
            .filter(|handle| handle.deliver(event.clone()))
            .count();
        Ok(delivered)
    }
}
