//! 在线连接注册表
//!
//! 进程内唯一的共享可变结构：用户到连接的映射、连接的会话订阅，以及由连接计数推导出的在线状态。
//! 用户维度按分片加锁，不同用户之间的注册互不阻塞；同一用户的注册和注销在所属分片上串行化，
//! 在线/离线跃迁在持锁期间计算并投递，保证每次真实跃迁恰好产生一次事件且顺序正确。
//!
//! 锁顺序固定为先分片后订阅表。

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use domain::{ConversationId, UserId};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::events::{PresenceStatus, ServerEvent};

pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单个已认证连接的投递句柄。克隆开销很小，快照里拿到的句柄在连接关闭后投递会静默失败。
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    /// 创建句柄以及对应的出站队列，队列由连接的写任务消费
    pub fn new(user_id: UserId) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: ConnectionId::generate(),
                user_id,
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 投递事件，连接已经关闭时返回 `false`
    pub fn deliver(&self, event: ServerEvent) -> bool {
        let name = event.name();
        match self.sender.send(event) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(
                    connection_id = %self.id,
                    user_id = %self.user_id,
                    event = name,
                    "dropping event for closed connection"
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// 在线状态跃迁
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub status: PresenceStatus,
}

/// 跃迁事件流，由 `PresenceBroadcaster` 消费
#[derive(Debug)]
pub struct PresenceChanges {
    receiver: mpsc::UnboundedReceiver<PresenceChange>,
}

impl PresenceChanges {
    pub async fn recv(&mut self) -> Option<PresenceChange> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PresenceChange> {
        self.receiver.try_recv().ok()
    }
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    subscriptions: HashSet<ConversationId>,
}

type UserShard = HashMap<UserId, HashMap<ConnectionId, ConnectionEntry>>;

pub struct ConnectionRegistry {
    shards: Vec<RwLock<UserShard>>,
    rooms: RwLock<HashMap<ConversationId, HashMap<ConnectionId, ConnectionHandle>>>,
    presence: mpsc::UnboundedSender<PresenceChange>,
}

impl ConnectionRegistry {
    pub fn new() -> (Self, PresenceChanges) {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> (Self, PresenceChanges) {
        let (presence, receiver) = mpsc::unbounded_channel();
        let registry = Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            rooms: RwLock::new(HashMap::new()),
            presence,
        };
        (registry, PresenceChanges { receiver })
    }

    fn shard(&self, user_id: UserId) -> &RwLock<UserShard> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    fn emit(&self, user_id: UserId, status: PresenceStatus) {
        if self
            .presence
            .send(PresenceChange { user_id, status })
            .is_err()
        {
            tracing::debug!(user_id = %user_id, ?status, "presence listener gone");
        }
    }

    /// 注册连接；用户的第一条连接会产生 `online` 跃迁。返回是否发生了跃迁。
    pub async fn register(&self, handle: ConnectionHandle) -> bool {
        let user_id = handle.user_id();
        let connection_id = handle.id();
        let mut shard = self.shard(user_id).write().await;
        let connections = shard.entry(user_id).or_default();
        let came_online = connections.is_empty();
        connections.insert(
            connection_id,
            ConnectionEntry {
                handle,
                subscriptions: HashSet::new(),
            },
        );
        if came_online {
            self.emit(user_id, PresenceStatus::Online);
        }
        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            connections = connections.len(),
            "connection registered"
        );
        came_online
    }

    /// 注销连接并清理它的全部订阅；最后一条连接离开时产生 `offline` 跃迁。
    /// 未注册过的连接直接忽略。
    pub async fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let user_id = handle.user_id();
        let mut shard = self.shard(user_id).write().await;
        let Some(connections) = shard.get_mut(&user_id) else {
            return false;
        };
        let Some(entry) = connections.remove(&handle.id()) else {
            return false;
        };

        if !entry.subscriptions.is_empty() {
            let mut rooms = self.rooms.write().await;
            for conversation_id in &entry.subscriptions {
                remove_subscriber(&mut rooms, *conversation_id, handle.id());
            }
        }

        let went_offline = connections.is_empty();
        if went_offline {
            shard.remove(&user_id);
            self.emit(user_id, PresenceStatus::Offline);
        }
        tracing::debug!(
            user_id = %user_id,
            connection_id = %handle.id(),
            went_offline,
            "connection unregistered"
        );
        went_offline
    }

    /// 用户当前连接的快照
    pub async fn connections_for(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        self.shard(user_id)
            .read()
            .await
            .get(&user_id)
            .map(|connections| {
                connections
                    .values()
                    .map(|entry| entry.handle.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.shard(user_id).read().await.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for shard in &self.shards {
            users.extend(shard.read().await.keys().copied());
        }
        users
    }

    pub async fn all_connections(&self) -> Vec<ConnectionHandle> {
        let mut handles = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().await;
            handles.extend(
                shard
                    .values()
                    .flat_map(|connections| connections.values())
                    .map(|entry| entry.handle.clone()),
            );
        }
        handles
    }

    pub async fn connection_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.read().await.values().map(HashMap::len).sum::<usize>();
        }
        count
    }

    /// 把连接加入会话的广播组。连接未注册时返回 `false`。
    pub async fn subscribe(&self, handle: &ConnectionHandle, conversation_id: ConversationId) -> bool {
        let user_id = handle.user_id();
        let mut shard = self.shard(user_id).write().await;
        let Some(entry) = shard
            .get_mut(&user_id)
            .and_then(|connections| connections.get_mut(&handle.id()))
        else {
            return false;
        };
        entry.subscriptions.insert(conversation_id);
        self.rooms
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(handle.id(), entry.handle.clone());
        true
    }

    /// 退出广播组，返回之前是否订阅过
    pub async fn unsubscribe(&self, handle: &ConnectionHandle, conversation_id: ConversationId) -> bool {
        let user_id = handle.user_id();
        let mut shard = self.shard(user_id).write().await;
        let Some(entry) = shard
            .get_mut(&user_id)
            .and_then(|connections| connections.get_mut(&handle.id()))
        else {
            return false;
        };
        if !entry.subscriptions.remove(&conversation_id) {
            return false;
        }
        let mut rooms = self.rooms.write().await;
        remove_subscriber(&mut rooms, conversation_id, handle.id());
        true
    }

    /// 订阅了会话的全部连接快照
    pub async fn subscribers_of(&self, conversation_id: ConversationId) -> Vec<ConnectionHandle> {
        self.rooms
            .read()
            .await
            .get(&conversation_id)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 用户是否有任一连接订阅了会话
    pub async fn is_subscribed(&self, user_id: UserId, conversation_id: ConversationId) -> bool {
        self.shard(user_id)
            .read()
            .await
            .get(&user_id)
            .map(|connections| {
                connections
                    .values()
                    .any(|entry| entry.subscriptions.contains(&conversation_id))
            })
            .unwrap_or(false)
    }
}

fn remove_subscriber(
    rooms: &mut HashMap<ConversationId, HashMap<ConnectionId, ConnectionHandle>>,
    conversation_id: ConversationId,
    connection_id: ConnectionId,
) {
    if let Some(subscribers) = rooms.get_mut(&conversation_id) {
        subscribers.remove(&connection_id);
        if subscribers.is_empty() {
            rooms.remove(&conversation_id);
        }
    }
}
