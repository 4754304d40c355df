//! 应用层实现。
//!
//! 连接注册表、会话目录、消息存储、在线状态和消息扇出都在这里，
//! 对外只暴露 `ChatService` 门面和外部协作方（身份校验、用户资料）的抽象。

pub mod clock;
pub mod directory;
pub mod error;
pub mod events;
pub mod fanout;
pub mod identity;
pub mod memory;
pub mod message_store;
pub mod presence;
pub mod registry;
pub mod services;

pub use clock::{Clock, SystemClock};
pub use directory::{ConversationDirectory, ConversationView};
pub use error::{ApplicationError, ApplicationResult};
pub use events::{MessageNotification, MessagePayload, PresenceStatus, ServerEvent};
pub use fanout::{ConversationGuard, ConversationLocks, FanoutEngine, SendReport, SendStage};
pub use identity::{resolve_profile, IdentityVerifier, ProfileDirectory, VerifyError};
pub use memory::{InMemoryProfileDirectory, InMemoryStore};
pub use message_store::MessageStore;
pub use presence::PresenceBroadcaster;
pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, PresenceChange, PresenceChanges,
};
pub use services::{ChatService, ChatServiceDependencies, ConversationSummary};
