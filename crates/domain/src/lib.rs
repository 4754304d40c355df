//! 消息系统核心领域模型
//!
//! 包含会话、消息、身份引用等实体，以及仓储接口。

pub mod conversation;
pub mod errors;
pub mod identity;
pub mod message;
pub mod repository;
pub mod value_objects;

// 重新导出常用类型
pub use conversation::*;
pub use errors::*;
pub use identity::*;
pub use message::*;
pub use repository::*;
pub use value_objects::*;
