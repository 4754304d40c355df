//! 领域模型错误定义

use thiserror::Error;

/// 领域不变量被破坏时返回的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 不能和自己建立会话
    #[error("cannot open a conversation with yourself")]
    SelfConversation,

    /// 参数不合法
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: String, reason: String },
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 仓储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    /// 唯一约束冲突
    #[error("record conflicts with an existing one")]
    Conflict,
    #[error("storage failure: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

