use domain::{DomainError, RepositoryError};
use thiserror::Error;

/// 应用层错误，对应对外暴露的错误分类
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplicationError {
    /// 凭证缺失或无效，连接会被关闭
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// 已认证但不是会话参与者，连接保持
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// 并发创建冲突，目录服务内部重试消化，不应出现在客户端
    #[error("conflict: {0}")]
    Conflict(String),
    /// 持久化层不可用
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl ApplicationError {
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// 下发给客户端的机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION",
            Self::Conflict(_) => "CONFLICT",
            Self::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

impl From<DomainError> for ApplicationError {
    fn from(value: DomainError) -> Self {
        ApplicationError::Validation(value.to_string())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => ApplicationError::NotFound("record not found".to_string()),
            RepositoryError::Conflict => {
                ApplicationError::Conflict("record conflicts with an existing one".to_string())
            }
            RepositoryError::Storage { message } => ApplicationError::Unavailable(message),
        }
    }
}

pub type ApplicationResult<T> = Result<T, ApplicationError>;
