//! 外部身份协作方的接口
//!
//! 凭证签发和用户资料都归外部服务所有，这里只定义消费方需要的能力。

use async_trait::async_trait;
use domain::{DisplayProfile, Identity, UserId};
use thiserror::Error;

use crate::error::ApplicationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("credential missing")]
    Missing,
    #[error("credential rejected: {0}")]
    Invalid(String),
}

/// 校验 bearer 凭证并返回稳定的用户身份
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, VerifyError>;
}

/// 按用户 id 查询展示资料
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn lookup(&self, user_id: UserId) -> Result<Option<DisplayProfile>, ApplicationError>;
}

/// 查询资料，失败或不存在时退回占位资料。资料只用于展示，不应该阻断消息流。
pub async fn resolve_profile(profiles: &dyn ProfileDirectory, user_id: UserId) -> DisplayProfile {
    match profiles.lookup(user_id).await {
        Ok(Some(profile)) => profile,
        Ok(None) => {
            tracing::debug!(user_id = %user_id, "profile not found, using placeholder");
            DisplayProfile::unknown(user_id)
        }
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "profile lookup failed");
            DisplayProfile::unknown(user_id)
        }
    }
}
