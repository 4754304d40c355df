use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 身份校验通过后得到的调用方身份
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// 对外展示用的用户资料，由外部用户服务持有，仅用于丰富下发事件。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayProfile {
    pub user_id: UserId,
    pub username: String,
    pub name: Option<String>,
    /// 招聘方 / 求职者等，取值由外部系统决定
    pub role: Option<String>,
}

impl DisplayProfile {
    /// 查不到资料时的占位
    pub fn unknown(user_id: UserId) -> Self {
        Self {
            user_id,
            username: user_id.to_string(),
            name: None,
            role: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.username)
    }
}
