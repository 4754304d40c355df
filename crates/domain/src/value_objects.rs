use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::DomainError;

/// 统一的时间戳类型。
pub type Timestamp = DateTime<Utc>;

/// 用户唯一标识。由外部身份服务分配，这里只作为外键引用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for UserId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<UserId> for Uuid {
    fn from(value: UserId) -> Self {
        value.0
    }
}

/// 会话唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConversationId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<ConversationId> for Uuid {
    fn from(value: ConversationId) -> Self {
        value.0
    }
}

/// 消息唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<MessageId> for Uuid {
    fn from(value: MessageId) -> Self {
        value.0
    }
}

/// 消息正文。去掉首尾空白后不能为空。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageText(String);

impl MessageText {
    pub fn parse(value: impl Into<String>, max_len: usize) -> Result<Self, DomainError> {
        let value = value.into();
        // 只看去掉空白后是否为空，原文（缩进、换行）原样保存
        if value.trim().is_empty() {
            return Err(DomainError::invalid_argument("text", "cannot be empty"));
        }
        if value.chars().count() > max_len {
            return Err(DomainError::invalid_argument(
                "text",
                format!("longer than {max_len} characters"),
            ));
        }
        Ok(Self(value))
    }

    /// 从存储中恢复，不再重复校验长度
    pub fn from_stored(value: impl Into<String>) -> Result<Self, DomainError> {
        Self::parse(value, usize::MAX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 去掉首尾空白后截取前 `max_chars` 个字符，用于通知预览
    pub fn preview(&self, max_chars: usize) -> String {
        let text = self.0.trim();
        if text.chars().count() <= max_chars {
            return text.to_owned();
        }
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}

impl fmt::Display for MessageText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_keeps_original_whitespace() {
        let text = MessageText::parse("    fn main() {}\n", 100).unwrap();
        assert_eq!(text.as_str(), "    fn main() {}\n");
        assert_eq!(text.preview(100), "fn main() {}");
    }

    #[test]
    fn blank_message_text_is_rejected() {
        assert!(matches!(
            MessageText::parse(" \n\t ", 100),
            Err(DomainError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn long_message_text_is_rejected_by_char_count() {
        assert!(MessageText::parse("ééé", 3).is_ok());
        assert!(MessageText::parse("éééé", 3).is_err());
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let text = MessageText::parse("你好世界，欢迎投递简历", 100).unwrap();
        assert_eq!(text.preview(4), "你好世界…");
        assert_eq!(text.preview(100), "你好世界，欢迎投递简历");
    }
}
