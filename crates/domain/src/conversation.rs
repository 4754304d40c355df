use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ConversationId, Timestamp, UserId};

const MAX_TITLE_LEN: usize = 120;
const MAX_DESCRIPTION_LEN: usize = 1000;

/// 规范化的参与者对：两个用户 id 排序后的二元组。
///
/// 私信会话以它为唯一键，(A, B) 与 (B, A) 得到同一个值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    low: UserId,
    high: UserId,
}

impl ParticipantPair {
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        if a == b {
            return Err(DomainError::SelfConversation);
        }
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { low, high })
    }

    pub fn low(&self) -> UserId {
        self.low
    }

    pub fn high(&self) -> UserId {
        self.high
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// 发起方，私信会话里不要求和规范化顺序一致
    pub participant_a_id: UserId,
    pub participant_b_id: UserId,
    pub is_direct_message: bool,
    pub title: Option<String>,
    pub description: Option<String>,
    pub created_at: Timestamp,
    /// 每条新消息都会推进，用作会话列表排序键
    pub updated_at: Timestamp,
}

impl Conversation {
    /// 两人私信会话
    pub fn new_direct(
        id: ConversationId,
        initiator: UserId,
        peer: UserId,
        title: Option<String>,
        description: Option<String>,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        ParticipantPair::new(initiator, peer)?;
        Ok(Self {
            id,
            participant_a_id: initiator,
            participant_b_id: peer,
            is_direct_message: true,
            title: Self::normalize("title", title, MAX_TITLE_LEN)?,
            description: Self::normalize("description", description, MAX_DESCRIPTION_LEN)?,
            created_at: now,
            updated_at: now,
        })
    }

    /// 带标题的非私信房间，比如围绕某个职位申请开的沟通房间。同一对用户可以有多个。
    pub fn new_room(
        id: ConversationId,
        creator: UserId,
        peer: UserId,
        title: impl Into<String>,
        description: Option<String>,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        ParticipantPair::new(creator, peer)?;
        let title = Self::normalize("title", Some(title.into()), MAX_TITLE_LEN)?
            .ok_or_else(|| DomainError::invalid_argument("title", "cannot be empty"))?;
        Ok(Self {
            id,
            participant_a_id: creator,
            participant_b_id: peer,
            is_direct_message: false,
            title: Some(title),
            description: Self::normalize("description", description, MAX_DESCRIPTION_LEN)?,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn pair(&self) -> ParticipantPair {
        let (low, high) = if self.participant_a_id < self.participant_b_id {
            (self.participant_a_id, self.participant_b_id)
        } else {
            (self.participant_b_id, self.participant_a_id)
        };
        ParticipantPair { low, high }
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.participant_a_id, self.participant_b_id]
    }

    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participant_a_id == user_id || self.participant_b_id == user_id
    }

    /// 对方用户；`user_id` 不是参与者时返回 `None`
    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        if self.participant_a_id == user_id {
            Some(self.participant_b_id)
        } else if self.participant_b_id == user_id {
            Some(self.participant_a_id)
        } else {
            None
        }
    }

    /// 推进最近活跃时间，时间不会倒退
    pub fn touch(&mut self, at: Timestamp) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }

    fn normalize(
        field: &str,
        value: Option<String>,
        max_len: usize,
    ) -> Result<Option<String>, DomainError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if trimmed.chars().count() > max_len {
            return Err(DomainError::invalid_argument(field, "too long"));
        }
        Ok(Some(trimmed.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[test]
    fn pair_is_order_independent() {
        let (a, b) = (user(), user());
        assert_eq!(
            ParticipantPair::new(a, b).unwrap(),
            ParticipantPair::new(b, a).unwrap()
        );
    }

    #[test]
    fn pair_rejects_same_user() {
        let a = user();
        assert_eq!(ParticipantPair::new(a, a), Err(DomainError::SelfConversation));
    }

    #[test]
    fn direct_conversation_keeps_initiator_order() {
        let (a, b) = (user(), user());
        let conversation =
            Conversation::new_direct(ConversationId::from(Uuid::new_v4()), b, a, None, None, Utc::now())
                .unwrap();
        assert_eq!(conversation.participant_a_id, b);
        assert_eq!(conversation.pair(), ParticipantPair::new(a, b).unwrap());
        assert_eq!(conversation.other_participant(a), Some(b));
        assert_eq!(conversation.other_participant(user()), None);
    }

    #[test]
    fn blank_title_becomes_none() {
        let conversation = Conversation::new_direct(
            ConversationId::from(Uuid::new_v4()),
            user(),
            user(),
            Some("   ".to_string()),
            Some(" Backend role ".to_string()),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(conversation.title, None);
        assert_eq!(conversation.description.as_deref(), Some("Backend role"));
    }

    #[test]
    fn room_requires_title() {
        let result = Conversation::new_room(
            ConversationId::from(Uuid::new_v4()),
            user(),
            user(),
            "  ",
            None,
            Utc::now(),
        );
        assert!(matches!(result, Err(DomainError::InvalidArgument { .. })));
    }

    #[test]
    fn touch_never_moves_backwards() {
        let now = Utc::now();
        let mut conversation = Conversation::new_direct(
            ConversationId::from(Uuid::new_v4()),
            user(),
            user(),
            None,
            None,
            now,
        )
        .unwrap();
        conversation.touch(now - Duration::seconds(5));
        assert_eq!(conversation.updated_at, now);
        conversation.touch(now + Duration::seconds(5));
        assert_eq!(conversation.updated_at, now + Duration::seconds(5));
    }
}
