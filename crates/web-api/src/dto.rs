use application::{ConversationSummary, ConversationView};
use domain::{ConversationId, DisplayProfile, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDto {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl From<DisplayProfile> for ParticipantDto {
    fn from(value: DisplayProfile) -> Self {
        Self {
            user_id: value.user_id,
            username: value.username,
            name: value.name,
            role: value.role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDto {
    pub id: ConversationId,
    pub participant_a: ParticipantDto,
    pub participant_b: ParticipantDto,
    pub is_direct_message: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    /// 仅会话列表返回
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_online: Option<bool>,
}

impl From<ConversationView> for ConversationDto {
    fn from(value: ConversationView) -> Self {
        let conversation = value.conversation;
        Self {
            id: conversation.id,
            participant_a: value.participant_a.into(),
            participant_b: value.participant_b.into(),
            is_direct_message: conversation.is_direct_message,
            title: conversation.title,
            description: conversation.description,
            created_at: conversation.created_at,
            updated_at: conversation.updated_at,
            unread_count: None,
            peer_online: None,
        }
    }
}

impl From<ConversationSummary> for ConversationDto {
    fn from(value: ConversationSummary) -> Self {
        Self {
            unread_count: Some(value.unread_count),
            peer_online: Some(value.peer_online),
            ..Self::from(value.view)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationPayload {
    pub participant_id: UserId,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenRoomPayload {
    pub participant_id: UserId,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}
