//! 客户端上行事件

use domain::ConversationId;
use serde::{Deserialize, Serialize};

/// 客户端发来的 JSON 文本帧，按 `event` 字段区分
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// 握手时没有携带凭证，第一条事件必须是它
    Authenticate {
        token: String,
    },
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        text: String,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn parses_send_message() {
        let id = Uuid::new_v4();
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "sendMessage",
            "data": { "conversationId": id, "text": "hello" }
        }))
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                conversation_id: ConversationId::from(id),
                text: "hello".to_string(),
            }
        );
    }

    #[test]
    fn parses_ping_without_data() {
        let event: ClientEvent = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(event, ClientEvent::Ping);
    }

    #[test]
    fn rejects_unknown_event() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"deleteMessage","data":{}}"#).is_err());
    }
}
