use serde::{ Serialize, Deserialize };

use super::chat::Message;

/// Event pushed to every live connection. The `type` tag is what reconnecting
/// clients dispatch on, so renaming a variant is a wire format change.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "new_message")] NewMessage {
        data: Message,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn new_message_event_wire_shape() {
        let event = ServerEvent::NewMessage {
            data: Message {
                id: 7,
                content: "承知しました。".to_string(),
                role: "assistant".to_string(),
                user_id: 3,
                chat_id: Some(12),
                timestamp: Utc.with_ymd_and_hms(2025, 4, 1, 9, 30, 0).unwrap(),
            },
        };

        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "new_message");
        assert_eq!(json["data"]["userId"], 3);
        assert_eq!(json["data"]["chatId"], 12);
        assert_eq!(json["data"]["role"], "assistant");
    }

    #[test]
    fn unchatted_message_serializes_null_chat_id() {
        let event = ServerEvent::NewMessage {
            data: Message {
                id: 1,
                content: "hello".to_string(),
                role: "user".to_string(),
                user_id: 1,
                chat_id: None,
                timestamp: Utc::now(),
            },
        };

        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert!(json["data"]["chatId"].is_null());
    }
}
