use chrono::{DateTime, Utc};
use serde::{ Serialize, Deserialize };

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i32,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: i32,
    pub title: String,
    pub user_id: i32,
    pub created_at: DateTime<Utc>,
}

/// One persisted conversation turn. `role` is either "user" or "assistant";
/// `chat_id` is None for messages kept outside any chat.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i32,
    pub content: String,
    pub role: String,
    pub user_id: i32,
    pub chat_id: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSetting {
    pub id: i32,
    pub name: String,
    pub is_default: bool,
}

/// Inbound payload for the message exchange. `chat_id` may be omitted to
/// start a fresh chat; `model` may be omitted to use the stored default.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    pub role: String,
    pub user_id: i32,
    #[serde(default)]
    pub chat_id: Option<i32>,
    #[serde(default)]
    pub model: Option<String>,
}
