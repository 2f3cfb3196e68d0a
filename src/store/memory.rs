use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::ChatError;
use crate::models::chat::{Chat, Message, ModelSetting, User};
use super::{validate_new_message, ConversationStore};

#[derive(Default)]
struct Inner {
    users: HashMap<i32, User>,
    chats: HashMap<i32, Chat>,
    messages: HashMap<i32, Message>,
    models: HashMap<i32, ModelSetting>,
    next_user_id: i32,
    next_chat_id: i32,
    next_message_id: i32,
    next_model_id: i32,
}

/// Process-local store for tests and single-node deployments without a
/// database. Same contract as the Postgres backend, nothing survives a
/// restart.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_user(&self, username: &str, password: &str) -> Result<User, ChatError> {
        let mut inner = self.inner.lock().await;
        if inner.users.values().any(|u| u.username == username) {
            return Err(ChatError::Validation(format!("username '{}' is already taken", username)));
        }
        inner.next_user_id += 1;
        let user = User {
            id: inner.next_user_id,
            username: username.to_string(),
            password: password.to_string(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: i32) -> Result<Option<User>, ChatError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, ChatError> {
        let inner = self.inner.lock().await;
        Ok(
            inner.users
                .values()
                .find(|u| u.username == username)
                .cloned()
        )
    }

    async fn create_chat(&self, title: &str, user_id: i32) -> Result<Chat, ChatError> {
        let mut inner = self.inner.lock().await;
        inner.next_chat_id += 1;
        let chat = Chat {
            id: inner.next_chat_id,
            title: title.to_string(),
            user_id,
            created_at: Utc::now(),
        };
        inner.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_chat(&self, id: i32) -> Result<Option<Chat>, ChatError> {
        Ok(self.inner.lock().await.chats.get(&id).cloned())
    }

    async fn get_chats_by_user(&self, user_id: i32) -> Result<Vec<Chat>, ChatError> {
        let inner = self.inner.lock().await;
        let mut chats: Vec<Chat> = inner.chats
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(chats)
    }

    async fn update_chat_title(&self, id: i32, title: &str) -> Result<Chat, ChatError> {
        let mut inner = self.inner.lock().await;
        let chat = inner.chats
            .get_mut(&id)
            .ok_or_else(|| ChatError::NotFound(format!("chat {}", id)))?;
        chat.title = title.to_string();
        Ok(chat.clone())
    }

    async fn delete_chat(&self, id: i32) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        if inner.chats.remove(&id).is_none() {
            return Err(ChatError::NotFound(format!("chat {}", id)));
        }
        inner.messages.retain(|_, m| m.chat_id != Some(id));
        Ok(())
    }

    async fn create_message(
        &self,
        content: &str,
        role: &str,
        user_id: i32,
        chat_id: Option<i32>
    ) -> Result<Message, ChatError> {
        validate_new_message(content, role)?;
        let mut inner = self.inner.lock().await;
        inner.next_message_id += 1;
        let message = Message {
            id: inner.next_message_id,
            content: content.to_string(),
            role: role.to_string(),
            user_id,
            chat_id,
            timestamp: Utc::now(),
        };
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get_messages_by_chat(&self, chat_id: i32) -> Result<Vec<Message>, ChatError> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<Message> = inner.messages
            .values()
            .filter(|m| m.chat_id == Some(chat_id))
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn get_messages_by_user(&self, user_id: i32) -> Result<Vec<Message>, ChatError> {
        let inner = self.inner.lock().await;
        let mut messages: Vec<Message> = inner.messages
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn get_default_model(&self) -> Result<Option<ModelSetting>, ChatError> {
        let inner = self.inner.lock().await;
        Ok(
            inner.models
                .values()
                .find(|m| m.is_default)
                .cloned()
        )
    }

    async fn set_default_model(&self, name: &str) -> Result<ModelSetting, ChatError> {
        let mut inner = self.inner.lock().await;
        for model in inner.models.values_mut() {
            model.is_default = false;
        }
        if let Some(existing) = inner.models.values_mut().find(|m| m.name == name) {
            existing.is_default = true;
            return Ok(existing.clone());
        }
        inner.next_model_id += 1;
        let model = ModelSetting {
            id: inner.next_model_id,
            name: name.to_string(),
            is_default: true,
        };
        inner.models.insert(model.id, model.clone());
        Ok(model)
    }

    async fn add_model(&self, name: &str) -> Result<ModelSetting, ChatError> {
        let mut inner = self.inner.lock().await;
        if inner.models.values().any(|m| m.name == name) {
            return Err(ChatError::Validation(format!("model '{}' is already registered", name)));
        }
        inner.next_model_id += 1;
        let model = ModelSetting {
            id: inner.next_model_id,
            name: name.to_string(),
            is_default: false,
        };
        inner.models.insert(model.id, model.clone());
        Ok(model)
    }

    async fn delete_model(&self, id: i32) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        let model = inner.models
            .get(&id)
            .ok_or_else(|| ChatError::NotFound(format!("model {}", id)))?;
        if model.is_default {
            return Err(ChatError::CannotDeleteDefault(model.name.clone()));
        }
        inner.models.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_come_back_in_conversation_order() {
        let store = MemoryStore::new();
        let chat = store.create_chat("test", 1).await.unwrap();

        store.create_message("first", "user", 1, Some(chat.id)).await.unwrap();
        store.create_message("second", "assistant", 1, Some(chat.id)).await.unwrap();
        store.create_message("third", "user", 1, Some(chat.id)).await.unwrap();
        store.create_message("elsewhere", "user", 1, None).await.unwrap();

        let messages = store.get_messages_by_chat(chat.id).await.unwrap();
        let contents: Vec<&str> = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn rejects_empty_content_and_unknown_roles() {
        let store = MemoryStore::new();

        let empty = store.create_message("   ", "user", 1, None).await;
        assert!(matches!(empty, Err(ChatError::Validation(_))));

        let bad_role = store.create_message("hello", "system", 1, None).await;
        assert!(matches!(bad_role, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn deleting_a_chat_removes_its_messages_only() {
        let store = MemoryStore::new();
        let doomed = store.create_chat("doomed", 1).await.unwrap();
        let kept = store.create_chat("kept", 1).await.unwrap();

        store.create_message("bye", "user", 1, Some(doomed.id)).await.unwrap();
        store.create_message("stay", "user", 1, Some(kept.id)).await.unwrap();
        store.create_message("loose", "user", 1, None).await.unwrap();

        store.delete_chat(doomed.id).await.unwrap();

        assert!(store.get_chat(doomed.id).await.unwrap().is_none());
        assert!(store.get_messages_by_chat(doomed.id).await.unwrap().is_empty());
        assert_eq!(store.get_messages_by_chat(kept.id).await.unwrap().len(), 1);
        assert_eq!(store.get_messages_by_user(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deleting_a_missing_chat_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.delete_chat(99).await, Err(ChatError::NotFound(_))));
        assert!(matches!(store.update_chat_title(99, "t").await, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn renaming_to_the_same_title_changes_nothing() {
        let store = MemoryStore::new();
        let chat = store.create_chat("初診メモ", 1).await.unwrap();

        let once = store.update_chat_title(chat.id, "再診メモ").await.unwrap();
        let twice = store.update_chat_title(chat.id, "再診メモ").await.unwrap();

        assert_eq!(once.title, twice.title);
        assert_eq!(once.created_at, twice.created_at);
        assert_eq!(store.get_chats_by_user(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn chats_are_listed_newest_first_per_user() {
        let store = MemoryStore::new();
        let older = store.create_chat("older", 1).await.unwrap();
        let newer = store.create_chat("newer", 1).await.unwrap();
        store.create_chat("other user", 2).await.unwrap();

        let chats = store.get_chats_by_user(1).await.unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].id, newer.id);
        assert_eq!(chats[1].id, older.id);
    }

    #[tokio::test]
    async fn at_most_one_default_model() {
        let store = MemoryStore::new();
        store.set_default_model("llama3:latest").await.unwrap();
        store.set_default_model("deepseek-r1:7b").await.unwrap();

        let default = store.get_default_model().await.unwrap().unwrap();
        assert_eq!(default.name, "deepseek-r1:7b");

        let inner = store.inner.lock().await;
        let flagged = inner.models
            .values()
            .filter(|m| m.is_default)
            .count();
        assert_eq!(flagged, 1);
    }

    #[tokio::test]
    async fn default_model_cannot_be_deleted() {
        let store = MemoryStore::new();
        let default = store.set_default_model("llama3:latest").await.unwrap();
        let extra = store.add_model("deepscaler:latest").await.unwrap();

        assert!(
            matches!(store.delete_model(default.id).await, Err(ChatError::CannotDeleteDefault(_)))
        );
        store.delete_model(extra.id).await.unwrap();
        assert!(matches!(store.delete_model(extra.id).await, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = MemoryStore::new();
        store.create_user("tanaka", "pw").await.unwrap();
        assert!(matches!(store.create_user("tanaka", "pw2").await, Err(ChatError::Validation(_))));

        store.add_model("llama3:latest").await.unwrap();
        assert!(
            matches!(store.add_model("llama3:latest").await, Err(ChatError::Validation(_)))
        );
    }

    #[tokio::test]
    async fn users_are_found_by_id_and_username() {
        let store = MemoryStore::new();
        let created = store.create_user("suzuki", "pw").await.unwrap();

        let by_id = store.get_user(created.id).await.unwrap().unwrap();
        assert_eq!(by_id.username, "suzuki");

        let by_name = store.get_user_by_username("suzuki").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        assert!(store.get_user_by_username("sato").await.unwrap().is_none());
    }
}
