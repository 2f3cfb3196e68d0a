pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use log::info;
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::models::chat::{Chat, Message, ModelSetting, User};

/// Persistence seam for users, chats, messages and model settings. Business
/// logic only ever talks to this trait; which backend sits behind it is a
/// deployment decision.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_user(&self, username: &str, password: &str) -> Result<User, ChatError>;
    async fn get_user(&self, id: i32) -> Result<Option<User>, ChatError>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, ChatError>;

    async fn create_chat(&self, title: &str, user_id: i32) -> Result<Chat, ChatError>;
    async fn get_chat(&self, id: i32) -> Result<Option<Chat>, ChatError>;
    /// Chats for one user, newest first.
    async fn get_chats_by_user(&self, user_id: i32) -> Result<Vec<Chat>, ChatError>;
    async fn update_chat_title(&self, id: i32, title: &str) -> Result<Chat, ChatError>;
    /// Removes the chat and every message attached to it, atomically.
    async fn delete_chat(&self, id: i32) -> Result<(), ChatError>;

    async fn create_message(
        &self,
        content: &str,
        role: &str,
        user_id: i32,
        chat_id: Option<i32>
    ) -> Result<Message, ChatError>;
    /// Messages of one chat in conversation order (timestamp, then id).
    async fn get_messages_by_chat(&self, chat_id: i32) -> Result<Vec<Message>, ChatError>;
    async fn get_messages_by_user(&self, user_id: i32) -> Result<Vec<Message>, ChatError>;

    async fn get_default_model(&self) -> Result<Option<ModelSetting>, ChatError>;
    /// Marks `name` as the default, registering it first if unknown. At most
    /// one model holds the flag afterwards.
    async fn set_default_model(&self, name: &str) -> Result<ModelSetting, ChatError>;
    async fn add_model(&self, name: &str) -> Result<ModelSetting, ChatError>;
    async fn delete_model(&self, id: i32) -> Result<(), ChatError>;
}

pub(crate) fn validate_new_message(content: &str, role: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::Validation("message content must not be empty".to_string()));
    }
    if role != "user" && role != "assistant" {
        return Err(ChatError::Validation(format!("invalid message role: '{}'", role)));
    }
    Ok(())
}

pub async fn create_conversation_store(
    args: &Args
) -> Result<Arc<dyn ConversationStore>, Box<dyn Error + Send + Sync>> {
    match args.storage_type.to_lowercase().as_str() {
        "postgres" => {
            let url = args.database_url
                .as_deref()
                .ok_or("DATABASE_URL is required when the storage type is 'postgres'")?;
            let store = postgres::PostgresStore::connect(url, args.db_pool_size).await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported conversation store type: {}", args.storage_type)
                    )
                )
            ),
    }
}

pub async fn initialize_conversation_store(
    args: &Args
) -> Result<Arc<dyn ConversationStore>, Box<dyn Error + Send + Sync>> {
    info!("Conversations will be stored in: {}", args.storage_type);
    create_conversation_store(args).await
}
