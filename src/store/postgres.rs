use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use log::info;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};

use crate::error::ChatError;
use crate::models::chat::{Chat, Message, ModelSetting, User};
use super::{validate_new_message, ConversationStore};

const SCHEMA_BOOTSTRAP: &str = "
CREATE TABLE IF NOT EXISTS users (
    id SERIAL PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chats (
    id SERIAL PRIMARY KEY,
    title TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS messages (
    id SERIAL PRIMARY KEY,
    content TEXT NOT NULL,
    role TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    chat_id INTEGER,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS model_settings (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    is_default BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages (chat_id);
CREATE INDEX IF NOT EXISTS idx_messages_user_id ON messages (user_id);
CREATE INDEX IF NOT EXISTS idx_chats_user_id ON chats (user_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_model_settings_default
    ON model_settings (is_default) WHERE is_default;
";

/// Postgres-backed store. Connections come from a deadpool pool sized by
/// `--db-pool-size`; the schema is created on startup if missing.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self, ChatError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| {
                ChatError::Persistence(format!("invalid database url: {}", e))
            })?;

        let manager = Manager::from_config(pg_config, NoTls, ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = Pool::builder(manager).max_size(pool_size).runtime(Runtime::Tokio1).build()?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ChatError> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA_BOOTSTRAP).await?;
        info!("Conversation schema is ready");
        Ok(())
    }
}

fn user_from_row(row: &Row) -> User {
    User {
        id: row.get("id"),
        username: row.get("username"),
        password: row.get("password"),
    }
}

fn chat_from_row(row: &Row) -> Chat {
    Chat {
        id: row.get("id"),
        title: row.get("title"),
        user_id: row.get("user_id"),
        created_at: row.get("created_at"),
    }
}

fn message_from_row(row: &Row) -> Message {
    Message {
        id: row.get("id"),
        content: row.get("content"),
        role: row.get("role"),
        user_id: row.get("user_id"),
        chat_id: row.get("chat_id"),
        timestamp: row.get("timestamp"),
    }
}

fn model_from_row(row: &Row) -> ModelSetting {
    ModelSetting {
        id: row.get("id"),
        name: row.get("name"),
        is_default: row.get("is_default"),
    }
}

#[async_trait]
impl ConversationStore for PostgresStore {
    async fn create_user(&self, username: &str, password: &str) -> Result<User, ChatError> {
        let conn = self.pool.get().await?;
        let result = conn.query_one(
            "INSERT INTO users (username, password) VALUES ($1, $2)
             RETURNING id, username, password",
            &[&username, &password]
        ).await;
        match result {
            Ok(row) => Ok(user_from_row(&row)),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(ChatError::Validation(format!("username '{}' is already taken", username)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user(&self, id: i32) -> Result<Option<User>, ChatError> {
        let conn = self.pool.get().await?;
        let row = conn.query_opt(
            "SELECT id, username, password FROM users WHERE id = $1",
            &[&id]
        ).await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, ChatError> {
        let conn = self.pool.get().await?;
        let row = conn.query_opt(
            "SELECT id, username, password FROM users WHERE username = $1",
            &[&username]
        ).await?;
        Ok(row.map(|r| user_from_row(&r)))
    }

    async fn create_chat(&self, title: &str, user_id: i32) -> Result<Chat, ChatError> {
        let conn = self.pool.get().await?;
        let row = conn.query_one(
            "INSERT INTO chats (title, user_id) VALUES ($1, $2)
             RETURNING id, title, user_id, created_at",
            &[&title, &user_id]
        ).await?;
        Ok(chat_from_row(&row))
    }

    async fn get_chat(&self, id: i32) -> Result<Option<Chat>, ChatError> {
        let conn = self.pool.get().await?;
        let row = conn.query_opt(
            "SELECT id, title, user_id, created_at FROM chats WHERE id = $1",
            &[&id]
        ).await?;
        Ok(row.map(|r| chat_from_row(&r)))
    }

    async fn get_chats_by_user(&self, user_id: i32) -> Result<Vec<Chat>, ChatError> {
        let conn = self.pool.get().await?;
        let rows = conn.query(
            "SELECT id, title, user_id, created_at FROM chats
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC",
            &[&user_id]
        ).await?;
        Ok(
            rows.iter()
                .map(chat_from_row)
                .collect()
        )
    }

    async fn update_chat_title(&self, id: i32, title: &str) -> Result<Chat, ChatError> {
        let conn = self.pool.get().await?;
        let row = conn.query_opt(
            "UPDATE chats SET title = $2 WHERE id = $1
             RETURNING id, title, user_id, created_at",
            &[&id, &title]
        ).await?;
        row.map(|r| chat_from_row(&r)).ok_or_else(|| ChatError::NotFound(format!("chat {}", id)))
    }

    async fn delete_chat(&self, id: i32) -> Result<(), ChatError> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        tx.execute("DELETE FROM messages WHERE chat_id = $1", &[&id]).await?;
        let deleted = tx.execute("DELETE FROM chats WHERE id = $1", &[&id]).await?;
        if deleted == 0 {
            // dropping the transaction rolls the message delete back
            return Err(ChatError::NotFound(format!("chat {}", id)));
        }
        tx.commit().await?;
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
        let conn = self.pool.get().await?;
        let row = conn.query_one(
            "INSERT INTO messages (content, role, user_id, chat_id) VALUES ($1, $2, $3, $4)
             RETURNING id, content, role, user_id, chat_id, timestamp",
            &[&content, &role, &user_id, &chat_id]
        ).await?;
        Ok(message_from_row(&row))
    }

    async fn get_messages_by_chat(&self, chat_id: i32) -> Result<Vec<Message>, ChatError> {
        let conn = self.pool.get().await?;
        let rows = conn.query(
            "SELECT id, content, role, user_id, chat_id, timestamp FROM messages
             WHERE chat_id = $1
             ORDER BY timestamp ASC, id ASC",
            &[&chat_id]
        ).await?;
        Ok(
            rows.iter()
                .map(message_from_row)
                .collect()
        )
    }

    async fn get_messages_by_user(&self, user_id: i32) -> Result<Vec<Message>, ChatError> {
        let conn = self.pool.get().await?;
        let rows = conn.query(
            "SELECT id, content, role, user_id, chat_id, timestamp FROM messages
             WHERE user_id = $1
             ORDER BY timestamp ASC, id ASC",
            &[&user_id]
        ).await?;
        Ok(
            rows.iter()
                .map(message_from_row)
                .collect()
        )
    }

    async fn get_default_model(&self) -> Result<Option<ModelSetting>, ChatError> {
        let conn = self.pool.get().await?;
        let row = conn.query_opt(
            "SELECT id, name, is_default FROM model_settings WHERE is_default LIMIT 1",
            &[]
        ).await?;
        Ok(row.map(|r| model_from_row(&r)))
    }

    async fn set_default_model(&self, name: &str) -> Result<ModelSetting, ChatError> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        tx.execute("UPDATE model_settings SET is_default = FALSE WHERE is_default", &[]).await?;
        let row = tx.query_one(
            "INSERT INTO model_settings (name, is_default) VALUES ($1, TRUE)
             ON CONFLICT (name) DO UPDATE SET is_default = TRUE
             RETURNING id, name, is_default",
            &[&name]
        ).await?;
        tx.commit().await?;
        Ok(model_from_row(&row))
    }

    async fn add_model(&self, name: &str) -> Result<ModelSetting, ChatError> {
        let conn = self.pool.get().await?;
        let result = conn.query_one(
            "INSERT INTO model_settings (name, is_default) VALUES ($1, FALSE)
             RETURNING id, name, is_default",
            &[&name]
        ).await;
        match result {
            Ok(row) => Ok(model_from_row(&row)),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(ChatError::Validation(format!("model '{}' is already registered", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_model(&self, id: i32) -> Result<(), ChatError> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;
        // the row lock keeps a concurrent promotion from slipping in between
        // the default check and the delete
        let row = tx.query_opt(
            "SELECT id, name, is_default FROM model_settings WHERE id = $1 FOR UPDATE",
            &[&id]
        ).await?;
        let model = row
            .map(|r| model_from_row(&r))
            .ok_or_else(|| ChatError::NotFound(format!("model {}", id)))?;
        if model.is_default {
            return Err(ChatError::CannotDeleteDefault(model.name));
        }
        tx.execute("DELETE FROM model_settings WHERE id = $1", &[&id]).await?;
        tx.commit().await?;
        Ok(())
    }
}
