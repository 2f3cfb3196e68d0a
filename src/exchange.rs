use std::collections::HashMap;
use std::sync::Arc;

use chrono::Local;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::config::prompt::SystemPrompt;
use crate::error::ChatError;
use crate::hub::BroadcastHub;
use crate::llm::{ChatTurn, GatewayError, ModelGateway};
use crate::models::chat::{Chat, Message, SendMessageRequest};
use crate::models::websocket::ServerEvent;
use crate::store::{validate_new_message, ConversationStore};

/// Canned replies persisted in place of a completion when the model runtime
/// lets us down. The conversation stays intact and the client sees a normal
/// assistant turn.
pub const APOLOGY_UNREACHABLE: &str =
    "申し訳ありませんが、LLMサービスに接続できません。後でもう一度お試しください。";
pub const APOLOGY_UPSTREAM: &str =
    "申し訳ありませんが、LLMサービスでエラーが発生しました。後でもう一度お試しください。";
pub const APOLOGY_GENERIC: &str =
    "申し訳ありませんが、エラーが発生しました。後でもう一度お試しください。";

/// A chat still counts as fresh while it holds at most this many messages
/// after the reply lands, which is exactly the first exchange.
const AUTO_TITLE_MESSAGE_COUNT: usize = 2;
const AUTO_TITLE_CONTENT_CHARS: usize = 30;

/// Orchestrates one user turn: resolve the chat, persist the user message,
/// generate the reply against the full history, persist it, and push it to
/// every live connection.
pub struct MessageExchange {
    store: Arc<dyn ConversationStore>,
    gateway: Arc<dyn ModelGateway>,
    hub: Arc<BroadcastHub>,
    system_prompt: SystemPrompt,
    fallback_model: String,
    chat_locks: Mutex<HashMap<i32, Arc<Mutex<()>>>>,
}

impl MessageExchange {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        gateway: Arc<dyn ModelGateway>,
        hub: Arc<BroadcastHub>,
        system_prompt: SystemPrompt,
        fallback_model: String
    ) -> Self {
        Self {
            store,
            gateway,
            hub,
            system_prompt,
            fallback_model,
            chat_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Model used when the request does not name one: the stored default,
    /// read fresh on every call so an admin change applies to the next
    /// message, else the configured fallback.
    pub async fn current_model(&self) -> Result<String, ChatError> {
        Ok(
            self.store
                .get_default_model().await?
                .map(|m| m.name)
                .unwrap_or_else(|| self.fallback_model.clone())
        )
    }

    async fn chat_lock(&self, chat_id: i32) -> Arc<Mutex<()>> {
        let mut locks = self.chat_locks.lock().await;
        locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn placeholder_title() -> String {
        format!("新しいチャット {}", Local::now().format("%Y/%m/%d %H:%M"))
    }

    fn derive_title(content: &str, model: &str) -> String {
        let prefix: String = content.chars().take(AUTO_TITLE_CONTENT_CHARS).collect();
        if content.chars().count() > AUTO_TITLE_CONTENT_CHARS {
            format!("{}... ({})", prefix, model)
        } else {
            format!("{} ({})", prefix, model)
        }
    }

    fn apology_for(err: &GatewayError) -> &'static str {
        match err {
            GatewayError::Unreachable(_) => APOLOGY_UNREACHABLE,
            GatewayError::UpstreamStatus(_) => APOLOGY_UPSTREAM,
            GatewayError::Format(_) => APOLOGY_GENERIC,
        }
    }

    async fn resolve_chat(
        &self,
        caller_id: i32,
        req: &SendMessageRequest
    ) -> Result<Chat, ChatError> {
        match req.chat_id {
            Some(chat_id) => {
                let chat = self.store
                    .get_chat(chat_id).await?
                    .ok_or_else(|| ChatError::NotFound(format!("chat {}", chat_id)))?;
                if chat.user_id != caller_id {
                    return Err(
                        ChatError::Unauthorized(
                            format!("chat {} belongs to another user", chat_id)
                        )
                    );
                }
                Ok(chat)
            }
            None => {
                let chat = self.store.create_chat(&Self::placeholder_title(), caller_id).await?;
                info!("Created chat {} for user {}", chat.id, caller_id);
                Ok(chat)
            }
        }
    }

    /// Runs the full exchange and returns the persisted (user, assistant)
    /// pair. A runtime failure is absorbed into an apology turn, so a
    /// successful return does not imply the model answered.
    pub async fn send_message(
        &self,
        caller_id: i32,
        req: &SendMessageRequest
    ) -> Result<(Message, Message), ChatError> {
        if req.role != "user" {
            return Err(
                ChatError::Validation(
                    format!("only 'user' messages can be sent, got '{}'", req.role)
                )
            );
        }
        if req.user_id != caller_id {
            return Err(
                ChatError::Unauthorized(
                    "message owner does not match the authenticated user".to_string()
                )
            );
        }
        // validated before chat resolution so a bad payload never creates an
        // implicit chat
        validate_new_message(&req.content, &req.role)?;

        let chat = self.resolve_chat(caller_id, req).await?;

        // one exchange per chat at a time; held until the reply is persisted
        let lock = self.chat_lock(chat.id).await;
        let _serialized = lock.lock().await;

        // the chat may have been deleted while we waited for the lock
        if self.store.get_chat(chat.id).await?.is_none() {
            return Err(ChatError::NotFound(format!("chat {}", chat.id)));
        }

        let user_message = self.store.create_message(
            &req.content,
            "user",
            caller_id,
            Some(chat.id)
        ).await?;

        let history = self.store.get_messages_by_chat(chat.id).await?;
        let turns: Vec<ChatTurn> = history
            .iter()
            .map(|m| ChatTurn { role: m.role.clone(), content: m.content.clone() })
            .collect();

        let model = match &req.model {
            Some(model) if !model.trim().is_empty() => model.clone(),
            _ => self.current_model().await?,
        };
        let system_prompt = self.system_prompt.get().await;

        let reply = match self.gateway.generate_reply(&turns, &model, &system_prompt).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Reply generation failed for chat {}: {}", chat.id, e);
                Self::apology_for(&e).to_string()
            }
        };

        let assistant_message = self.store.create_message(
            &reply,
            "assistant",
            caller_id,
            Some(chat.id)
        ).await?;

        if history.len() + 1 <= AUTO_TITLE_MESSAGE_COUNT {
            let title = Self::derive_title(&req.content, &model);
            self.store.update_chat_title(chat.id, &title).await?;
        }

        self.hub.publish(
            &(ServerEvent::NewMessage {
                data: assistant_message.clone(),
            })
        ).await;

        Ok((user_message, assistant_message))
    }

    /// Removes a chat inside its exchange window, so an in-flight turn can
    /// never persist into a chat that no longer exists. Ownership checks
    /// stay with the caller, as for every other chat operation.
    pub async fn delete_chat(&self, chat_id: i32) -> Result<(), ChatError> {
        let lock = self.chat_lock(chat_id).await;
        let _serialized = lock.lock().await;
        self.store.delete_chat(chat_id).await?;
        // only drop the entry once the chat is really gone; later sends
        // will 404 before they ever mint a fresh lock
        self.chat_locks.lock().await.remove(&chat_id);
        Ok(())
    }
}
