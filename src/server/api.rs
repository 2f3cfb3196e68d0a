use crate::config::prompt::SystemPrompt;
use crate::error::ChatError;
use crate::exchange::MessageExchange;
use crate::hub::BroadcastHub;
use crate::llm::{ModelGateway, ModelInfo};
use crate::models::chat::SendMessageRequest;
use crate::store::ConversationStore;
use std::sync::Arc;
use axum::{
    routing::{delete, get, post, put},
    Router,
    Json,
    extract::{FromRequest, Path, Query, Request, State},
    response::{IntoResponse, Response},
    http::{HeaderMap, StatusCode},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use log::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub gateway: Arc<dyn ModelGateway>,
    pub exchange: Arc<MessageExchange>,
    pub hub: Arc<BroadcastHub>,
    pub system_prompt: SystemPrompt,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub title: String,
    pub user_id: i32,
}

#[derive(Deserialize)]
pub struct UpdateTitleRequest {
    pub title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub chat_id: Option<i32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetDefaultModelRequest {
    pub model_name: String,
}

#[derive(Deserialize)]
pub struct SystemPromptRequest {
    pub content: String,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ModelsResponse {
    models: Vec<ModelInfo>,
    current_model: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DefaultModelResponse {
    success: bool,
    current_model: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/chats", get(list_chats).post(create_chat))
        .route("/api/chats/{id}/title", put(update_chat_title))
        .route("/api/chats/{id}", delete(delete_chat))
        .route("/api/messages", get(list_messages).post(send_message))
        .route("/api/models", get(list_models))
        .route("/api/models/default", post(set_default_model))
        .route("/api/system-prompt", post(set_system_prompt))
        .route("/api/ws", get(super::push::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Caller identity as established upstream. Everything behind the router
/// trusts this header; requests without it are turned away.
fn authenticated_user(headers: &HeaderMap) -> Option<i32> {
    headers
        .get("x-user-id")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn unauthenticated() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody { message: "Not authenticated".to_string() }),
    ).into_response()
}

fn error_response(err: ChatError) -> Response {
    let (code, message) = match err {
        ChatError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
        ChatError::Unauthorized(msg) => (StatusCode::FORBIDDEN, msg),
        ChatError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
        ChatError::CannotDeleteDefault(name) => (
            StatusCode::BAD_REQUEST,
            format!("model '{}' is the current default and cannot be deleted", name),
        ),
        ChatError::Persistence(msg) => {
            error!("Persistence failure: {}", msg);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
        }
    };
    (code, Json(ErrorBody { message })).into_response()
}

/// `Json` wrapper that reports an unreadable body (broken syntax, a missing
/// field, the wrong content type) through the same 400 `message` shape as
/// every other validation failure.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(error_response(ChatError::Validation(rejection.body_text()))),
        }
    }
}

async fn list_chats(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    match state.store.get_chats_by_user(user_id).await {
        Ok(chats) => (StatusCode::OK, Json(chats)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<CreateChatRequest>
) -> impl IntoResponse {
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    if req.title.trim().is_empty() {
        return error_response(ChatError::Validation("chat title must not be empty".to_string()));
    }
    if req.user_id != user_id {
        return error_response(
            ChatError::Unauthorized("chat owner does not match the authenticated user".to_string())
        );
    }
    match state.store.create_chat(&req.title, user_id).await {
        Ok(chat) => (StatusCode::CREATED, Json(chat)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn update_chat_title(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i32>,
    ApiJson(req): ApiJson<UpdateTitleRequest>
) -> impl IntoResponse {
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    if req.title.trim().is_empty() {
        return error_response(ChatError::Validation("chat title must not be empty".to_string()));
    }
    match state.store.get_chat(id).await {
        Ok(Some(chat)) if chat.user_id != user_id => {
            error_response(ChatError::Unauthorized(format!("chat {} belongs to another user", id)))
        }
        Ok(Some(_)) =>
            match state.store.update_chat_title(id, &req.title).await {
                Ok(updated) => (StatusCode::OK, Json(updated)).into_response(),
                Err(e) => error_response(e),
            }
        Ok(None) => error_response(ChatError::NotFound(format!("chat {}", id))),
        Err(e) => error_response(e),
    }
}

async fn delete_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i32>
) -> impl IntoResponse {
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    match state.store.get_chat(id).await {
        Ok(Some(chat)) if chat.user_id != user_id => {
            error_response(ChatError::Unauthorized(format!("chat {} belongs to another user", id)))
        }
        // goes through the exchange so the delete waits out any in-flight turn
        Ok(Some(_)) =>
            match state.exchange.delete_chat(id).await {
                Ok(()) => StatusCode::NO_CONTENT.into_response(),
                Err(e) => error_response(e),
            }
        Ok(None) => error_response(ChatError::NotFound(format!("chat {}", id))),
        Err(e) => error_response(e),
    }
}

async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<MessagesQuery>
) -> impl IntoResponse {
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    match query.chat_id {
        Some(chat_id) =>
            match state.store.get_chat(chat_id).await {
                Ok(Some(chat)) if chat.user_id != user_id => {
                    error_response(
                        ChatError::Unauthorized(format!("chat {} belongs to another user", chat_id))
                    )
                }
                Ok(Some(_)) =>
                    match state.store.get_messages_by_chat(chat_id).await {
                        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
                        Err(e) => error_response(e),
                    }
                Ok(None) => error_response(ChatError::NotFound(format!("chat {}", chat_id))),
                Err(e) => error_response(e),
            }
        None =>
            match state.store.get_messages_by_user(user_id).await {
                Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
                Err(e) => error_response(e),
            }
    }
}

/// One full exchange per request. The reply is in the 201 body as well as on
/// the push channel, so clients without a live connection stay correct.
async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SendMessageRequest>
) -> impl IntoResponse {
    let Some(user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    match state.exchange.send_message(user_id, &req).await {
        Ok((user_message, assistant_message)) => {
            (StatusCode::CREATED, Json(vec![user_message, assistant_message])).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(_user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    let models = state.gateway.list_models().await;
    match state.exchange.current_model().await {
        Ok(current_model) => {
            (StatusCode::OK, Json(ModelsResponse { models, current_model })).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn set_default_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SetDefaultModelRequest>
) -> impl IntoResponse {
    let Some(_user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    let models = state.gateway.list_models().await;
    if !models.iter().any(|m| m.model_name == req.model_name) {
        return error_response(
            ChatError::Validation(format!("unknown model: {}", req.model_name))
        );
    }
    match state.store.set_default_model(&req.model_name).await {
        Ok(model) => {
            info!("Default model switched to '{}'", model.name);
            (
                StatusCode::OK,
                Json(DefaultModelResponse { success: true, current_model: model.name }),
            ).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn set_system_prompt(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SystemPromptRequest>
) -> impl IntoResponse {
    let Some(_user_id) = authenticated_user(&headers) else {
        return unauthenticated();
    };
    if req.content.trim().is_empty() {
        return error_response(
            ChatError::Validation("system prompt must not be empty".to_string())
        );
    }
    state.system_prompt.set(req.content).await;
    info!("System prompt replaced");
    (StatusCode::OK, Json(SuccessResponse { success: true })).into_response()
}
