use async_trait::async_trait;
use log::warn;
use once_cell::sync::Lazy;
use reqwest::Client as HttpClient;
use serde::{ Serialize, Deserialize };
use std::time::Duration;

use super::{ChatTurn, GatewayError, ModelGateway, ModelInfo};

/// Served when the runtime's tag listing cannot be reached or parsed, so the
/// model picker stays usable while the runtime is down.
static FALLBACK_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        ModelInfo {
            id: 1,
            model_name: "llama3:latest".to_string(),
            display_name: "Llama 3 8B".to_string(),
            size: None,
            modified_at: None,
        },
        ModelInfo {
            id: 2,
            model_name: "deepseek-coder:6.7b".to_string(),
            display_name: "DeepSeek Coder 6.7B".to_string(),
            size: None,
            modified_at: None,
        },
        ModelInfo {
            id: 3,
            model_name: "deepseek-r1:7b".to_string(),
            display_name: "DeepSeek R1 7B".to_string(),
            size: None,
            modified_at: None,
        },
        ModelInfo {
            id: 4,
            model_name: "deepscaler:latest".to_string(),
            display_name: "DeepScaler".to_string(),
            size: None,
            modified_at: None,
        }
    ]
});

pub struct OllamaGateway {
    http: HttpClient,
    base_url: String,
}

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct ChatResponse {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Deserialize, Debug)]
struct TagEntry {
    name: String,
    size: Option<i64>,
    modified_at: Option<String>,
}

impl OllamaGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The system instruction always rides as the first entry; an empty
    /// instruction is left out entirely.
    fn build_messages(system_prompt: &str, history: &[ChatTurn]) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(ChatTurn {
                role: "system".to_string(),
                content: system_prompt.to_string(),
            });
        }
        messages.extend_from_slice(history);
        messages
    }
}

#[async_trait]
impl ModelGateway for OllamaGateway {
    async fn generate_reply(
        &self,
        history: &[ChatTurn],
        model: &str,
        system_prompt: &str
    ) -> Result<String, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model,
            messages: Self::build_messages(system_prompt, history),
            stream: false,
        };

        let response = self.http
            .post(&url)
            .json(&request)
            .send().await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::UpstreamStatus(status.as_u16()));
        }

        let body = response
            .json::<ChatResponse>().await
            .map_err(|e| GatewayError::Format(e.to_string()))?;
        match body.message {
            Some(message) if !message.content.is_empty() => Ok(message.content),
            _ => Err(GatewayError::Format("response is missing message content".to_string())),
        }
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        let url = format!("{}/api/tags", self.base_url);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Model catalog unavailable ({}). Serving the fallback list.", e);
                return FALLBACK_MODELS.clone();
            }
        };

        if !response.status().is_success() {
            warn!(
                "Model catalog request returned status {}. Serving the fallback list.",
                response.status()
            );
            return FALLBACK_MODELS.clone();
        }

        let tags = match response.json::<TagsResponse>().await {
            Ok(tags) => tags,
            Err(e) => {
                warn!("Malformed model catalog response ({}). Serving the fallback list.", e);
                return FALLBACK_MODELS.clone();
            }
        };

        if tags.models.is_empty() {
            return FALLBACK_MODELS.clone();
        }

        tags.models
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| ModelInfo {
                id: (idx as i32) + 1,
                display_name: entry.name.clone(),
                model_name: entry.name,
                size: entry.size,
                modified_at: entry.modified_at,
            })
            .collect()
    }
}
