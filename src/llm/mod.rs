pub mod ollama;

use async_trait::async_trait;
use serde::{ Serialize, Deserialize };
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::Args;

/// One turn handed to the model runtime. Also the wire shape of an entry in
/// the completion request's message list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Catalog entry exposed by the models endpoint. `size` and `modified_at`
/// are only known when the runtime answered; fallback entries omit them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: i32,
    pub model_name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

#[derive(Debug)]
pub enum GatewayError {
    Unreachable(String),
    UpstreamStatus(u16),
    Format(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Unreachable(msg) => write!(f, "model runtime unreachable: {}", msg),
            GatewayError::UpstreamStatus(code) => {
                write!(f, "model runtime returned status {}", code)
            }
            GatewayError::Format(msg) => write!(f, "unexpected model runtime response: {}", msg),
        }
    }
}

impl Error for GatewayError {}

/// Boundary to the completion backend. The exchange only depends on this
/// trait, so tests swap in a scripted stub.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Produces one assistant reply for the full chat history. The system
    /// prompt is threaded through on every call rather than read from shared
    /// state.
    async fn generate_reply(
        &self,
        history: &[ChatTurn],
        model: &str,
        system_prompt: &str
    ) -> Result<String, GatewayError>;

    /// Models the runtime can serve, or a static fallback catalog when the
    /// runtime cannot be asked.
    async fn list_models(&self) -> Vec<ModelInfo>;
}

pub fn new_gateway(args: &Args) -> Result<Arc<dyn ModelGateway>, Box<dyn Error + Send + Sync>> {
    let gateway = ollama::OllamaGateway::new(
        &args.ollama_base_url,
        Duration::from_secs(args.llm_timeout_secs)
    )?;
    Ok(Arc::new(gateway))
}
