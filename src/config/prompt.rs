use std::sync::Arc;
use tokio::sync::RwLock;

/// Instruction applied when no override is configured. Pins the assistant to
/// Japanese clinic desk work and tells it to admit uncertainty.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "あなたは医療現場のパソコン業務を支援する日本語AIアシスタントです。常に日本語で回答してください。信頼性の低いものやわからないものは「よくわかりません」と回答してください。";

/// System instruction used for every completion call. Owned explicitly and
/// handed to the exchange so a replacement takes effect on the next call
/// without touching process-global state.
#[derive(Clone)]
pub struct SystemPrompt {
    inner: Arc<RwLock<String>>,
}

impl SystemPrompt {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial.into())),
        }
    }

    pub async fn get(&self) -> String {
        self.inner.read().await.clone()
    }

    /// Replaces the instruction wholesale. Calls already in flight keep the
    /// text they read.
    pub async fn set(&self, content: String) {
        *self.inner.write().await = content;
    }
}
