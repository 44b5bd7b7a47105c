use async_trait::async_trait;

use crate::Result;

/// One reply from the AI application.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub answer: String,
    /// Conversation handle to reuse on the next turn, when the backend
    /// issued or rotated one.
    pub conversation_id: Option<String>,
}

/// The backend AI application.
///
/// Kept behind a seam so the retry coordinator can be exercised without a
/// network; response latency is unbounded and callers must budget their own
/// waits.
#[async_trait]
pub trait AiBackend: Send + Sync {
    async fn chat(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        inputs: serde_json::Value,
    ) -> Result<ChatReply>;
}
