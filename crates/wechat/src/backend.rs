//! HTTP implementation of the backend AI seam.

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::debug,
};

use wegate_common::{AiBackend, ChatReply, Error, Result};

/// Blocking-mode chat client for an AI application endpoint.
///
/// Posts `{query, inputs, conversation_id?, response_mode}` and reads
/// `{answer, conversation_id}` back. Latency is unbounded by design; the
/// coordinator owns all timeout behavior.
pub struct HttpBackend {
    endpoint: String,
    api_key: Option<Secret<String>>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct BackendResponse {
    #[serde(default)]
    answer: String,
    conversation_id: Option<String>,
}

impl HttpBackend {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: Option<Secret<String>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AiBackend for HttpBackend {
    async fn chat(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        inputs: Value,
    ) -> Result<ChatReply> {
        let mut payload = json!({
            "query": query,
            "inputs": inputs,
            "response_mode": "blocking",
        });
        if let Some(id) = conversation_id {
            payload["conversation_id"] = json!(id);
        }

        let mut request = self.http.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::external("backend request", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::message(format!("backend returned {status}: {body}")));
        }

        let body: BackendResponse = response
            .json()
            .await
            .map_err(|e| Error::external("backend response", e))?;
        debug!(
            answer_len = body.answer.len(),
            new_conversation = body.conversation_id.is_some(),
            "backend replied"
        );
        Ok(ChatReply {
            answer: body.answer,
            conversation_id: body.conversation_id,
        })
    }
}
