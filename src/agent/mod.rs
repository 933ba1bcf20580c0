use async_trait::async_trait;
use futures_util::StreamExt;
use rig::agent::MultiTurnStreamItem;
use rig::client::Nothing;
use rig::completion::Prompt;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use rig::streaming::{StreamedAssistantContent, StreamingChat};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::errors::AppError;
use crate::models::{Message, MessageRole};

#[cfg(test)]
pub(crate) mod testing;

const PREAMBLE: &str = "You are AyuGPT, a polite and friendly expert in Ayurveda, health, \
                        wellness, nutrition, yoga and the human body. \
                        Politely decline topics unrelated to health and wellness. \
                        Reply in the language the user writes in, in clean Markdown, \
                        and remind the user that you are not a substitute for a doctor \
                        for serious conditions.";

/// The remote model, reduced to the three calls the chat engine needs.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Streams one assistant reply to `user_message`, replaying `history` as
    /// context. Fragments are sent on `tx` in arrival order.
    async fn stream_chat(
        &self,
        history: &[Message],
        user_message: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(), AppError>;

    /// One short, non-streamed completion.
    async fn complete(&self, prompt: &str) -> Result<String, AppError>;

    /// A completion constrained by a JSON schema describing an array of strings.
    async fn complete_list(
        &self,
        prompt: &str,
        schema: serde_json::Value,
    ) -> Result<Vec<String>, AppError>;
}

/// Builds a rig [`RigMessage`] history list from session [`Message`]s.
fn to_rig_history(messages: &[Message]) -> Vec<RigMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            MessageRole::User => RigMessage::user(&m.content),
            MessageRole::Assistant => RigMessage::assistant(&m.content),
        })
        .collect()
}

/// [`CompletionBackend`] backed by a rig [`ollama::Client`].
/// A fresh agent is built per request, so history is replayed each time.
#[derive(Clone)]
pub struct OllamaAgentService {
    client: ollama::Client,
    base_url: String,
    model: String,
}

impl OllamaAgentService {
    pub fn new(base_url: &str, model: &str) -> Result<Self, AppError> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build Ollama client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            model: model.to_string(),
        })
    }

    fn classify(&self, message: String) -> AppError {
        if message.contains("Connection refused") || message.contains("connect") {
            AppError::OllamaUnavailable { host: self.base_url.clone() }
        } else if message.contains("model") {
            AppError::ModelNotFound { model_name: self.model.clone() }
        } else {
            AppError::InferenceError { message }
        }
    }
}

#[async_trait]
impl CompletionBackend for OllamaAgentService {
    async fn stream_chat(
        &self,
        history: &[Message],
        user_message: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(), AppError> {
        let agent = self.client.agent(&self.model).preamble(PREAMBLE).build();

        let mut stream = agent.stream_chat(user_message, to_rig_history(history)).await;
        while let Some(item) = stream.next().await {
            match item {
                Ok(MultiTurnStreamItem::StreamAssistantItem(StreamedAssistantContent::Text(text))) => {
                    if tx.send(text.text).await.is_err() {
                        debug!("Fragment receiver dropped, abandoning stream");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Ollama streaming failed: {e}");
                    return Err(self.classify(e.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        let agent = self.client.agent(&self.model).build();
        agent.prompt(prompt).await.map_err(|e| {
            error!("Ollama completion failed: {e}");
            self.classify(e.to_string())
        })
    }

    async fn complete_list(
        &self,
        prompt: &str,
        schema: serde_json::Value,
    ) -> Result<Vec<String>, AppError> {
        let agent = self
            .client
            .agent(&self.model)
            .additional_params(json!({ "format": schema }))
            .build();
        let raw = agent.prompt(prompt).await.map_err(|e| {
            error!("Ollama structured completion failed: {e}");
            self.classify(e.to_string())
        })?;
        serde_json::from_str(raw.trim()).map_err(|e| AppError::InferenceError {
            message: format!("Expected a JSON array of strings: {e}"),
        })
    }
}
