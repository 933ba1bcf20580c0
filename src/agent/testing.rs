//! Scripted [`CompletionBackend`] for exercising the chat engine offline.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use super::CompletionBackend;
use crate::errors::AppError;
use crate::models::Message;

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    fragments: Vec<String>,
    fail_after: Option<usize>,
    title: Option<String>,
    suggestions: Option<Vec<String>>,
    hold: Option<(usize, Arc<Notify>)>,
    pub(crate) chat_calls: Mutex<Vec<(Vec<Message>, String)>>,
    pub(crate) title_prompts: Mutex<Vec<String>>,
    pub(crate) list_prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub(crate) fn replying(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Sends `count` fragments, then fails the stream.
    pub(crate) fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub(crate) fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub(crate) fn with_suggestions(mut self, suggestions: &[&str]) -> Self {
        self.suggestions = Some(suggestions.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Keeps each stream open after its fragments until `hold` is notified.
    pub(crate) fn held_by(mut self, hold: Arc<Notify>) -> Self {
        self.hold = Some((usize::MAX, hold));
        self
    }

    /// Stops after `count` fragments until `hold` is notified.
    pub(crate) fn paused_after(mut self, count: usize, hold: Arc<Notify>) -> Self {
        self.hold = Some((count, hold));
        self
    }

    async fn wait_at(&self, sent: usize) {
        if let Some((at, hold)) = &self.hold {
            if (*at).min(self.fragments.len()) == sent {
                hold.notified().await;
            }
        }
    }

    pub(crate) fn title_prompts(&self) -> Vec<String> {
        self.title_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn stream_chat(
        &self,
        history: &[Message],
        user_message: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<(), AppError> {
        self.chat_calls
            .lock()
            .unwrap()
            .push((history.to_vec(), user_message.to_string()));

        for (sent, fragment) in self.fragments.iter().enumerate() {
            self.wait_at(sent).await;
            if self.fail_after == Some(sent) {
                return Err(AppError::InferenceError { message: "stream reset".to_string() });
            }
            if tx.send(fragment.clone()).await.is_err() {
                return Ok(());
            }
        }
        if self.fail_after.is_some_and(|n| n >= self.fragments.len()) {
            return Err(AppError::OllamaUnavailable { host: "scripted".to_string() });
        }
        self.wait_at(self.fragments.len()).await;
        Ok(())
    }

    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        self.title_prompts.lock().unwrap().push(prompt.to_string());
        self.title
            .clone()
            .ok_or_else(|| AppError::InferenceError { message: "no title scripted".to_string() })
    }

    async fn complete_list(
        &self,
        prompt: &str,
        _schema: serde_json::Value,
    ) -> Result<Vec<String>, AppError> {
        self.list_prompts.lock().unwrap().push(prompt.to_string());
        self.suggestions
            .clone()
            .ok_or_else(|| AppError::InferenceError { message: "no suggestions scripted".to_string() })
    }
}
