use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder title given to every freshly created session.
pub const DEFAULT_TITLE: &str = "New Health Chat";
/// Title used when automatic title generation fails.
pub const FALLBACK_TITLE: &str = "Health Chat";
/// Title of the session produced by importing a share link.
pub const SHARED_TITLE: &str = "Shared Chat";

/// Persisted timestamps have millisecond resolution, so new ones are created
/// at that resolution too and survive a round trip unchanged.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// True for titles that were never replaced by a real one.
pub fn is_generic_title(title: &str) -> bool {
    title == DEFAULT_TITLE || title == FALLBACK_TITLE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thumbs up / thumbs down. Absence of feedback is `None` on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Up,
    Down,
}

impl Feedback {
    /// Clicking the active value clears it, anything else replaces it.
    pub fn toggle(current: Option<Feedback>, requested: Feedback) -> Option<Feedback> {
        if current == Some(requested) {
            None
        } else {
            Some(requested)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            timestamp: now_millis(),
            feedback: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Empty assistant reply, filled in while the response streams.
    pub fn placeholder() -> Self {
        Self::new(MessageRole::Assistant, String::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn with_messages(title: impl Into<String>, messages: Vec<Message>) -> Self {
        Self { messages, ..Self::new(title) }
    }
}

// ── API payloads ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub message: Message,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub current_session_id: Option<String>,
    pub loading: bool,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: Feedback,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub feedback: Option<Feedback>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShareToken {
    pub token: String,
}

/// WebSocket request sent by the client.
#[derive(Debug, Deserialize)]
pub struct WsChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
}

/// WebSocket event sent to the client (internally tagged).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    StreamStart { session_id: String, message_id: String },
    StreamUpdate { message_id: String, content: String },
    StreamEnd { message_id: String, full_content: String },
    Error { message: String },
}
