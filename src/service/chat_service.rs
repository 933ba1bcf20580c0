use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::agent::CompletionBackend;
use crate::errors::AppError;
use crate::models::{is_generic_title, ChatSession, Message};
use crate::service::title_service::TitleGenerator;
use crate::share;
use crate::store::{SessionStore, TurnGuard};

const MAX_MESSAGE_LENGTH: usize = 8000;
const FRAGMENT_BUFFER: usize = 64;

/// Shown in place of the reply when the model cannot be reached.
pub const STREAM_ERROR_MESSAGE: &str =
    "Sorry, I encountered an error. Please check your connection and try again.";

/// Message counts at which a title is generated: the first exchange always,
/// the second only while the title is still generic.
const FIRST_TITLE_CHECKPOINT: usize = 2;
const SECOND_TITLE_CHECKPOINT: usize = 4;

/// A turn whose messages are in the session but whose reply has not been
/// streamed yet. The session stays busy until the turn is run or dropped.
pub struct PendingTurn {
    pub session_id: String,
    pub user_message: Message,
    pub assistant_message: Message,
    history: Vec<Message>,
    guard: TurnGuard,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub session_id: String,
    /// The assistant message as finally stored.
    pub message: Message,
    pub succeeded: bool,
    /// Background title generation started by this turn, if any.
    pub title_task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ChatService {
    store: SessionStore,
    backend: Arc<dyn CompletionBackend>,
    titles: TitleGenerator,
}

impl ChatService {
    pub fn new(store: SessionStore, backend: Arc<dyn CompletionBackend>) -> Self {
        let titles = TitleGenerator::new(backend.clone());
        Self { store, backend, titles }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Runs one full turn: append, stream, finalize.
    ///
    /// The turn runs on its own task, so dropping the returned future (a
    /// client hanging up) does not cut the reply short.
    pub async fn send_message(
        &self,
        session_id: Option<&str>,
        content: &str,
    ) -> Result<TurnOutcome, AppError> {
        let turn = self.begin_turn(session_id, content)?;
        let svc = self.clone();
        tokio::spawn(async move { svc.run_turn(turn).await })
            .await
            .map_err(|e| AppError::Unexpected(format!("Chat turn failed: {e}")))
    }

    /// Validates the input and appends the user message and the empty
    /// assistant placeholder. Without a `session_id` the current session is
    /// used, or a new one when there is none.
    pub fn begin_turn(&self, session_id: Option<&str>, content: &str) -> Result<PendingTurn, AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        if content.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if content.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: content.len(),
            });
        }

        // ── Resolve or create session ─────────────────────────────────────────
        let session_id = match session_id {
            Some(id) => self
                .store
                .session(id)
                .map(|s| s.id)
                .ok_or_else(|| AppError::session_not_found(id))?,
            None => match self.store.current_session_id() {
                Some(id) => id,
                None => self.store.create_session().id,
            },
        };

        // ── Append user message and placeholder ───────────────────────────────
        let user_message = Message::user(content);
        let assistant_message = Message::placeholder();
        let (history, guard) =
            self.store
                .begin_turn(&session_id, user_message.clone(), assistant_message.clone())?;

        Ok(PendingTurn { session_id, user_message, assistant_message, history, guard })
    }

    /// Streams the reply for `turn` into its placeholder. Never fails: a
    /// broken stream leaves [`STREAM_ERROR_MESSAGE`] as the reply.
    pub async fn run_turn(&self, turn: PendingTurn) -> TurnOutcome {
        let PendingTurn { session_id, user_message, assistant_message, history, guard } = turn;
        let message_id = assistant_message.id.clone();

        // ── Stream fragments from the model via a channel ─────────────────────
        let (tx, mut rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        let backend = self.backend.clone();
        let prompt = user_message.content.clone();
        let stream_handle =
            tokio::spawn(async move { backend.stream_chat(&history, &prompt, tx).await });

        let mut full_content = String::new();
        while let Some(fragment) = rx.recv().await {
            full_content.push_str(&fragment);
            self.apply(&session_id, &message_id, &full_content);
        }

        let result = match stream_handle.await {
            Ok(result) => result,
            Err(e) => Err(AppError::Unexpected(format!("Streaming task failed: {e}"))),
        };
        let succeeded = match result {
            Ok(()) => true,
            Err(e) => {
                error!("Reply in session {session_id} failed: {e}");
                full_content = STREAM_ERROR_MESSAGE.to_string();
                self.apply(&session_id, &message_id, &full_content);
                false
            }
        };
        drop(guard);

        let session = self.store.session(&session_id);
        let message = session
            .as_ref()
            .and_then(|s| s.messages.iter().find(|m| m.id == message_id).cloned())
            .unwrap_or(Message { content: full_content, ..assistant_message });

        let title_task = match (&session, succeeded) {
            (Some(session), true) => self.maybe_retitle(session, &user_message.content),
            _ => None,
        };

        TurnOutcome { session_id, message, succeeded, title_task }
    }

    /// Writes `content` into the reply. The session may have been deleted
    /// while the reply was streaming; that update is dropped.
    fn apply(&self, session_id: &str, message_id: &str, content: &str) {
        if let Err(e) = self.store.set_message_content(session_id, message_id, content) {
            debug!("Dropping stale reply update: {e}");
        }
    }

    fn maybe_retitle(&self, session: &ChatSession, seed: &str) -> Option<JoinHandle<()>> {
        let count = session.messages.len();
        let due = count == FIRST_TITLE_CHECKPOINT
            || (count == SECOND_TITLE_CHECKPOINT && is_generic_title(&session.title));
        if !due {
            return None;
        }

        let titles = self.titles.clone();
        let store = self.store.clone();
        let session_id = session.id.clone();
        let seed = seed.to_string();
        Some(tokio::spawn(async move {
            let title = titles.generate_title(&seed).await;
            match store.set_title(&session_id, &title) {
                Ok(()) => info!("Session {session_id} titled '{title}'"),
                Err(e) => debug!("Skipping generated title: {e}"),
            }
        }))
    }

    pub async fn suggest_titles(&self, session_id: &str) -> Result<Vec<String>, AppError> {
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| AppError::session_not_found(session_id))?;
        Ok(self.titles.generate_title_suggestions(&session.messages).await)
    }

    pub fn share_session(&self, session_id: &str) -> Result<String, AppError> {
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| AppError::session_not_found(session_id))?;
        Ok(share::encode(&session.messages)?)
    }
}
