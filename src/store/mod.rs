//! The session store: the single owner of every chat session and of the
//! current-session selection.
//!
//! All state lives behind one mutex that is never held across an `.await`,
//! so each operation is atomic with respect to the others. Every change is
//! published as a [`StoreEvent`] and, unless the store is ephemeral, queued
//! for a debounced write to [`BlobStorage`].

mod persister;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::db::BlobStorage;
use crate::errors::AppError;
use crate::models::{ChatSession, Feedback, Message, DEFAULT_TITLE, SHARED_TITLE};
use crate::share;

pub use persister::{decode_snapshot, encode_snapshot, DEFAULT_DEBOUNCE, STORAGE_KEY};
use persister::Persister;

const EVENT_CAPACITY: usize = 1024;

/// Change notifications, in the order the changes were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SessionsChanged,
    CurrentChanged { session_id: Option<String> },
    MessagesReplaced { session_id: String },
    MessageUpdated { session_id: String, message: Message },
    TitleChanged { session_id: String, title: String },
    LoadingChanged { loading: bool },
}

impl StoreEvent {
    fn touches_sessions(&self) -> bool {
        !matches!(self, StoreEvent::LoadingChanged { .. } | StoreEvent::CurrentChanged { .. })
    }
}

pub(crate) struct StoreState {
    sessions: Vec<ChatSession>,
    current_session_id: Option<String>,
    in_flight: HashSet<String>,
    /// Imported shared sessions, kept out of the saved collection.
    shared: HashSet<String>,
    persister: Option<Persister>,
}

impl StoreState {
    pub(crate) fn snapshot(&self) -> Result<String, serde_json::Error> {
        encode_snapshot(self.sessions.iter().filter(|s| !self.shared.contains(&s.id)))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.id == id)
    }

    fn session_mut(&mut self, id: &str) -> Result<&mut ChatSession, AppError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::session_not_found(id))
    }

    fn insert_fresh(&mut self, events: &mut Vec<StoreEvent>) -> ChatSession {
        let session = ChatSession::new(DEFAULT_TITLE);
        self.sessions.insert(0, session.clone());
        events.push(StoreEvent::SessionsChanged);
        self.select(session.id.clone(), events);
        session
    }

    fn select(&mut self, id: String, events: &mut Vec<StoreEvent>) {
        if self.current_session_id.as_deref() != Some(id.as_str()) {
            self.current_session_id = Some(id.clone());
            events.push(StoreEvent::CurrentChanged { session_id: Some(id) });
        }
    }

    /// Restores the selection invariant after sessions were removed.
    fn repair_current(&mut self, events: &mut Vec<StoreEvent>) {
        let dangling = match &self.current_session_id {
            Some(id) => self.position(id).is_none(),
            None => true,
        };
        if !dangling {
            return;
        }
        match self.sessions.first() {
            Some(first) => {
                let id = first.id.clone();
                self.select(id, events);
            }
            None => {
                self.insert_fresh(events);
            }
        }
    }
}

pub(crate) struct Inner {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

impl SessionStore {
    fn from_sessions(sessions: Vec<ChatSession>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StoreState {
                    sessions,
                    current_session_id: None,
                    in_flight: HashSet::new(),
                    shared: HashSet::new(),
                    persister: None,
                }),
                events,
            }),
        };
        store.mutate(|state, events| state.repair_current(events));
        store
    }

    /// A store that is never written anywhere.
    pub fn ephemeral(sessions: Vec<ChatSession>) -> Self {
        Self::from_sessions(dedupe(sessions))
    }

    pub fn new() -> Self {
        Self::ephemeral(Vec::new())
    }

    /// Loads the store at startup.
    ///
    /// A valid `shared_token` wins over saved state and yields a single
    /// ephemeral "Shared Chat" session; saved state is left untouched. An
    /// invalid token is ignored. Otherwise the saved collection is read from
    /// `storage`, falling back to one empty session when it is missing or
    /// unreadable.
    pub async fn open(
        storage: Arc<dyn BlobStorage>,
        debounce: Duration,
        shared_token: Option<&str>,
    ) -> Self {
        if let Some(token) = shared_token {
            match share::decode(token) {
                Ok(messages) => {
                    info!("Opened shared conversation with {} messages", messages.len());
                    return Self::ephemeral(vec![ChatSession::with_messages(SHARED_TITLE, messages)]);
                }
                Err(e) => warn!("Ignoring shared link: {e}"),
            }
        }

        let sessions = match storage.read(STORAGE_KEY).await {
            Ok(Some(blob)) => match decode_snapshot(&blob) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!("Discarding unreadable saved sessions: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Could not read saved sessions, starting fresh: {e}");
                Vec::new()
            }
        };
        info!("Loaded {} saved sessions", sessions.len());

        let loaded = sessions.len();
        let sessions = dedupe(sessions);
        // A session created or dropped during load is not saved yet.
        let unsaved = sessions.is_empty() || sessions.len() != loaded;

        let store = Self::from_sessions(sessions);
        let persister = Persister::spawn(storage, debounce, Arc::downgrade(&store.inner));
        if unsaved {
            persister.schedule();
        }
        store.inner.lock().persister = Some(persister);
        store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Applies `f` under the lock, then publishes its events and schedules a
    /// write if any session data changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState, &mut Vec<StoreEvent>) -> R) -> R {
        let mut events = Vec::new();
        let mut state = self.inner.lock();
        let result = f(&mut state, &mut events);
        if events.iter().any(StoreEvent::touches_sessions) {
            if let Some(persister) = &state.persister {
                persister.schedule();
            }
        }
        for event in events {
            let _ = self.inner.events.send(event);
        }
        result
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn sessions(&self) -> Vec<ChatSession> {
        self.inner.lock().sessions.clone()
    }

    pub fn session(&self, id: &str) -> Option<ChatSession> {
        self.inner.lock().sessions.iter().find(|s| s.id == id).cloned()
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.inner.lock().current_session_id.clone()
    }

    pub fn current_session(&self) -> Option<ChatSession> {
        let state = self.inner.lock();
        let id = state.current_session_id.as_deref()?;
        state.sessions.iter().find(|s| s.id == id).cloned()
    }

    /// Case-insensitive title filter, in collection order.
    pub fn search_sessions(&self, query: &str) -> Vec<ChatSession> {
        let needle = query.trim().to_lowercase();
        self.inner
            .lock()
            .sessions
            .iter()
            .filter(|s| needle.is_empty() || s.title.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// True while any session has a reply in flight.
    pub fn is_loading(&self) -> bool {
        !self.inner.lock().in_flight.is_empty()
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.inner.lock().in_flight.contains(session_id)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.lock().persister.is_none()
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Adds an empty session at the front and selects it.
    pub fn create_session(&self) -> ChatSession {
        self.mutate(|state, events| state.insert_fresh(events))
    }

    pub fn select_session(&self, id: &str) -> Result<(), AppError> {
        self.mutate(|state, events| {
            if state.position(id).is_none() {
                return Err(AppError::session_not_found(id));
            }
            state.select(id.to_string(), events);
            Ok(())
        })
    }

    /// Removes a session. Deleting the current one selects the first
    /// remaining session, or a new empty one if none remain.
    pub fn delete_session(&self, id: &str) -> Result<(), AppError> {
        self.mutate(|state, events| {
            let index = state.position(id).ok_or_else(|| AppError::session_not_found(id))?;
            state.sessions.remove(index);
            state.shared.remove(id);
            events.push(StoreEvent::SessionsChanged);
            state.repair_current(events);
            Ok(())
        })
    }

    /// Drops every session and the saved blob, leaving one empty session.
    pub fn clear_all(&self) -> ChatSession {
        self.mutate(|state, events| {
            state.sessions.clear();
            state.shared.clear();
            state.current_session_id = None;
            if let Some(persister) = &state.persister {
                persister.erase();
            }
            state.insert_fresh(events)
        })
    }

    /// Opens the conversation in a share token as a new current session.
    ///
    /// The shared session is never written to storage; every other session
    /// keeps being saved as before.
    pub fn import_shared(&self, token: &str) -> Result<ChatSession, AppError> {
        let messages = share::decode(token)?;
        let session = ChatSession::with_messages(SHARED_TITLE, messages);
        self.mutate(|state, events| {
            state.shared.insert(session.id.clone());
            state.sessions.insert(0, session.clone());
            events.push(StoreEvent::SessionsChanged);
            state.select(session.id.clone(), events);
        });
        info!("Imported shared conversation {}", session.id);
        Ok(session)
    }

    // ── Session contents ─────────────────────────────────────────────────────

    pub fn update_messages(&self, id: &str, messages: Vec<Message>) -> Result<(), AppError> {
        self.mutate(|state, events| {
            state.session_mut(id)?.messages = messages;
            events.push(StoreEvent::MessagesReplaced { session_id: id.to_string() });
            Ok(())
        })
    }

    /// Replaces the content of one message, leaving the others untouched.
    pub fn set_message_content(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<(), AppError> {
        self.mutate(|state, events| {
            let message = find_message(state.session_mut(session_id)?, message_id)?;
            message.content = content.to_string();
            events.push(StoreEvent::MessageUpdated {
                session_id: session_id.to_string(),
                message: message.clone(),
            });
            Ok(())
        })
    }

    pub fn set_title(&self, id: &str, title: &str) -> Result<(), AppError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AppError::EmptyField { field_name: "title".to_string() });
        }
        self.mutate(|state, events| {
            state.session_mut(id)?.title = title.to_string();
            events.push(StoreEvent::TitleChanged {
                session_id: id.to_string(),
                title: title.to_string(),
            });
            Ok(())
        })
    }

    /// Toggles feedback on a message and returns the resulting value.
    pub fn set_feedback(
        &self,
        session_id: &str,
        message_id: &str,
        feedback: Feedback,
    ) -> Result<Option<Feedback>, AppError> {
        self.mutate(|state, events| {
            let message = find_message(state.session_mut(session_id)?, message_id)?;
            message.feedback = Feedback::toggle(message.feedback, feedback);
            let result = message.feedback;
            events.push(StoreEvent::MessageUpdated {
                session_id: session_id.to_string(),
                message: message.clone(),
            });
            Ok(result)
        })
    }

    // ── Turns ─────────────────────────────────────────────────────────────────

    /// Appends the user message and the assistant placeholder to a session
    /// and marks it busy until the returned guard is dropped.
    ///
    /// Returns the history as it was before this turn.
    pub fn begin_turn(
        &self,
        session_id: &str,
        user: Message,
        placeholder: Message,
    ) -> Result<(Vec<Message>, TurnGuard), AppError> {
        let history = self.mutate(|state, events| {
            if state.in_flight.contains(session_id) {
                return Err(AppError::SessionBusy { id: session_id.to_string() });
            }
            let session = state.session_mut(session_id)?;
            let history = session.messages.clone();
            session.messages.push(user);
            events.push(StoreEvent::MessagesReplaced { session_id: session_id.to_string() });
            session.messages.push(placeholder);
            events.push(StoreEvent::MessagesReplaced { session_id: session_id.to_string() });

            let was_idle = state.in_flight.is_empty();
            state.in_flight.insert(session_id.to_string());
            if was_idle {
                events.push(StoreEvent::LoadingChanged { loading: true });
            }
            Ok(history)
        })?;
        let guard = TurnGuard { store: self.clone(), session_id: session_id.to_string() };
        Ok((history, guard))
    }

    fn end_turn(&self, session_id: &str) {
        self.mutate(|state, events| {
            if state.in_flight.remove(session_id) && state.in_flight.is_empty() {
                events.push(StoreEvent::LoadingChanged { loading: false });
            }
        });
        debug!("Turn finished for session {session_id}");
    }

    /// Writes any pending change now instead of waiting for the debounce.
    pub async fn flush(&self) {
        let persister = self.inner.lock().persister.clone();
        if let Some(persister) = persister {
            persister.flush().await;
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a session busy for the lifetime of a turn. Dropping it clears the
/// busy mark on every exit path.
pub struct TurnGuard {
    store: SessionStore,
    session_id: String,
}

impl std::fmt::Debug for TurnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnGuard").field("session_id", &self.session_id).finish_non_exhaustive()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.store.end_turn(&self.session_id);
    }
}

fn find_message<'a>(
    session: &'a mut ChatSession,
    message_id: &str,
) -> Result<&'a mut Message, AppError> {
    let session_id = session.id.clone();
    session
        .messages
        .iter_mut()
        .find(|m| m.id == message_id)
        .ok_or_else(|| AppError::MessageNotFound {
            session_id,
            message_id: message_id.to_string(),
        })
}

/// Keeps the first session for every id.
fn dedupe(sessions: Vec<ChatSession>) -> Vec<ChatSession> {
    let mut seen = HashSet::new();
    let before = sessions.len();
    let unique: Vec<ChatSession> =
        sessions.into_iter().filter(|s| seen.insert(s.id.clone())).collect();
    if unique.len() != before {
        warn!("Dropped {} sessions with duplicate ids", before - unique.len());
    }
    unique
}
