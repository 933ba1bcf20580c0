//! Debounced background writer for the session collection.
//!
//! Every mutation calls [`Persister::schedule`], which (re)arms a single
//! timer. Only when the timer runs out is the current collection read and
//! written, so a burst of streamed tokens costs one write.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use crate::db::BlobStorage;
use crate::models::ChatSession;

use super::Inner;

/// Storage key of the persisted collection.
pub const STORAGE_KEY: &str = "ayugpt_sessions";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    sessions: Vec<&'a ChatSession>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Snapshot {
    Versioned { version: u32, sessions: Vec<ChatSession> },
    // Early builds stored the bare array.
    Legacy(Vec<ChatSession>),
}

pub fn encode_snapshot<'a>(
    sessions: impl IntoIterator<Item = &'a ChatSession>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&SnapshotRef {
        version: SNAPSHOT_VERSION,
        sessions: sessions.into_iter().collect(),
    })
}

pub fn decode_snapshot(blob: &str) -> Result<Vec<ChatSession>, serde_json::Error> {
    match serde_json::from_str(blob)? {
        Snapshot::Versioned { version, sessions } => {
            if version > SNAPSHOT_VERSION {
                warn!("Persisted sessions use newer format v{version}, reading as v{SNAPSHOT_VERSION}");
            }
            Ok(sessions)
        }
        Snapshot::Legacy(sessions) => Ok(sessions),
    }
}

enum Command {
    Schedule,
    Erase,
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub(crate) struct Persister {
    tx: mpsc::UnboundedSender<Command>,
}

impl Persister {
    pub(crate) fn spawn(
        storage: Arc<dyn BlobStorage>,
        window: Duration,
        store: Weak<Inner>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(storage, window, store, rx));
        Self { tx }
    }

    pub(crate) fn schedule(&self) {
        let _ = self.tx.send(Command::Schedule);
    }

    pub(crate) fn erase(&self) {
        let _ = self.tx.send(Command::Erase);
    }

    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run(
    storage: Arc<dyn BlobStorage>,
    window: Duration,
    store: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => tokio::select! {
                command = rx.recv() => command,
                _ = sleep_until(at) => {
                    deadline = None;
                    write_current(storage.as_ref(), &store).await;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match command {
            Some(Command::Schedule) => deadline = Some(Instant::now() + window),
            Some(Command::Erase) => {
                deadline = None;
                if let Err(e) = storage.remove(STORAGE_KEY).await {
                    error!("Failed to erase persisted sessions: {e}");
                }
            }
            Some(Command::Flush(done)) => {
                if deadline.take().is_some() {
                    write_current(storage.as_ref(), &store).await;
                }
                let _ = done.send(());
            }
            // Store dropped; a pending write is discarded with it.
            None => break,
        }
    }
    debug!("Session persister stopped");
}

async fn write_current(storage: &dyn BlobStorage, store: &Weak<Inner>) {
    let Some(inner) = store.upgrade() else {
        return;
    };
    let blob = {
        let state = inner.lock();
        state.snapshot()
    };
    drop(inner);
    match blob {
        Ok(blob) => write_blob(storage, &blob).await,
        Err(e) => error!("Failed to serialize sessions: {e}"),
    }
}

async fn write_blob(storage: &dyn BlobStorage, blob: &str) {
    match storage.write(STORAGE_KEY, blob).await {
        Ok(()) => debug!("Persisted sessions ({} bytes)", blob.len()),
        Err(e) => error!("Failed to persist sessions: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[test]
    fn snapshot_round_trip_is_identical() {
        let mut first = ChatSession::new("Sleep herbs");
        first.messages.push(Message::user("Which herbs help with sleep?"));
        first.messages.push(Message::new(crate::models::MessageRole::Assistant, "Ashwagandha."));
        let second = ChatSession::new("New Health Chat");
        let sessions = vec![first, second];

        let blob = encode_snapshot(&sessions).unwrap();
        assert_eq!(decode_snapshot(&blob).unwrap(), sessions);
    }

    #[test]
    fn reads_legacy_bare_array() {
        let blob = r#"[{"id":"a","title":"t","messages":[],"createdAt":1}]"#;
        let sessions = decode_snapshot(blob).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "a");
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_snapshot("{not json").is_err());
        assert!(decode_snapshot(r#"{"version":1}"#).is_err());
    }
}
