use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{NewSignalingMessage, SignalingMessage, SignalingStore};
use crate::error::SignalingError;
use crate::session::SessionId;
use crate::utils::random_id;

struct Listener {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct Inner {
    log: Vec<SignalingMessage>,
    listeners: Vec<Listener>,
    last_created: Option<DateTime<Utc>>,
}

/// In-process signaling log for tests and single-process embedding.
///
/// Appends are serialised under one lock, so every listener sees rows in append order.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscriptions currently registered for a session.
    pub fn listener_count(&self, session_id: &SessionId) -> usize {
        self.inner
            .lock()
            .listeners
            .iter()
            .filter(|l| l.session_id == *session_id && !l.tx.is_closed())
            .count()
    }

    pub fn messages(&self, session_id: &SessionId) -> Vec<SignalingMessage> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|m| m.session_id == *session_id)
            .cloned()
            .collect()
    }

    /// Replays the whole session log to live listeners, as an at-least-once feed may.
    #[cfg(test)]
    pub(crate) fn redeliver_all(&self, session_id: &SessionId) {
        let inner = self.inner.lock();
        for row in inner.log.iter().filter(|m| m.session_id == *session_id) {
            for listener in inner.listeners.iter().filter(|l| l.session_id == *session_id) {
                let _ = listener.tx.send(row.clone());
            }
        }
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn append(
        &self,
        message: NewSignalingMessage,
    ) -> Result<SignalingMessage, SignalingError> {
        let mut inner = self.inner.lock();

        // creation times are strictly increasing so ordering by created_at matches append order
        let mut created_at = Utc::now();
        if let Some(last) = inner.last_created {
            if created_at <= last {
                created_at = last + ChronoDuration::microseconds(1);
            }
        }
        inner.last_created = Some(created_at);

        let row = SignalingMessage {
            id: random_id(),
            session_id: message.session_id,
            sender_id: message.sender_id,
            message_type: message.message_type,
            payload: message.payload,
            created_at,
        };
        inner.log.push(row.clone());
        inner.listeners.retain(|l| !l.tx.is_closed());
        for listener in inner
            .listeners
            .iter()
            .filter(|l| l.session_id == row.session_id)
        {
            let _ = listener.tx.send(row.clone());
        }
        Ok(row)
    }

    async fn history(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SignalingMessage>, SignalingError> {
        Ok(self.messages(session_id))
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listeners.push(Listener {
            session_id: session_id.clone(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MessageType;
    use serde_json::json;

    fn new_row(session: &str, n: u32) -> NewSignalingMessage {
        NewSignalingMessage {
            session_id: session.into(),
            sender_id: "alice".into(),
            message_type: MessageType::Whiteboard,
            payload: json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn rows_are_scoped_to_their_session() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe(&"a".into()).await.expect("subscribe");
        store.append(new_row("b", 1)).await.expect("append");
        store.append(new_row("a", 2)).await.expect("append");

        let row = rx.recv().await.expect("row");
        assert_eq!(row.payload, json!({ "n": 2 }));
        assert_eq!(store.messages(&"b".into()).len(), 1);
    }

    #[tokio::test]
    async fn creation_times_strictly_increase() {
        let store = MemoryStore::new();
        let mut previous = None;
        for n in 0..50 {
            let row = store.append(new_row("a", n)).await.expect("append");
            if let Some(prev) = previous {
                assert!(row.created_at > prev);
            }
            previous = Some(row.created_at);
        }
    }

    #[tokio::test]
    async fn closed_listeners_are_pruned_on_append() {
        let store = MemoryStore::new();
        let rx = store.subscribe(&"a".into()).await.expect("subscribe");
        drop(rx);
        store.append(new_row("a", 1)).await.expect("append");
        assert!(store.inner.lock().listeners.is_empty());
    }
}
