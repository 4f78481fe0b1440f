//! Signaling channel.
//!
//! An append-only, per-session message log shared by the two participants.
//! Offers, answers, trickled ICE candidates and whiteboard strokes all travel
//! through it as typed rows. A [`Subscription`] delivers each row of its
//! session once, in creation order, and never hands a participant its own rows.

pub mod memory;
pub mod rest;

pub use memory::MemoryStore;
pub use rest::RestStore;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{NegotiationError, SignalingError};
use crate::peer::types::{IceCandidate, SdpType, SessionDescription};
use crate::session::{ParticipantId, SessionId};
use crate::whiteboard::WhiteboardStroke;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Offer,
    Answer,
    IceCandidate,
    Whiteboard,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::IceCandidate => "ice-candidate",
            MessageType::Whiteboard => "whiteboard",
        }
    }
}

/// A stored signaling row. Immutable once created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub id: String,
    pub session_id: SessionId,
    pub sender_id: ParticipantId,
    pub message_type: MessageType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Row as submitted for append; the store assigns `id` and `created_at`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewSignalingMessage {
    pub session_id: SessionId,
    pub sender_id: ParticipantId,
    pub message_type: MessageType,
    pub payload: Value,
}

/// Decoded signaling payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Whiteboard(WhiteboardStroke),
}

#[derive(Serialize, Deserialize)]
struct SdpPayload {
    sdp: SdpField,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SdpField {
    Description(SessionDescription),
    Raw(String),
}

#[derive(Serialize, Deserialize)]
struct CandidatePayload {
    candidate: IceCandidate,
}

impl Signal {
    pub fn message_type(&self) -> MessageType {
        match self {
            Signal::Offer(_) => MessageType::Offer,
            Signal::Answer(_) => MessageType::Answer,
            Signal::IceCandidate(_) => MessageType::IceCandidate,
            Signal::Whiteboard(_) => MessageType::Whiteboard,
        }
    }

    /// Payload in row shape: `{sdp}`, `{candidate}` or the stroke fields.
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Signal::Offer(desc) | Signal::Answer(desc) => serde_json::to_value(SdpPayload {
                sdp: SdpField::Description(desc.clone()),
            }),
            Signal::IceCandidate(candidate) => serde_json::to_value(CandidatePayload {
                candidate: candidate.clone(),
            }),
            Signal::Whiteboard(stroke) => serde_json::to_value(stroke),
        }
    }

    pub fn decode(message: &SignalingMessage) -> Result<Signal, NegotiationError> {
        let kind = message.message_type.as_str();
        let malformed = |err: serde_json::Error| NegotiationError::Malformed {
            kind,
            reason: err.to_string(),
        };
        match message.message_type {
            MessageType::Offer | MessageType::Answer => {
                let expected = if message.message_type == MessageType::Offer {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                let payload: SdpPayload =
                    serde_json::from_value(message.payload.clone()).map_err(malformed)?;
                let desc = match payload.sdp {
                    SdpField::Description(desc) => desc,
                    SdpField::Raw(sdp) => SessionDescription { kind: expected, sdp },
                };
                if desc.kind != expected {
                    return Err(NegotiationError::Malformed {
                        kind,
                        reason: format!("description type {:?} in {kind} row", desc.kind),
                    });
                }
                if desc.sdp.trim().is_empty() {
                    return Err(NegotiationError::Malformed {
                        kind,
                        reason: "empty sdp".into(),
                    });
                }
                Ok(match expected {
                    SdpType::Offer => Signal::Offer(desc),
                    SdpType::Answer => Signal::Answer(desc),
                })
            }
            MessageType::IceCandidate => {
                let payload: CandidatePayload =
                    serde_json::from_value(message.payload.clone()).map_err(malformed)?;
                Ok(Signal::IceCandidate(payload.candidate))
            }
            MessageType::Whiteboard => serde_json::from_value(message.payload.clone())
                .map(Signal::Whiteboard)
                .map_err(malformed),
        }
    }
}

/// Backing store of the signaling log: append, query and change feed.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn append(&self, message: NewSignalingMessage)
        -> Result<SignalingMessage, SignalingError>;

    /// All rows of a session in creation order.
    async fn history(&self, session_id: &SessionId)
        -> Result<Vec<SignalingMessage>, SignalingError>;

    /// Rows appended to the session from now on, in append order.
    /// Delivery stops once the receiver is dropped.
    async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, SignalingError>;
}

/// Whether a new subscription first replays rows already in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    LiveOnly,
    History,
}

/// One participant's view of a session's signaling log.
#[derive(Clone)]
pub struct SignalingChannel {
    store: Arc<dyn SignalingStore>,
    session_id: SessionId,
    local: ParticipantId,
}

impl SignalingChannel {
    pub fn new(store: Arc<dyn SignalingStore>, session_id: SessionId, local: ParticipantId) -> Self {
        Self {
            store,
            session_id,
            local,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub async fn publish(&self, signal: &Signal) -> Result<SignalingMessage, SignalingError> {
        let payload = signal.to_payload()?;
        self.publish_raw(signal.message_type(), payload).await
    }

    pub async fn publish_raw(
        &self,
        message_type: MessageType,
        payload: Value,
    ) -> Result<SignalingMessage, SignalingError> {
        let row = self
            .store
            .append(NewSignalingMessage {
                session_id: self.session_id.clone(),
                sender_id: self.local.clone(),
                message_type,
                payload,
            })
            .await?;
        trace!(id = %row.id, kind = message_type.as_str(), session = %self.session_id, "published");
        Ok(row)
    }

    pub async fn subscribe(&self, replay: Replay) -> Result<Subscription, SignalingError> {
        let live = self.store.subscribe(&self.session_id).await?;
        let backlog = match replay {
            Replay::LiveOnly => VecDeque::new(),
            Replay::History => {
                let mut rows = self.store.history(&self.session_id).await?;
                rows.sort_by_key(|row| row.created_at);
                rows.into()
            }
        };
        debug!(session = %self.session_id, backlog = backlog.len(), "subscribed to signaling");
        Ok(Subscription {
            session_id: self.session_id.clone(),
            local: self.local.clone(),
            backlog,
            live,
            seen: HashSet::new(),
        })
    }
}

/// Live delivery handle. Dropping it (or calling [`unsubscribe`](Self::unsubscribe))
/// is the only way to stop delivery.
pub struct Subscription {
    session_id: SessionId,
    local: ParticipantId,
    backlog: VecDeque<SignalingMessage>,
    live: mpsc::UnboundedReceiver<SignalingMessage>,
    seen: HashSet<String>,
}

impl Subscription {
    /// Next row authored by another participant, or `None` once the store closes the feed.
    pub async fn next(&mut self) -> Option<SignalingMessage> {
        loop {
            let row = match self.backlog.pop_front() {
                Some(row) => row,
                None => self.live.recv().await?,
            };
            if self.accept(&row) {
                return Some(row);
            }
        }
    }

    fn accept(&mut self, row: &SignalingMessage) -> bool {
        if row.session_id != self.session_id {
            return false;
        }
        if !self.seen.insert(row.id.clone()) {
            trace!(id = %row.id, "duplicate signaling row skipped");
            return false;
        }
        row.sender_id != self.local
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn unsubscribe(self) {
        debug!(session = %self.session_id, "unsubscribed from signaling");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FlakyStore;
    use serde_json::json;

    fn row(message_type: MessageType, payload: Value) -> SignalingMessage {
        SignalingMessage {
            id: "row-1".into(),
            session_id: "s".into(),
            sender_id: "a".into(),
            message_type,
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn offer_payload_carries_description_under_sdp() {
        let signal = Signal::Offer(SessionDescription::offer("v=0\r\n"));
        assert_eq!(
            signal.to_payload().expect("payload"),
            json!({"sdp": {"type": "offer", "sdp": "v=0\r\n"}})
        );
    }

    #[test]
    fn decodes_bare_sdp_strings() {
        let signal = Signal::decode(&row(MessageType::Answer, json!({"sdp": "v=0"}))).expect("decode");
        assert_eq!(signal, Signal::Answer(SessionDescription::answer("v=0")));
    }

    #[test]
    fn rejects_mismatched_description_type() {
        let err = Signal::decode(&row(
            MessageType::Answer,
            json!({"sdp": {"type": "offer", "sdp": "v=0"}}),
        ))
        .expect_err("must fail");
        assert!(matches!(err, NegotiationError::Malformed { kind: "answer", .. }));
    }

    #[test]
    fn rejects_candidate_without_candidate_field() {
        let err = Signal::decode(&row(MessageType::IceCandidate, json!({"sdpMid": "0"})))
            .expect_err("must fail");
        assert!(matches!(err, NegotiationError::Malformed { kind: "ice-candidate", .. }));
    }

    #[test]
    fn message_types_use_row_names() {
        assert_eq!(
            serde_json::to_value(MessageType::IceCandidate).expect("json"),
            json!("ice-candidate")
        );
        for kind in [
            MessageType::Offer,
            MessageType::Answer,
            MessageType::IceCandidate,
            MessageType::Whiteboard,
        ] {
            assert_eq!(serde_json::to_value(kind).expect("json"), json!(kind.as_str()));
        }
    }

    #[tokio::test]
    async fn subscription_skips_own_rows_and_keeps_order() {
        let store: Arc<dyn SignalingStore> = Arc::new(MemoryStore::new());
        let alice = SignalingChannel::new(store.clone(), "s".into(), "alice".into());
        let bob = SignalingChannel::new(store.clone(), "s".into(), "bob".into());
        let mut alice_sub = alice.subscribe(Replay::LiveOnly).await.expect("subscribe");
        let mut bob_sub = bob.subscribe(Replay::LiveOnly).await.expect("subscribe");

        for n in 0..5 {
            alice
                .publish_raw(MessageType::Whiteboard, json!({ "n": n }))
                .await
                .expect("publish");
        }
        bob.publish_raw(MessageType::Whiteboard, json!({ "n": "bob" }))
            .await
            .expect("publish");

        for n in 0..5 {
            let row = bob_sub.next().await.expect("row");
            assert_eq!(row.payload, json!({ "n": n }));
            assert_eq!(row.sender_id.as_str(), "alice");
        }
        let row = alice_sub.next().await.expect("row");
        assert_eq!(row.payload, json!({ "n": "bob" }));
    }

    #[tokio::test]
    async fn history_replay_delivers_each_row_once() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn SignalingStore> = memory.clone();
        let alice = SignalingChannel::new(store.clone(), "s".into(), "alice".into());
        let bob = SignalingChannel::new(store.clone(), "s".into(), "bob".into());

        alice
            .publish_raw(MessageType::Whiteboard, json!({"n": 1}))
            .await
            .expect("publish");
        let mut sub = bob.subscribe(Replay::History).await.expect("subscribe");
        alice
            .publish_raw(MessageType::Whiteboard, json!({"n": 2}))
            .await
            .expect("publish");

        // the live feed also carries row 2; replaying history must not duplicate it
        memory.redeliver_all(&"s".into());

        assert_eq!(sub.next().await.expect("row").payload, json!({"n": 1}));
        assert_eq!(sub.next().await.expect("row").payload, json!({"n": 2}));
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn dropping_subscription_releases_listener() {
        let memory = Arc::new(MemoryStore::new());
        let channel = SignalingChannel::new(memory.clone(), "s".into(), "alice".into());
        let sub = channel.subscribe(Replay::LiveOnly).await.expect("subscribe");
        assert_eq!(memory.listener_count(&"s".into()), 1);
        sub.unsubscribe();
        assert_eq!(memory.listener_count(&"s".into()), 0);
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.fail_appends(true);
        let channel = SignalingChannel::new(store.clone(), "s".into(), "alice".into());
        let err = channel
            .publish(&Signal::Offer(SessionDescription::offer("v=0")))
            .await
            .expect_err("must fail");
        assert!(matches!(err, SignalingError::Publish(_)));
    }
}
