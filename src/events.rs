//! Observable call events for the UI layer.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::TrackKind;
use crate::peer::types::ConnectionState;

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum CallEvent {
    /// An offer is waiting to be answered.
    IncomingOffer,
    ConnectionState(ConnectionState),
    RemoteTrack { id: String, kind: TrackKind },
    /// Connection dropped to `disconnected`; the grace period is running.
    Reconnecting,
    Recovered,
    /// Still not connected when the grace period ran out.
    Offline,
    /// Terminal `failed`; a fresh call is needed.
    Failed,
    AudioEnabled(bool),
    VideoEnabled(bool),
    ScreenShare(bool),
    Recording(bool),
    RecordingSaved(PathBuf),
    Ended,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::IncomingOffer => "call-incoming-offer",
            CallEvent::ConnectionState(_) => "call-connection-state",
            CallEvent::RemoteTrack { .. } => "call-remote-track",
            CallEvent::Reconnecting => "call-reconnecting",
            CallEvent::Recovered => "call-recovered",
            CallEvent::Offline => "call-offline",
            CallEvent::Failed => "call-failed",
            CallEvent::AudioEnabled(_) => "call-audio-enabled",
            CallEvent::VideoEnabled(_) => "call-video-enabled",
            CallEvent::ScreenShare(_) => "call-screen-share",
            CallEvent::Recording(_) => "call-recording",
            CallEvent::RecordingSaved(_) => "call-recording-saved",
            CallEvent::Ended => "call-ended",
        }
    }
}

pub type EventStream = mpsc::UnboundedReceiver<CallEvent>;

/// Sending half of the UI event stream. Events are dropped quietly once the UI stops listening.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<CallEvent>>,
}

impl EventSink {
    pub fn channel() -> (EventSink, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink { tx: Some(tx) }, rx)
    }

    /// A sink nobody listens to.
    pub fn detached() -> EventSink {
        EventSink::default()
    }

    pub fn emit(&self, event: CallEvent) {
        debug!(event = event.name(), "emit");
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("event stream closed");
            }
        }
    }

    pub fn connection_state(&self, state: ConnectionState) {
        info!(%state, "connection state");
        self.emit(CallEvent::ConnectionState(state));
    }

    pub fn reconnecting(&self) {
        warn!("connection problem, waiting for recovery");
        self.emit(CallEvent::Reconnecting);
    }

    pub fn recovered(&self) {
        info!("connection recovered");
        self.emit(CallEvent::Recovered);
    }

    pub fn offline(&self) {
        warn!("connection did not recover in time");
        self.emit(CallEvent::Offline);
    }

    pub fn failed(&self) {
        warn!("peer connection failed");
        self.emit(CallEvent::Failed);
    }
}
