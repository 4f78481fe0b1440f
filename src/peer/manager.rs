//! Peer Connection Manager.
//!
//! Owns one peer connection per call attempt and drives it through the
//! offer/answer exchange over the signaling channel. Two background tasks feed
//! it: the signaling pump (remote offers, answers and candidates) and the peer
//! pump (local candidates, state changes, remote tracks). Negotiation steps are
//! serialised through one lock around [`Negotiation`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CallError, NegotiationError, SignalingError};
use crate::events::{CallEvent, EventSink};
use crate::media::{MediaStream, MediaTrack};
use crate::peer::ice::{CandidateTally, IceConfigProvider};
use crate::peer::state::{CandidateAction, Negotiation};
use crate::peer::transport::{PeerEvent, PeerEvents, PeerFactory, PeerTransport};
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};
use crate::signaling::{MessageType, Replay, Signal, SignalingChannel, Subscription};

#[derive(Default)]
struct Tasks {
    signaling: Option<JoinHandle<()>>,
    peer: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [self.signaling.take(), self.peer.take(), self.grace.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    channel: SignalingChannel,
    factory: Arc<dyn PeerFactory>,
    ice: Arc<dyn IceConfigProvider>,
    events: EventSink,
    grace: Duration,
    negotiation: tokio::sync::Mutex<Negotiation>,
    state: watch::Sender<ConnectionState>,
    remote: Mutex<Option<MediaStream>>,
    tasks: Mutex<Tasks>,
}

pub struct PeerConnectionManager {
    inner: Arc<Inner>,
}

impl PeerConnectionManager {
    pub fn new(
        channel: SignalingChannel,
        factory: Arc<dyn PeerFactory>,
        ice: Arc<dyn IceConfigProvider>,
        events: EventSink,
        grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            inner: Arc::new(Inner {
                channel,
                factory,
                ice,
                events,
                grace,
                negotiation: tokio::sync::Mutex::new(Negotiation::default()),
                state,
                remote: Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn channel(&self) -> &SignalingChannel {
        &self.inner.channel
    }

    /// Subscribes to the session's signaling. Calling it again while listening is a no-op.
    pub async fn listen(&self, replay: Replay) -> Result<(), SignalingError> {
        if self.is_listening() {
            return Ok(());
        }
        let sub = self.inner.channel.subscribe(replay).await?;
        let task = tokio::spawn(self.inner.clone().pump_signaling(sub));
        if let Some(old) = self.inner.tasks.lock().signaling.replace(task) {
            old.abort();
        }
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .signaling
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Caller side: opens a connection with `tracks`, applies and publishes an offer.
    /// Any failure abandons the attempt and leaves the manager in `new`.
    pub async fn call(&self, tracks: &[MediaTrack]) -> Result<(), CallError> {
        let mut neg = self.inner.negotiation.lock().await;
        neg.can_offer()?;
        let peer = self.inner.open_peer(tracks).await?;
        match self.inner.send_offer(&mut neg, &peer).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "offer failed, abandoning call attempt");
                self.inner.abandon(&mut neg, peer).await;
                Err(err)
            }
        }
    }

    /// Callee side: answers the latest received offer.
    pub async fn answer(&self, tracks: &[MediaTrack]) -> Result<(), CallError> {
        let mut neg = self.inner.negotiation.lock().await;
        let offer = neg.pending_offer()?;
        let peer = self.inner.open_peer(tracks).await?;
        match self.inner.send_answer(&mut neg, &peer, offer).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "answer failed, abandoning call attempt");
                self.inner.abandon(&mut neg, peer).await;
                Err(err)
            }
        }
    }

    pub async fn has_pending_offer(&self) -> bool {
        self.inner.negotiation.lock().await.has_pending_offer()
    }

    pub async fn phase(&self) -> &'static str {
        self.inner.negotiation.lock().await.phase_name()
    }

    /// Swaps the outbound video source in place. Returns false when there is no
    /// connection yet.
    pub async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<bool, CallError> {
        let peer = self.inner.negotiation.lock().await.peer();
        let Some(peer) = peer else {
            return Ok(false);
        };
        peer.replace_video_track(track).await?;
        Ok(true)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.inner.remote.lock().clone()
    }

    /// Unsubscribes, then closes the connection. Terminal for this manager.
    pub async fn close(&self) {
        let (signaling, grace) = {
            let mut tasks = self.inner.tasks.lock();
            (tasks.signaling.take(), tasks.grace.take())
        };
        if let Some(task) = signaling {
            task.abort();
            // the subscription is dropped once the cancelled task has been reaped
            let _ = task.await;
        }
        if let Some(task) = grace {
            task.abort();
        }

        let peer = self.inner.negotiation.lock().await.close();
        let pump = self.inner.tasks.lock().peer.take();
        if let Some(task) = pump {
            task.abort();
        }
        if let Some(peer) = peer {
            if let Err(err) = peer.close().await {
                warn!(error = %err, "peer connection close failed");
            }
        }
        let remote = self.inner.remote.lock().take();
        if let Some(remote) = remote {
            remote.stop_all();
        }
        self.inner.set_state(ConnectionState::Closed);
        info!(session = %self.inner.channel.session_id(), "call attempt closed");
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.inner.tasks.lock().abort_all();
        let peer = match self.inner.negotiation.try_lock() {
            Ok(mut neg) => neg.close(),
            Err(_) => None,
        };
        let Some(peer) = peer else {
            return;
        };
        match Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    let _ = peer.close().await;
                });
            }
            Err(_) => {
                warn!("call attempt dropped outside a runtime, closing its peer on a helper thread");
                close_detached(peer);
            }
        }
    }
}

/// Closes `peer` on a short-lived thread with its own runtime.
fn close_detached(peer: Arc<dyn PeerTransport>) {
    let spawned = std::thread::Builder::new()
        .name("tutor-rtc-close".into())
        .spawn(move || {
            match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => {
                    if let Err(err) = rt.block_on(peer.close()) {
                        warn!(error = %err, "peer connection close failed");
                    }
                }
                Err(err) => warn!(error = %err, "no runtime to close the peer connection"),
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "peer connection left open");
    }
}

async fn apply_candidates(peer: &Arc<dyn PeerTransport>, candidates: Vec<IceCandidate>) {
    for candidate in candidates {
        if let Err(err) = peer.add_ice_candidate(candidate).await {
            warn!(error = %err, "buffered candidate rejected");
        }
    }
}

impl Inner {
    async fn pump_signaling(self: Arc<Self>, mut sub: Subscription) {
        while let Some(row) = sub.next().await {
            if row.message_type == MessageType::Whiteboard {
                continue;
            }
            let result = match Signal::decode(&row) {
                Ok(Signal::Offer(offer)) => self.on_offer(offer).await,
                Ok(Signal::Answer(answer)) => self.on_answer(answer).await,
                Ok(Signal::IceCandidate(candidate)) => self.on_remote_candidate(candidate).await,
                Ok(Signal::Whiteboard(_)) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(
                    id = %row.id,
                    kind = row.message_type.as_str(),
                    error = %err,
                    "signaling message dropped"
                );
            }
        }
        debug!(session = %self.channel.session_id(), "signaling feed ended");
    }

    async fn on_offer(&self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let replaced = {
            let mut neg = self.negotiation.lock().await;
            let replaced = neg.has_pending_offer();
            neg.offer_received(offer)?;
            replaced
        };
        info!(replaced, "offer received");
        self.events.emit(CallEvent::IncomingOffer);
        Ok(())
    }

    async fn on_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let mut neg = self.negotiation.lock().await;
        let peer = neg.answer_target()?;
        peer.set_remote_description(answer).await?;
        let queued = neg.remote_answer_applied()?;
        info!(queued = queued.len(), "answer applied");
        apply_candidates(&peer, queued).await;
        Ok(())
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut neg = self.negotiation.lock().await;
        match neg.candidate_received(candidate) {
            CandidateAction::Apply(peer, candidate) => peer.add_ice_candidate(candidate).await?,
            CandidateAction::Queued => {
                debug!(queued = neg.queued_candidates(), "remote candidate held until remote description");
            }
            CandidateAction::Dropped => debug!("remote candidate after close dropped"),
        }
        Ok(())
    }

    async fn open_peer(
        self: &Arc<Self>,
        tracks: &[MediaTrack],
    ) -> Result<Arc<dyn PeerTransport>, CallError> {
        let servers = self.ice.ice_servers().await;
        let (peer, events) = self.factory.create(&servers).await?;
        for track in tracks {
            if let Err(err) = peer.add_track(track).await {
                let _ = peer.close().await;
                return Err(err.into());
            }
        }
        let task = tokio::spawn(self.clone().pump_peer(events));
        if let Some(old) = self.tasks.lock().peer.replace(task) {
            old.abort();
        }
        Ok(peer)
    }

    async fn send_offer(
        &self,
        neg: &mut Negotiation,
        peer: &Arc<dyn PeerTransport>,
    ) -> Result<(), CallError> {
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        neg.offer_sent(peer.clone())?;
        self.channel.publish(&Signal::Offer(offer)).await?;
        info!(session = %self.channel.session_id(), "offer published");
        Ok(())
    }

    async fn send_answer(
        &self,
        neg: &mut Negotiation,
        peer: &Arc<dyn PeerTransport>,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        peer.set_remote_description(offer).await?;
        let queued = neg.remote_offer_applied(peer.clone())?;
        debug!(queued = queued.len(), "remote offer applied");
        apply_candidates(peer, queued).await;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        self.channel.publish(&Signal::Answer(answer)).await?;
        neg.answer_sent()?;
        info!(session = %self.channel.session_id(), "answer published");
        Ok(())
    }

    async fn abandon(&self, neg: &mut Negotiation, peer: Arc<dyn PeerTransport>) {
        neg.reset();
        let pump = self.tasks.lock().peer.take();
        if let Some(task) = pump {
            task.abort();
        }
        if let Err(err) = peer.close().await {
            debug!(error = %err, "abandoned peer close failed");
        }
        let remote = self.remote.lock().take();
        if let Some(remote) = remote {
            remote.stop_all();
        }
        self.set_state(ConnectionState::New);
    }

    async fn pump_peer(self: Arc<Self>, mut events: PeerEvents) {
        let mut tally = CandidateTally::default();
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    tally.record(&candidate);
                    if let Err(err) = self.channel.publish(&Signal::IceCandidate(candidate)).await {
                        warn!(error = %err, "local candidate not published");
                    }
                }
                PeerEvent::GatheringComplete => tally.report(),
                PeerEvent::StateChanged(state) => self.on_state(state),
                PeerEvent::RemoteTrack(track) => self.on_remote_track(track),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) -> bool {
        let previous = self.state.send_replace(state);
        if previous != state {
            self.events.connection_state(state);
        }
        previous != state
    }

    fn on_state(self: &Arc<Self>, state: ConnectionState) {
        if !self.set_state(state) {
            return;
        }
        let mut tasks = self.tasks.lock();
        match state {
            ConnectionState::Connected => {
                if let Some(grace) = tasks.grace.take() {
                    grace.abort();
                    self.events.recovered();
                }
            }
            ConnectionState::Disconnected => {
                if tasks.grace.as_ref().map_or(true, JoinHandle::is_finished) {
                    self.events.reconnecting();
                    let inner = self.clone();
                    tasks.grace = Some(tokio::spawn(async move {
                        tokio::time::sleep(inner.grace).await;
                        if *inner.state.borrow() != ConnectionState::Connected {
                            inner.events.offline();
                        }
                    }));
                }
            }
            ConnectionState::Failed => {
                if let Some(grace) = tasks.grace.take() {
                    grace.abort();
                }
                self.events.failed();
            }
            ConnectionState::Closed => {
                if let Some(grace) = tasks.grace.take() {
                    grace.abort();
                }
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    fn on_remote_track(&self, track: MediaTrack) {
        let event = CallEvent::RemoteTrack {
            id: track.id().to_string(),
            kind: track.kind(),
        };
        self.remote
            .lock()
            .get_or_insert_with(|| MediaStream::new(Vec::new()))
            .add_track(track);
        self.events.emit(event);
    }
}
