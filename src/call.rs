//! Imperative call surface for the UI.
//!
//! A [`VideoCall`] is one participant's handle on a session. It owns the local
//! capture, the recorder and at most one [`PeerConnectionManager`] (one per call
//! attempt). Every way out of a call, whether `end_call`, a failed setup or
//! dropping the handle, releases the devices and the signaling subscription.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{CallError, MediaError, NegotiationError, PeerError};
use crate::events::{CallEvent, EventSink, EventStream};
use crate::media::{MediaCaptureController, MediaDevices, MediaStream, MediaTrack};
use crate::peer::connection::RtcPeerFactory;
use crate::peer::ice::{HttpIceProvider, IceConfigProvider, StaticIceProvider};
use crate::peer::manager::PeerConnectionManager;
use crate::peer::transport::PeerFactory;
use crate::peer::types::ConnectionState;
use crate::recorder::{LocalRecorder, MediaEncoder};
use crate::session::{ParticipantId, Role, Session, SessionId};
use crate::signaling::{Replay, SignalingChannel, SignalingStore};

/// Platform collaborators a call is built from.
#[derive(Clone)]
pub struct CallDeps {
    pub store: Arc<dyn SignalingStore>,
    pub ice: Arc<dyn IceConfigProvider>,
    pub peers: Arc<dyn PeerFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub encoder: Arc<dyn MediaEncoder>,
    pub config: Config,
}

impl CallDeps {
    /// webrtc-rs peers, with TURN credentials from the configured service or public STUN.
    pub fn new(
        store: Arc<dyn SignalingStore>,
        devices: Arc<dyn MediaDevices>,
        encoder: Arc<dyn MediaEncoder>,
        config: Config,
    ) -> Result<Self, PeerError> {
        let ice: Arc<dyn IceConfigProvider> = match HttpIceProvider::from_config(&config) {
            Some(provider) => Arc::new(provider),
            None => Arc::new(StaticIceProvider::default()),
        };
        Ok(Self {
            store,
            ice,
            peers: Arc::new(RtcPeerFactory::new()?),
            devices,
            encoder,
            config,
        })
    }
}

struct Attempt {
    manager: PeerConnectionManager,
    forward: JoinHandle<()>,
}

struct CallState {
    media: MediaCaptureController,
    recorder: LocalRecorder,
    attempt: Option<Attempt>,
    screen_watch: Option<JoinHandle<()>>,
}

struct CallInner {
    deps: CallDeps,
    channel: SignalingChannel,
    role: Role,
    events: EventSink,
    state: watch::Sender<ConnectionState>,
    call: Mutex<CallState>,
}

pub struct VideoCall {
    inner: Arc<CallInner>,
    events: parking_lot::Mutex<Option<EventStream>>,
}

impl VideoCall {
    /// Handle for `local` on `session`. Fails if `local` is neither caller nor callee.
    pub fn new(deps: CallDeps, session: &Session, local: ParticipantId) -> Result<Self, CallError> {
        let role = session
            .role_of(&local)
            .ok_or_else(|| CallError::NotAMember {
                session: session.id.to_string(),
                participant: local.to_string(),
            })?;
        let (events, stream) = EventSink::channel();
        let (state, _) = watch::channel(ConnectionState::New);
        let channel = SignalingChannel::new(deps.store.clone(), session.id.clone(), local);
        let recorder = LocalRecorder::new(
            deps.encoder.clone(),
            deps.config.recordings_dir.clone(),
            session.id.clone(),
        );
        let call = CallState {
            media: MediaCaptureController::new(deps.devices.clone()),
            recorder,
            attempt: None,
            screen_watch: None,
        };
        Ok(Self {
            inner: Arc::new(CallInner {
                deps,
                channel,
                role,
                events,
                state,
                call: Mutex::new(call),
            }),
            events: parking_lot::Mutex::new(Some(stream)),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        self.inner.channel.session_id()
    }

    pub fn local(&self) -> &ParticipantId {
        self.inner.channel.local()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The UI event stream. Handed out once.
    pub fn take_events(&self) -> Option<EventStream> {
        self.events.lock().take()
    }

    /// Callee side: starts watching the session for an offer, including one
    /// published before this call was opened.
    pub async fn listen(&self) -> Result<(), CallError> {
        let mut call = self.inner.call.lock().await;
        if call.attempt.is_some() {
            return Ok(());
        }
        let attempt = self.inner.open_attempt(Replay::History).await?;
        call.attempt = Some(attempt);
        Ok(())
    }

    /// Caller side: acquires local media, then opens the connection and publishes an offer.
    pub async fn start_call(&self) -> Result<(), CallError> {
        let mut call = self.inner.call.lock().await;
        if call
            .attempt
            .as_ref()
            .is_some_and(|a| !a.manager.connection_state().is_terminal())
        {
            return Err(NegotiationError::InvalidTransition {
                action: "start a call",
                phase: "in a call",
            }
            .into());
        }
        let result = self.inner.setup_caller(&mut call).await;
        if let Err(err) = &result {
            warn!(error = %err, session = %self.session_id(), "call setup failed");
            self.inner.teardown(&mut call).await;
        }
        result
    }

    /// Callee side: acquires local media and answers the latest offer.
    pub async fn answer_call(&self) -> Result<(), CallError> {
        let mut call = self.inner.call.lock().await;
        let Some(attempt) = call.attempt.as_ref() else {
            return Err(NegotiationError::NoPendingOffer.into());
        };
        if !attempt.manager.has_pending_offer().await {
            return Err(NegotiationError::NoPendingOffer.into());
        }
        let result = self.inner.setup_callee(&mut call).await;
        if let Err(err) = &result {
            warn!(error = %err, session = %self.session_id(), "answer failed");
            self.inner.teardown(&mut call).await;
        }
        result
    }

    pub async fn has_incoming_offer(&self) -> bool {
        let call = self.inner.call.lock().await;
        match call.attempt.as_ref() {
            Some(attempt) => attempt.manager.has_pending_offer().await,
            None => false,
        }
    }

    /// Mutes or unmutes the microphone; returns the new flag.
    pub async fn toggle_audio(&self) -> bool {
        let mut call = self.inner.call.lock().await;
        if call.media.camera_stream().is_none() {
            return false;
        }
        let enabled = call.media.toggle_audio();
        self.inner.events.emit(CallEvent::AudioEnabled(enabled));
        enabled
    }

    /// Turns the camera on or off; returns the new flag. Nothing changes
    /// without a local camera track.
    pub async fn toggle_video(&self) -> bool {
        let mut call = self.inner.call.lock().await;
        if !call.media.camera_stream().is_some_and(MediaStream::has_video) {
            return false;
        }
        let enabled = call.media.toggle_video();
        self.inner.events.emit(CallEvent::VideoEnabled(enabled));
        enabled
    }

    /// Sends the display instead of the camera. When the user ends the share
    /// from the platform's own controls the camera comes back automatically.
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let mut guard = self.inner.call.lock().await;
        let call = &mut *guard;
        if call.media.screen_stream().is_some() {
            return Ok(());
        }
        let Some(attempt) = call.attempt.as_ref() else {
            return Err(CallError::Ended);
        };
        let phase = attempt.manager.phase().await;
        let stream = call.media.acquire_screen_share().await?;
        let Some(track) = stream.video_track().cloned() else {
            call.media.release_screen_share();
            return Err(MediaError::NoMediaDevice.into());
        };
        let replaced = attempt.manager.replace_video_track(Some(&track)).await;
        match replaced {
            Ok(true) => {}
            Ok(false) => {
                call.media.release_screen_share();
                return Err(NegotiationError::InvalidTransition {
                    action: "share the screen",
                    phase,
                }
                .into());
            }
            Err(err) => {
                warn!(error = %err, "screen share not sent, keeping camera");
                call.media.release_screen_share();
                return Err(err);
            }
        }
        call.screen_watch = Some(self.inner.watch_screen(track));
        info!("screen share started");
        self.inner.events.emit(CallEvent::ScreenShare(true));
        Ok(())
    }

    /// Puts the camera back on the video sender and ends the display capture.
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let mut call = self.inner.call.lock().await;
        if let Some(watch) = call.screen_watch.take() {
            watch.abort();
        }
        self.inner.restore_camera(&mut call).await
    }

    /// Starts recording local and remote media. Returns whether a recording is running.
    pub async fn start_recording(&self) -> bool {
        let mut call = self.inner.call.lock().await;
        let local = call
            .media
            .camera_stream()
            .cloned()
            .unwrap_or_else(|| MediaStream::new(Vec::new()));
        let remote: Vec<MediaTrack> = call
            .attempt
            .as_ref()
            .and_then(|a| a.manager.remote_stream())
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default();
        let recording = call.recorder.start(&local, &remote).await;
        self.inner.events.emit(CallEvent::Recording(recording));
        recording
    }

    /// Finalises the recording; the saved file's path, if any.
    pub async fn stop_recording(&self) -> Option<PathBuf> {
        let mut call = self.inner.call.lock().await;
        self.inner.stop_recorder(&mut call).await
    }

    /// Unsubscribes, closes the connection, stops the recorder and every local track.
    pub async fn end_call(&self) {
        let mut call = self.inner.call.lock().await;
        let active = call.attempt.is_some()
            || call.recorder.is_recording()
            || call.media.state().live_track_count() > 0;
        self.inner.teardown(&mut call).await;
        if active {
            info!(session = %self.session_id(), "call ended");
            self.inner.events.emit(CallEvent::Ended);
        }
    }

    /// Resolves once connected; errors when the connection fails or the call ends first.
    pub async fn connected(&self) -> Result<(), CallError> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, ConnectionState::Connected) || s.is_terminal())
            .await
            .map_err(|_| CallError::Ended)?;
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed => Err(CallError::ConnectionFailed),
            _ => Err(CallError::Ended),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub async fn local_stream(&self) -> Option<MediaStream> {
        self.inner.call.lock().await.media.camera_stream().cloned()
    }

    pub async fn screen_stream(&self) -> Option<MediaStream> {
        self.inner.call.lock().await.media.screen_stream().cloned()
    }

    pub async fn remote_stream(&self) -> Option<MediaStream> {
        let call = self.inner.call.lock().await;
        call.attempt.as_ref().and_then(|a| a.manager.remote_stream())
    }

    pub async fn is_audio_enabled(&self) -> bool {
        self.inner.call.lock().await.media.state().audio_enabled
    }

    pub async fn is_video_enabled(&self) -> bool {
        self.inner.call.lock().await.media.state().video_enabled
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.inner.call.lock().await.media.screen_stream().is_some()
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.call.lock().await.recorder.is_recording()
    }
}

impl CallInner {
    async fn open_attempt(&self, replay: Replay) -> Result<Attempt, CallError> {
        let manager = PeerConnectionManager::new(
            self.channel.clone(),
            self.deps.peers.clone(),
            self.deps.ice.clone(),
            self.events.clone(),
            self.deps.config.disconnect_grace,
        );
        manager.listen(replay).await?;
        let forward = forward_state(manager.state_watch(), self.state.clone());
        self.state.send_replace(ConnectionState::New);
        Ok(Attempt { manager, forward })
    }

    async fn setup_caller(&self, call: &mut CallState) -> Result<(), CallError> {
        let tracks = call.media.acquire().await?.tracks().to_vec();
        if let Some(old) = call.attempt.take() {
            close_attempt(old).await;
        }
        let attempt = self.open_attempt(Replay::LiveOnly).await?;
        let attempt = call.attempt.insert(attempt);
        attempt.manager.call(&tracks).await
    }

    async fn setup_callee(&self, call: &mut CallState) -> Result<(), CallError> {
        let tracks = call.media.acquire().await?.tracks().to_vec();
        match call.attempt.as_ref() {
            Some(attempt) => attempt.manager.answer(&tracks).await,
            None => Err(NegotiationError::NoPendingOffer.into()),
        }
    }

    /// Ends the display capture after the user stopped it outside the app.
    fn watch_screen(self: &Arc<Self>, track: MediaTrack) -> JoinHandle<()> {
        let weak: Weak<CallInner> = Arc::downgrade(self);
        tokio::spawn(async move {
            track.ended().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut call = inner.call.lock().await;
            // detach rather than abort: this task is the one running
            drop(call.screen_watch.take());
            info!("screen share ended by the user, falling back to camera");
            if let Err(err) = inner.restore_camera(&mut call).await {
                warn!(error = %err, "camera fallback failed");
            }
        })
    }

    async fn restore_camera(&self, call: &mut CallState) -> Result<(), CallError> {
        if call.media.screen_stream().is_none() {
            return Ok(());
        }
        let camera = call.media.camera_stream().and_then(|s| s.video_track()).cloned();
        let result = match call.attempt.as_ref() {
            Some(attempt) => attempt
                .manager
                .replace_video_track(camera.as_ref())
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        call.media.release_screen_share();
        debug!(camera = camera.is_some(), "screen share stopped");
        self.events.emit(CallEvent::ScreenShare(false));
        result
    }

    async fn stop_recorder(&self, call: &mut CallState) -> Option<PathBuf> {
        if !call.recorder.is_recording() {
            return None;
        }
        let saved = call.recorder.stop().await;
        self.events.emit(CallEvent::Recording(false));
        if let Some(path) = &saved {
            self.events.emit(CallEvent::RecordingSaved(path.clone()));
        }
        saved
    }

    async fn teardown(&self, call: &mut CallState) {
        if let Some(watch) = call.screen_watch.take() {
            watch.abort();
        }
        if let Some(attempt) = call.attempt.take() {
            close_attempt(attempt).await;
            self.state.send_replace(ConnectionState::Closed);
        }
        if call.media.screen_stream().is_some() {
            self.events.emit(CallEvent::ScreenShare(false));
        }
        call.media.release();
        self.stop_recorder(call).await;
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        let call = self.call.get_mut();
        if let Some(watch) = call.screen_watch.take() {
            watch.abort();
        }
        if let Some(attempt) = call.attempt.take() {
            attempt.forward.abort();
        }
        if call.recorder.is_recording() {
            warn!("call dropped while recording, recording discarded");
        }
        call.media.release();
    }
}

async fn close_attempt(attempt: Attempt) {
    attempt.manager.close().await;
    attempt.forward.abort();
}

fn forward_state(
    mut from: watch::Receiver<ConnectionState>,
    to: watch::Sender<ConnectionState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while from.changed().await.is_ok() {
            let state = *from.borrow_and_update();
            to.send_replace(state);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryStore;
    use crate::testing::{FakeDevices, FakeEncoder, LoopbackNetwork};

    fn deps(devices: FakeDevices, network: &LoopbackNetwork) -> CallDeps {
        CallDeps {
            store: Arc::new(MemoryStore::new()),
            ice: Arc::new(StaticIceProvider::default()),
            peers: network.factory(),
            devices: Arc::new(devices),
            encoder: Arc::new(FakeEncoder::new()),
            config: Config {
                recordings_dir: std::env::temp_dir().join("tutor-rtc-call-tests"),
                ..Config::default()
            },
        }
    }

    #[test]
    fn strangers_cannot_join() {
        let network = LoopbackNetwork::new();
        let session = Session::new("lesson", "tutor", "student");
        let result = VideoCall::new(deps(FakeDevices::new(), &network), &session, "eve".into());
        assert!(matches!(result, Err(CallError::NotAMember { .. })));
    }

    #[tokio::test]
    async fn denied_media_aborts_before_signaling() {
        let network = LoopbackNetwork::new();
        let session = Session::new("lesson", "tutor", "student");
        let call = VideoCall::new(
            deps(FakeDevices::new().deny_permission(), &network),
            &session,
            "tutor".into(),
        )
        .expect("member");
        assert_eq!(call.role(), Role::Caller);
        let err = call.start_call().await.expect_err("must fail");
        assert!(matches!(err, CallError::Media(MediaError::PermissionDenied)));
        assert!(network.peers().is_empty());
        assert_eq!(call.connection_state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let network = LoopbackNetwork::new();
        let session = Session::new("lesson", "tutor", "student");
        let call = VideoCall::new(deps(FakeDevices::new(), &network), &session, "student".into())
            .expect("member");
        assert!(matches!(
            call.answer_call().await,
            Err(CallError::Negotiation(NegotiationError::NoPendingOffer))
        ));
        call.listen().await.expect("listen");
        assert!(!call.has_incoming_offer().await);
        assert!(matches!(
            call.answer_call().await,
            Err(CallError::Negotiation(NegotiationError::NoPendingOffer))
        ));
    }

    #[tokio::test]
    async fn toggles_emit_events() {
        let network = LoopbackNetwork::new();
        let session = Session::new("lesson", "tutor", "student");
        let call = VideoCall::new(deps(FakeDevices::new(), &network), &session, "tutor".into())
            .expect("member");
        let mut events = call.take_events().expect("events");
        assert!(call.take_events().is_none());
        call.start_call().await.expect("call");
        assert!(!call.toggle_audio().await);
        assert!(!call.is_audio_enabled().await);
        assert!(call.is_video_enabled().await);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&CallEvent::AudioEnabled(false)));
    }

    #[tokio::test]
    async fn toggles_without_local_media_are_silent() {
        let network = LoopbackNetwork::new();
        let session = Session::new("lesson", "tutor", "student");
        let call = VideoCall::new(deps(FakeDevices::new(), &network), &session, "tutor".into())
            .expect("member");
        let mut events = call.take_events().expect("events");
        assert!(!call.toggle_audio().await);
        assert!(!call.toggle_video().await);
        assert!(events.try_recv().is_err());

        let audio_only = VideoCall::new(
            deps(FakeDevices::new().without_camera(), &network),
            &session,
            "tutor".into(),
        )
        .expect("member");
        let mut events = audio_only.take_events().expect("events");
        audio_only.start_call().await.expect("call");
        while events.try_recv().is_ok() {}
        assert!(!audio_only.toggle_video().await);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn screen_share_needs_a_call() {
        let network = LoopbackNetwork::new();
        let session = Session::new("lesson", "tutor", "student");
        let devices = FakeDevices::new();
        let call = VideoCall::new(deps(devices, &network), &session, "tutor".into())
            .expect("member");
        assert!(matches!(call.start_screen_share().await, Err(CallError::Ended)));
        assert!(!call.is_screen_sharing().await);
    }
}
