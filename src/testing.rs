//! In-process stand-ins for the platform: capture devices, peer connections,
//! the encoder and the signaling store. Used by the test-suite and for offline
//! runs of the call logic.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{DeviceError, PeerError, RecorderError, SignalingError};
use crate::media::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind, TrackSource};
use crate::peer::ice::IceServerDescriptor;
use crate::peer::transport::{PeerEvent, PeerEvents, PeerFactory, PeerTransport};
use crate::peer::types::{ConnectionState, IceCandidate, SdpType, SessionDescription};
use crate::recorder::{EncoderSession, MediaEncoder, PREFERRED_MIME_TYPES};
use crate::session::SessionId;
use crate::signaling::{NewSignalingMessage, SignalingMessage, SignalingStore};
use crate::whiteboard::{Rgba, Surface};

/// Camera, microphone and display capture that count what they hand out.
pub struct FakeDevices {
    camera: bool,
    microphone: bool,
    permission: bool,
    display: bool,
    issued: AtomicUsize,
    stopped: Arc<AtomicUsize>,
    screens: Mutex<Vec<MediaTrack>>,
}

impl Default for FakeDevices {
    fn default() -> Self {
        Self {
            camera: true,
            microphone: true,
            permission: true,
            display: true,
            issued: AtomicUsize::new(0),
            stopped: Arc::new(AtomicUsize::new(0)),
            screens: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    pub fn deny_permission(mut self) -> Self {
        self.permission = false;
        self
    }

    pub fn without_display(mut self) -> Self {
        self.display = false;
        self
    }

    pub fn issued_tracks(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn stopped_tracks(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ends the latest display capture as if the user pressed "stop sharing".
    pub fn end_screen_share(&self) -> bool {
        self.screens.lock().last().is_some_and(|t| t.stop())
    }

    fn track(&self, kind: TrackKind, source: TrackSource, label: &str) -> MediaTrack {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let stopped = self.stopped.clone();
        MediaTrack::new(kind, source, label).on_stop(move || {
            stopped.fetch_add(1, Ordering::SeqCst);
        })
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<MediaStream, DeviceError> {
        if !self.permission {
            return Err(DeviceError::PermissionDenied);
        }
        if (constraints.video && !self.camera) || (constraints.audio && !self.microphone) {
            return Err(DeviceError::NotFound);
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.track(TrackKind::Audio, TrackSource::Microphone, "fake microphone"));
        }
        if constraints.video {
            tracks.push(self.track(TrackKind::Video, TrackSource::Camera, "fake camera"));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn display_media(&self) -> Result<MediaStream, DeviceError> {
        if !self.permission {
            return Err(DeviceError::PermissionDenied);
        }
        if !self.display {
            return Err(DeviceError::NotFound);
        }
        let track = self.track(TrackKind::Video, TrackSource::Screen, "fake display");
        self.screens.lock().push(track.clone());
        Ok(MediaStream::new(vec![track]))
    }
}

#[derive(Default)]
struct NetworkInner {
    peers: Vec<Arc<LoopbackPeer>>,
    ice_servers: Vec<Vec<IceServerDescriptor>>,
}

/// Registry of loopback peers. Two peers connect once each has both
/// descriptions and at least one candidate from the other side.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn PeerFactory> {
        Arc::new(LoopbackFactory {
            network: self.clone(),
        })
    }

    /// A peer whose events nobody reads.
    pub fn peer(&self) -> Arc<dyn PeerTransport> {
        let (peer, _events) = self.create_peer();
        peer
    }

    /// Every peer created so far, oldest first.
    pub fn peers(&self) -> Vec<Arc<LoopbackPeer>> {
        self.inner.lock().peers.clone()
    }

    /// ICE server lists handed to the factory, one per created peer.
    pub fn ice_servers_seen(&self) -> Vec<Vec<IceServerDescriptor>> {
        self.inner.lock().ice_servers.clone()
    }

    fn create_peer(&self) -> (Arc<LoopbackPeer>, PeerEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let peer = Arc::new(LoopbackPeer {
            id: format!("peer{}", inner.peers.len()),
            port: 40000 + inner.peers.len() as u16 * 10,
            events: tx,
            state: Mutex::new(PeerState::default()),
        });
        inner.peers.push(peer.clone());
        (peer, rx)
    }
}

struct LoopbackFactory {
    network: LoopbackNetwork,
}

#[async_trait]
impl PeerFactory for LoopbackFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerDescriptor],
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), PeerError> {
        self.network
            .inner
            .lock()
            .ice_servers
            .push(ice_servers.to_vec());
        let (peer, events) = self.network.create_peer();
        let peer: Arc<dyn PeerTransport> = peer;
        Ok((peer, events))
    }
}

#[derive(Default)]
struct PeerState {
    tracks: Vec<MediaTrack>,
    video: Option<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    answerer: bool,
    candidates: Vec<IceCandidate>,
    connection: ConnectionState,
    history: Vec<ConnectionState>,
    replacements: usize,
}

/// Fake peer connection. Its SDP lists the outbound tracks so the other side
/// can surface them as remote tracks.
pub struct LoopbackPeer {
    id: String,
    port: u16,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_answerer(&self) -> bool {
        self.state.lock().answerer
    }

    /// Every state this peer went through, in order.
    pub fn state_history(&self) -> Vec<ConnectionState> {
        self.state.lock().history.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        self.state.lock().tracks.clone()
    }

    /// Id of the track currently feeding the video sender.
    pub fn outbound_video(&self) -> Option<String> {
        self.state.lock().video.as_ref().map(|t| t.id().to_string())
    }

    pub fn replacements(&self) -> usize {
        self.state.lock().replacements
    }

    /// Simulates a network-driven state change.
    pub fn force_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        self.transition(&mut state, next);
    }

    fn transition(&self, state: &mut PeerState, next: ConnectionState) {
        if state.connection == next {
            return;
        }
        state.connection = next;
        state.history.push(next);
        let _ = self.events.send(PeerEvent::StateChanged(next));
    }

    fn progress(&self, state: &mut PeerState) {
        if state.connection == ConnectionState::New && state.local.is_some() && state.remote.is_some() {
            self.transition(state, ConnectionState::Connecting);
        }
        if state.connection == ConnectionState::Connecting && !state.candidates.is_empty() {
            self.transition(state, ConnectionState::Connected);
        }
    }

    fn describe(&self, kind: SdpType, tracks: &[MediaTrack]) -> SessionDescription {
        let mut sdp = format!("v=0\r\no=loopback {}\r\n", self.id);
        for track in tracks {
            let kind = match track.kind() {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("a=track:{} {kind}\r\n", track.id()));
        }
        SessionDescription { kind, sdp }
    }

    fn remote_tracks(sdp: &str) -> Vec<MediaTrack> {
        sdp.lines()
            .filter_map(|line| line.strip_prefix("a=track:"))
            .filter_map(|rest| {
                let (id, kind) = rest.split_once(' ')?;
                let kind = match kind.trim() {
                    "audio" => TrackKind::Audio,
                    "video" => TrackKind::Video,
                    _ => return None,
                };
                Some(MediaTrack::remote(id, kind))
            })
            .collect()
    }

    fn ensure_open(state: &PeerState) -> Result<(), PeerError> {
        if state.connection == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if track.kind() == TrackKind::Video {
            state.video = Some(track.clone());
        }
        state.tracks.push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        Ok(self.describe(SdpType::Offer, &state.tracks))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !state.remote.as_ref().is_some_and(|d| d.kind == SdpType::Offer) {
            return Err(PeerError::Other("no remote offer to answer".into()));
        }
        state.answerer = true;
        Ok(self.describe(SdpType::Answer, &state.tracks))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        state.local = Some(desc);
        for (n, typ) in ["host", "srflx"].into_iter().enumerate() {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{n} 1 udp {} 127.0.0.1 {} typ {typ}",
                    2130706431 - n as u32,
                    self.port + n as u16
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
        let _ = self.events.send(PeerEvent::GatheringComplete);
        self.progress(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        for track in Self::remote_tracks(&desc.sdp) {
            let _ = self.events.send(PeerEvent::RemoteTrack(track));
        }
        state.remote = Some(desc);
        self.progress(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.remote.is_none() {
            return Err(PeerError::Other(
                "remote description not set, candidate rejected".into(),
            ));
        }
        state.candidates.push(candidate);
        self.progress(&mut state);
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if !state.tracks.iter().any(|t| t.kind() == TrackKind::Video) {
            return Err(PeerError::NoVideoSender);
        }
        state.video = track.cloned();
        state.replacements += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        self.transition(&mut state, ConnectionState::Closed);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }
}

/// Signaling store wrapper whose appends can be made to fail.
pub struct FlakyStore<S> {
    inner: S,
    fail_appends: AtomicBool,
    failed: AtomicUsize,
}

impl<S: SignalingStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_appends: AtomicBool::new(false),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn failed_appends(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: SignalingStore> SignalingStore for FlakyStore<S> {
    async fn append(
        &self,
        message: NewSignalingMessage,
    ) -> Result<SignalingMessage, SignalingError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(SignalingError::Publish("store unavailable".into()));
        }
        self.inner.append(message).await
    }

    async fn history(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SignalingMessage>, SignalingError> {
        self.inner.history(session_id).await
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, SignalingError> {
        self.inner.subscribe(session_id).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceOp {
    Point { x: f32, y: f32 },
    Clear,
}

/// Surface that records paint calls instead of rasterising.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    pub ops: Vec<SurfaceOp>,
}

impl Surface for RecordingSurface {
    fn paint_point(&mut self, x: f32, y: f32, _color: Rgba, _size: f32) {
        self.ops.push(SurfaceOp::Point { x, y });
    }

    fn clear(&mut self) {
        self.ops.push(SurfaceOp::Clear);
    }
}

#[derive(Default)]
struct EncoderLog {
    sessions: usize,
    tracks: Vec<String>,
    mime_type: Option<String>,
    live_at_stop: Option<usize>,
}

/// Encoder that emits a header chunk on start and one chunk per track on stop.
pub struct FakeEncoder {
    supported: HashSet<String>,
    fail_start: bool,
    log: Arc<Mutex<EncoderLog>>,
}

impl FakeEncoder {
    /// Supports every preferred container.
    pub fn new() -> Self {
        Self::supporting(&PREFERRED_MIME_TYPES)
    }

    pub fn supporting(mime_types: &[&str]) -> Self {
        Self {
            supported: mime_types.iter().map(|m| m.to_string()).collect(),
            fail_start: false,
            log: Arc::default(),
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn sessions_started(&self) -> usize {
        self.log.lock().sessions
    }

    /// Track ids of the last stream handed to the encoder.
    pub fn recorded_tracks(&self) -> Vec<String> {
        self.log.lock().tracks.clone()
    }

    pub fn mime_type(&self) -> Option<String> {
        self.log.lock().mime_type.clone()
    }

    /// How many recorded tracks were still live when the last session stopped.
    pub fn live_tracks_at_stop(&self) -> Option<usize> {
        self.log.lock().live_at_stop
    }
}

impl Default for FakeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEncoder for FakeEncoder {
    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported.contains(mime_type)
    }

    async fn start(
        &self,
        stream: &MediaStream,
        mime_type: &str,
        chunks: mpsc::UnboundedSender<Bytes>,
    ) -> Result<Box<dyn EncoderSession>, RecorderError> {
        if self.fail_start {
            return Err(RecorderError::Encoder("encoder refused to start".into()));
        }
        let tracks: Vec<String> = stream.tracks().iter().map(|t| t.id().to_string()).collect();
        {
            let mut log = self.log.lock();
            log.sessions += 1;
            log.tracks = tracks.clone();
            log.mime_type = Some(mime_type.to_string());
        }
        let _ = chunks.send(Bytes::from_static(&[0x1a, 0x45, 0xdf, 0xa3]));
        Ok(Box::new(FakeEncoderSession {
            stream: stream.clone(),
            tracks,
            chunks,
            log: self.log.clone(),
        }))
    }
}

struct FakeEncoderSession {
    stream: MediaStream,
    tracks: Vec<String>,
    chunks: mpsc::UnboundedSender<Bytes>,
    log: Arc<Mutex<EncoderLog>>,
}

#[async_trait]
impl EncoderSession for FakeEncoderSession {
    async fn stop(self: Box<Self>) -> Result<(), RecorderError> {
        self.log.lock().live_at_stop = Some(self.stream.live_track_count());
        for track in &self.tracks {
            let _ = self.chunks.send(Bytes::from(format!("track:{track};")));
        }
        Ok(())
    }
}
