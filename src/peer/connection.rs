//! webrtc-rs backed peer connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::PeerError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::media::{MediaSample, MediaTrack, TrackKind};
use crate::peer::ice::{to_rtc_ice_servers, IceServerDescriptor};
use crate::peer::transport::{PeerEvent, PeerEvents, PeerFactory, PeerTransport};
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};

const STREAM_ID: &str = "tutor-rtc";

fn build_api() -> Result<API, PeerError> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_config(ice_servers: &[IceServerDescriptor]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: to_rtc_ice_servers(ice_servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

/// Creates [`RtcPeer`]s from one shared webrtc-rs API instance.
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        Ok(Self { api: build_api()? })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerDescriptor],
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(ice_servers)).await?);
        let (tx, rx) = mpsc::unbounded_channel();
        attach_handlers(&pc, tx);
        info!(servers = ice_servers.len(), "peer connection created");
        let peer: Arc<dyn PeerTransport> = Arc::new(RtcPeer {
            pc,
            outbound: Mutex::new(HashMap::new()),
            video_sender: Mutex::new(None),
        });
        Ok((peer, rx))
    }
}

fn attach_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            match cand {
                Some(c) => {
                    dump_candidate("LOCAL", &c);
                    match c.to_json() {
                        Ok(init) => {
                            let _ = tx.send(PeerEvent::LocalCandidate(init.into()));
                        }
                        Err(err) => warn!(error = %err, "local candidate not serialisable"),
                    }
                }
                // end of gathering
                None => {
                    let _ = tx.send(PeerEvent::GatheringComplete);
                }
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(|state| {
        debug!(?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    let tx = events.clone();
    let weak = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!(state = %st, "peer connection state changed");
        if matches!(
            st,
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
        ) {
            if let Some(pc) = weak.upgrade() {
                tokio::spawn(async move {
                    dump_selected_pair(&pc, "BEFORE-FAIL").await;
                });
            }
        }
        let _ = tx.send(PeerEvent::StateChanged(st.into()));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let media = MediaTrack::remote(track.id(), kind);
        info!(id = %media.id(), ?kind, "remote track received");
        let _ = tx.send(PeerEvent::RemoteTrack(media.clone()));
        // drain until the remote side stops sending
        tokio::spawn(async move {
            while track.read_rtp().await.is_ok() {}
            debug!(id = %media.id(), "remote track ended");
            media.stop();
        });
        Box::pin(async {})
    }));
}

/// Drops frames while the source track is disabled. The next written frame
/// carries the skip count so the packetizer advances RTP timestamps past the gap.
#[derive(Debug, Default)]
struct SampleGate {
    dropped: u16,
}

impl SampleGate {
    fn admit(&mut self, enabled: bool, sample: MediaSample) -> Option<Sample> {
        if !enabled {
            self.skip(1);
            return None;
        }
        let sample = Sample {
            data: sample.data,
            duration: sample.duration,
            prev_dropped_packets: self.dropped,
            ..Default::default()
        };
        self.dropped = 0;
        Some(sample)
    }

    fn skip(&mut self, frames: u64) {
        let frames = u16::try_from(frames).unwrap_or(u16::MAX);
        self.dropped = self.dropped.saturating_add(frames);
    }
}

/// Copies a track's captured frames into its outbound RTP track until the track ends.
fn spawn_sample_pump(track: MediaTrack, outbound: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut samples = track.subscribe_samples();
    tokio::spawn(async move {
        let ended = track.ended();
        tokio::pin!(ended);
        let mut gate = SampleGate::default();
        loop {
            let sample = tokio::select! {
                _ = &mut ended => break,
                next = samples.recv() => match next {
                    Ok(sample) => sample,
                    Err(RecvError::Lagged(missed)) => {
                        gate.skip(missed);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            let Some(sample) = gate.admit(track.is_enabled(), sample) else {
                continue;
            };
            if let Err(err) = outbound.write_sample(&sample).await {
                trace!(id = %track.id(), error = %err, "sample not written");
            }
        }
        debug!(id = %track.id(), "sample pump stopped");
    })
}

struct Outbound {
    rtp: Arc<TrackLocalStaticSample>,
    pump: JoinHandle<()>,
}

/// One webrtc-rs peer connection.
///
/// Each outbound [`MediaTrack`] gets a [`TrackLocalStaticSample`] fed by a pump
/// task, so whatever the capture layer pushes into the track goes out as RTP.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    outbound: Mutex<HashMap<String, Outbound>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    fn outbound_track(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let mut outbound = self.outbound.lock();
        if let Some(existing) = outbound.get(track.id()) {
            return existing.rtp.clone();
        }
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            STREAM_ID.to_string(),
        ));
        let pump = spawn_sample_pump(track.clone(), rtp.clone());
        outbound.insert(
            track.id().to_string(),
            Outbound {
                rtp: rtp.clone(),
                pump,
            },
        );
        rtp
    }

    fn stop_pumps(&self) {
        for (_, outbound) in self.outbound.lock().drain() {
            outbound.pump.abort();
        }
    }
}

impl Drop for RtcPeer {
    fn drop(&mut self) {
        self.stop_pumps();
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError> {
        let rtp = self.outbound_track(track);
        let sender = self
            .pc
            .add_track(rtp as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock() = Some(sender.clone());
        }
        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        debug!(id = %track.id(), kind = ?track.kind(), "local track added");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.pc.create_offer(None).await?.try_into()
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.pc.create_answer(None).await?.try_into()
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(desc.try_into()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(desc.try_into()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        debug!(candidate = %candidate.candidate, "applying remote candidate");
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), PeerError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or(PeerError::NoVideoSender)?;
        let replacement = track.map(|t| self.outbound_track(t) as Arc<dyn TrackLocal + Send + Sync>);
        sender.replace_track(replacement).await?;
        debug!(track = ?track.map(MediaTrack::id), "outbound video replaced");
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.stop_pumps();
        self.pc.close().await?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }
}

/// Checks that a single STUN or TURN server answers: gathers against it alone
/// and waits for a server-reflexive (STUN) or relay (TURN) candidate.
pub async fn check_ice_server(server: &IceServerDescriptor, wait: Duration) -> bool {
    let Some(server) = server.clone().normalized() else {
        return false;
    };
    let wanted = if server.is_turn() { "relay" } else { "srflx" };
    info!(urls = ?server.urls, wanted, "checking ICE server");

    let api = APIBuilder::new().build();
    let config = RTCConfiguration {
        ice_servers: to_rtc_ice_servers(std::slice::from_ref(&server)),
        ..Default::default()
    };
    let pc = match api.new_peer_connection(config).await {
        Ok(pc) => Arc::new(pc),
        Err(err) => {
            warn!(error = %err, "check peer connection not created");
            return false;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
    let found = tx.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = found.clone();
        Box::pin(async move {
            if let Some(c) = cand {
                if let Ok(init) = c.to_json() {
                    let candidate = IceCandidate::from(init);
                    if candidate.candidate_type() == Some(wanted) {
                        let _ = tx.send(true);
                    }
                }
            }
        })
    }));
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        if state == RTCIceGathererState::Complete {
            let _ = tx.send(false);
        }
        Box::pin(async {})
    }));

    let started = async {
        pc.create_data_channel("ice-check", None).await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await
    };
    if let Err(err) = started.await {
        warn!(error = %err, "check gathering not started");
        let _ = pc.close().await;
        return false;
    }

    let reachable = matches!(timeout(wait, rx.recv()).await, Ok(Some(true)));
    if let Err(err) = pc.close().await {
        debug!(error = %err, "check connection close failed");
    }
    info!(urls = ?server.urls, reachable, "ICE server check finished");
    reachable
}
