use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::media::MediaTrack;
use crate::peer::ice::IceServerDescriptor;
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription};

/// Asynchronous notifications raised by a peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    StateChanged(ConnectionState),
    RemoteTrack(MediaTrack),
}

/// The peer-connection primitive: SDP negotiation, candidates, outbound tracks.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), PeerError>;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Swaps the source of the outbound video sender without renegotiating.
    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;

    fn connection_state(&self) -> ConnectionState;
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// Creates one peer connection per call attempt.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerDescriptor],
    ) -> Result<(Arc<dyn PeerTransport>, PeerEvents), PeerError>;
}
