//! Peer-to-peer video session core for one-to-one tutoring calls: signaling
//! over an append-only session log, offer/answer negotiation with trickle ICE,
//! local capture with audio-only fallback, screen share by track replacement,
//! local recording and a shared whiteboard.

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod recorder;
pub mod session;
pub mod signaling;
pub mod testing;
pub mod utils;
pub mod whiteboard;

pub use call::{CallDeps, VideoCall};
pub use config::Config;
pub use error::{CallError, MediaError, NegotiationError, PeerError, SignalingError};
pub use events::{CallEvent, EventStream};
pub use media::{MediaSample, MediaStream, MediaTrack, TrackKind};
pub use peer::ConnectionState;
pub use session::{ParticipantId, Role, Session, SessionId};
pub use signaling::{MemoryStore, SignalingChannel, SignalingStore};
