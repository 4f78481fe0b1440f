pub mod connection;
pub mod ice;
pub mod manager;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{check_ice_server, RtcPeer, RtcPeerFactory};
pub use ice::{HttpIceProvider, IceConfigProvider, IceServerDescriptor, StaticIceProvider};
pub use manager::PeerConnectionManager;
pub use state::Negotiation;
pub use transport::{PeerEvent, PeerEvents, PeerFactory, PeerTransport};
pub use types::{ConnectionState, IceCandidate, SdpType, SessionDescription};
