use thiserror::Error;

/// Raw failure reported by the platform device layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("requested device not found")]
    NotFound,
    #[error("device not readable: {0}")]
    NotReadable(String),
}

/// Local media could not be acquired; call setup is aborted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("permission to use the camera, microphone or display was denied")]
    PermissionDenied,
    #[error("no usable camera or microphone")]
    NoMediaDevice,
}

impl From<DeviceError> for MediaError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::PermissionDenied => MediaError::PermissionDenied,
            DeviceError::NotFound | DeviceError::NotReadable(_) => MediaError::NoMediaDevice,
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to publish signaling message: {0}")]
    Publish(String),
    #[error("failed to subscribe to session {session}: {reason}")]
    Subscribe { session: String, reason: String },
    #[error("failed to decode signaling row: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid signaling endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
    #[error("peer connection is closed")]
    Closed,
    #[error("no outbound video sender")]
    NoVideoSender,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
    #[error("answer received while {phase}")]
    UnexpectedAnswer { phase: &'static str },
    #[error("offer received while {phase}")]
    UnexpectedOffer { phase: &'static str },
    #[error("no offer to answer")]
    NoPendingOffer,
    #[error("cannot {action} while {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: &'static str,
    },
    #[error("peer rejected negotiation step: {0}")]
    Peer(#[from] PeerError),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("no supported recording container")]
    Unsupported,
    #[error("encoder failed: {0}")]
    Encoder(String),
    #[error("failed to write recording: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned from the imperative call surface.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("peer connection failed")]
    ConnectionFailed,
    #[error("call has ended")]
    Ended,
    #[error("{participant} is not a member of session {session}")]
    NotAMember { session: String, participant: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}
