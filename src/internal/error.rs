use thiserror::Error;

use crate::ParticipantId;

#[derive(Debug, Error)]
pub enum SessionError {
    /// the relay could not be reached
    #[error("signal channel unavailable: {0}")]
    ChannelUnavailable(String),
    /// transient. the session attempt survives it
    #[error("failed to publish signal: {0}")]
    PublishFailed(String),
    #[error("local and remote participant share the id {0}")]
    IdentityCollision(ParticipantId),
    /// an envelope that makes no sense in the current phase. logged and ignored
    #[error("protocol anomaly: {0}")]
    ProtocolAnomaly(String),
    #[error("media transport failure: {0}")]
    TransportFailure(String),
    #[error("malformed signal: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid room: {0}")]
    InvalidRoom(String),
    #[error("already joined a room")]
    AlreadyJoined,
    #[error("no connected session")]
    NotConnected,
}

impl SessionError {
    /// errors which end the session attempt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::IdentityCollision(_) | SessionError::TransportFailure(_)
        )
    }
}
