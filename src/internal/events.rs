use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::{Candidate, Description, Role, SessionError};

/// connection state reported by the media transport
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// emitted by a MediaTransport. the session agent consumes these one at a time
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// a local candidate was discovered and must be sent to the peer
    LocalCandidate(Candidate),
    StateChanged(TransportState),
    /// data received over the application channel of an established connection
    ApplicationMessage(Bytes),
}

/// the black box which turns descriptions and candidates into a connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_local_description(&self, role: Role) -> Result<Description>;
    async fn apply_remote_description(&self, description: Description) -> Result<()>;
    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()>;
    async fn send_application_message(&self, data: Bytes) -> Result<()>;
    /// must be safe to call more than once
    async fn close(&self);
}

/// creates one fresh transport per session attempt. the transport reports
/// its events on `events`
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, SessionError>;
}
