// testing
// stand-ins for the media transport, so the signaling logic can be driven
// without a network. `LocalRelay` plays the same role for the signal channel.

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{
    Candidate, Description, MediaTransport, Role, SessionError, TransportEvent, TransportFactory,
    TransportState,
};

/// every call made on a [`FakeTransport`], in order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    CreateLocalDescription(Role),
    ApplyRemoteDescription(Description),
    AddRemoteCandidate(Candidate),
    SendApplicationMessage(Bytes),
    Close,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<TransportCall>,
    created_local: bool,
    applied_remote: bool,
    connected: bool,
    fail_descriptions: bool,
}

/// records calls and lets the test decide which events happen
pub struct FakeTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<FakeState>,
    auto_connect: bool,
    description_delay: Option<Duration>,
}

impl FakeTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            state: Mutex::new(FakeState::default()),
            auto_connect: false,
            description_delay: None,
        }
    }

    /// description operations take `delay` to complete, like a real
    /// transport gathering or parsing
    pub fn with_description_delay(mut self, delay: Duration) -> Self {
        self.description_delay = Some(delay);
        self
    }

    /// reports `connected` as soon as both descriptions are in place
    pub fn auto_connecting(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            auto_connect: true,
            ..Self::new(events)
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.clone()
    }

    /// makes every later description operation fail
    pub fn fail_descriptions(&self) {
        self.state.lock().fail_descriptions = true;
    }

    pub fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            log::debug!("fake transport event dropped: nobody listening");
        }
    }

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push(call);
    }

    async fn pause(&self) {
        if let Some(delay) = self.description_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn maybe_connect(&self) {
        let ready = {
            let mut state = self.state.lock();
            let ready = self.auto_connect
                && state.created_local
                && state.applied_remote
                && !state.connected;
            if ready {
                state.connected = true;
            }
            ready
        };
        if ready {
            self.emit(TransportEvent::StateChanged(TransportState::Connected));
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn create_local_description(&self, role: Role) -> Result<Description> {
        self.record(TransportCall::CreateLocalDescription(role));
        self.pause().await;
        let kind = {
            let mut state = self.state.lock();
            if state.fail_descriptions {
                bail!("description creation refused");
            }
            state.created_local = true;
            match role {
                Role::Initiator => "offer",
                _ => "answer",
            }
        };
        self.maybe_connect();
        Ok(Description::new(json!({ "type": kind, "sdp": "fake" })))
    }

    async fn apply_remote_description(&self, description: Description) -> Result<()> {
        self.record(TransportCall::ApplyRemoteDescription(description));
        self.pause().await;
        {
            let mut state = self.state.lock();
            if state.fail_descriptions {
                bail!("remote description refused");
            }
            state.applied_remote = true;
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<()> {
        self.record(TransportCall::AddRemoteCandidate(candidate));
        Ok(())
    }

    async fn send_application_message(&self, data: Bytes) -> Result<()> {
        self.record(TransportCall::SendApplicationMessage(data));
        Ok(())
    }

    async fn close(&self) {
        self.record(TransportCall::Close);
    }
}

/// hands out [`FakeTransport`]s and keeps them reachable for assertions
#[derive(Default)]
pub struct FakeTransportFactory {
    auto_connect: bool,
    description_delay: Option<Duration>,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn auto_connecting() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            ..Self::default()
        })
    }

    /// transports whose description operations are slow
    pub fn with_description_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            description_delay: Some(delay),
            ..Self::default()
        })
    }

    /// the transport of the most recent attempt
    pub fn latest(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn MediaTransport>, SessionError> {
        let mut transport = if self.auto_connect {
            FakeTransport::auto_connecting(events)
        } else {
            FakeTransport::new(events)
        };
        if let Some(delay) = self.description_delay {
            transport = transport.with_description_delay(delay);
        }
        let transport = Arc::new(transport);
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}
