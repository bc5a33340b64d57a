use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

mod internal;
pub mod testing;

use crate::internal::agent::{Agent, Callbacks};

// public exports
pub use internal::agent::{accept as accept_signal, MessageCallback, StatusCallback};
pub use internal::arbiter::decide;
pub use internal::channel::{ChannelMessage, LocalChannel, LocalRelay, SignalChannel};
pub use internal::config::SessionConfig;
pub use internal::data_types::*;
pub use internal::envelope::{Signal, SignalEnvelope, SignalKind};
pub use internal::error::SessionError;
pub use internal::events::*;
pub use internal::negotiation::Negotiation;
pub use internal::webrtc_transport::{WebRtcTransport, WebRtcTransportFactory, APPLICATION_CHANNEL};

/// duo-webrtc
/// Establishes a direct WebRTC connection between exactly two participants
/// using nothing but a shared room name and a publish/subscribe relay.
///
/// Both sides join the same room and announce themselves. The participant
/// with the larger id creates the offer, the other answers. Candidates which
/// arrive before a remote description are buffered and applied afterwards,
/// so the relay may reorder and duplicate freely.
///
/// The relay is anything implementing [`SignalChannel`]; the media side is
/// anything implementing [`TransportFactory`]. [`WebRtcTransportFactory`]
/// provides the webrtc-rs implementation, [`LocalRelay`] an in-process relay.
///
/// A `Controller` runs at most one session attempt at a time. Every attempt
/// gets a fresh transport, event queue and participant id (unless one was
/// fixed through [`InitArgs`]).
pub struct Controller {
    /// fixed id, otherwise one is generated per attempt
    id: Option<ParticipantId>,
    config: SessionConfig,
    channel: Arc<dyn SignalChannel>,
    transports: Arc<dyn TransportFactory>,
    callbacks: Arc<Callbacks>,
    attempt: Option<Attempt>,
    /// what the last attempt looked like once it was left
    last_snapshot: Option<AttemptSnapshot>,
}

// a lazy version of the builder pattern
pub struct InitArgs {
    pub id: Option<ParticipantId>,
    pub config: SessionConfig,
    pub channel: Arc<dyn SignalChannel>,
    pub transports: Arc<dyn TransportFactory>,
}

struct Attempt {
    topic: String,
    transport: Arc<dyn MediaTransport>,
    snapshot: watch::Receiver<AttemptSnapshot>,
    task: JoinHandle<()>,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The following functions are driven by the UI:
/// join
/// leave
/// send_application_message
/// on_connection_state_change
/// on_application_message
///
/// Everything else is driven by the relay and the transport from the
/// attempt's own task.
impl Controller {
    pub fn init(args: InitArgs) -> Self {
        Self {
            id: args.id,
            config: args.config,
            channel: args.channel,
            transports: args.transports,
            callbacks: Arc::new(Callbacks::default()),
            attempt: None,
            last_snapshot: None,
        }
    }

    /// registers the status callback. replaces any previous one
    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(SessionStatus) + Send + Sync + 'static,
    ) {
        *self.callbacks.status.lock() = Some(Arc::new(callback));
    }

    /// registers the receiver for data arriving over the established connection
    pub fn on_application_message(&self, callback: impl Fn(Bytes) + Send + Sync + 'static) {
        *self.callbacks.message.lock() = Some(Arc::new(callback));
    }

    /// connects to the relay, subscribes to the room and starts negotiating
    /// in the background
    pub async fn join(&mut self, room: &RoomId) -> Result<(), SessionError> {
        if self.attempt.is_some() {
            return Err(SessionError::AlreadyJoined);
        }
        self.callbacks.report(SessionStatus::Connecting);
        let topic = room.topic(&self.config.topic_prefix);
        log::info!("joining {}", topic);

        if let Err(e) = self.channel.connect().await {
            log::error!("{}", e);
            self.callbacks.report(SessionStatus::Failed);
            return Err(e);
        }
        let inbound = match self.channel.subscribe(&topic).await {
            Ok(inbound) => inbound,
            Err(e) => {
                log::error!("failed to subscribe to {}: {}", topic, e);
                self.callbacks.report(SessionStatus::Failed);
                return Err(e);
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let transport = match self.transports.create(event_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                log::error!("failed to create media transport: {}", e);
                self.channel.unsubscribe(&topic).await;
                self.callbacks.report(SessionStatus::Failed);
                return Err(e);
            }
        };

        let local_id = self.id.clone().unwrap_or_else(ParticipantId::generate);
        log::info!("participating as {}", local_id);
        let negotiation = Negotiation::new(local_id.clone(), transport.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(AttemptSnapshot {
            local_id,
            phase: negotiation.phase(),
            role: negotiation.role(),
            remote_id: None,
            last_error: None,
        });

        let agent = Agent {
            negotiation,
            channel: self.channel.clone(),
            topic: topic.clone(),
            inbound,
            transport_events: event_rx,
            snapshot: snapshot_tx,
            callbacks: self.callbacks.clone(),
            presence_interval: self.config.presence_interval(),
            max_presence_announcements: self.config.max_presence_announcements,
            last_error: None,
        };
        let task = tokio::spawn(agent.run());

        self.last_snapshot = None;
        self.attempt = Some(Attempt {
            topic,
            transport,
            snapshot: snapshot_rx,
            task,
        });
        Ok(())
    }

    /// ends the current attempt from whatever state it is in. pending work and
    /// queued events are discarded; nothing is published afterwards
    pub async fn leave(&mut self) {
        let mut attempt = match self.attempt.take() {
            Some(attempt) => attempt,
            None => {
                log::debug!("leave called without an active attempt");
                return;
            }
        };

        attempt.task.abort();
        if let Err(e) = (&mut attempt.task).await {
            if !e.is_cancelled() {
                log::error!("session task ended abnormally: {}", e);
            }
        }
        attempt.transport.close().await;
        self.channel.unsubscribe(&attempt.topic).await;

        let mut snapshot = attempt.snapshot.borrow().clone();
        snapshot.phase = Phase::Closed;
        self.last_snapshot = Some(snapshot);
        log::info!("left {}", attempt.topic);
        self.callbacks.report(SessionStatus::Disconnected);
    }

    /// sends data over the established connection
    pub async fn send_application_message(&self, data: Bytes) -> Result<(), SessionError> {
        let attempt = match &self.attempt {
            Some(attempt) if attempt.snapshot.borrow().phase == Phase::Connected => attempt,
            _ => return Err(SessionError::NotConnected),
        };
        attempt
            .transport
            .send_application_message(data)
            .await
            .map_err(|e| SessionError::TransportFailure(e.to_string()))
    }

    /// the current attempt, or the last one if it was left
    pub fn snapshot(&self) -> Option<AttemptSnapshot> {
        match &self.attempt {
            Some(attempt) => Some(attempt.snapshot.borrow().clone()),
            None => self.last_snapshot.clone(),
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        self.snapshot().map(|s| s.phase)
    }

    /// waits until the current attempt reaches `phase`. returns false on
    /// timeout or when the attempt ended in another phase
    pub async fn wait_for_phase(&self, phase: Phase, timeout: Duration) -> bool {
        let mut rx = match &self.attempt {
            Some(attempt) => attempt.snapshot.clone(),
            None => return self.phase() == Some(phase),
        };
        let reached = async {
            loop {
                let current = rx.borrow_and_update().phase;
                if current == phase {
                    return true;
                }
                if current.is_terminal() {
                    return false;
                }
                // the sender is dropped when the attempt task ends
                if rx.changed().await.is_err() {
                    return rx.borrow().phase == phase;
                }
            }
        };
        tokio::time::timeout(timeout, reached).await.unwrap_or(false)
    }
}
