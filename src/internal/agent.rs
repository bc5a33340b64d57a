use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};

use crate::internal::negotiation::Negotiation;
use crate::{
    AttemptSnapshot, ChannelMessage, ParticipantId, Phase, SessionError, SessionStatus,
    SignalChannel, SignalEnvelope, TransportEvent, TransportState,
};

pub type StatusCallback = Arc<dyn Fn(SessionStatus) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(bytes::Bytes) + Send + Sync>;

/// callbacks registered on the controller. shared with the running attempt so
/// they may be replaced at any time
#[derive(Default)]
pub struct Callbacks {
    pub status: Mutex<Option<StatusCallback>>,
    pub message: Mutex<Option<MessageCallback>>,
}

impl Callbacks {
    pub fn report(&self, status: SessionStatus) {
        log::info!("session status: {}", status);
        let callback = self.status.lock().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn deliver(&self, data: bytes::Bytes) {
        let callback = self.message.lock().clone();
        match callback {
            Some(callback) => callback(data),
            None => log::debug!("application message dropped: no receiver registered"),
        }
    }
}

/// decodes an inbound payload and drops self-echo. anything returned here is
/// safe to hand to the state machine
pub fn accept(local_id: &ParticipantId, payload: &[u8]) -> Option<SignalEnvelope> {
    match SignalEnvelope::decode(payload) {
        Ok(envelope) if envelope.sender == *local_id => None,
        Ok(envelope) => Some(envelope),
        Err(e) => {
            log::warn!("discarding undecodable signal: {}", e);
            None
        }
    }
}

/// owns one session attempt and processes its events one at a time:
/// relay messages, transport events and the presence timer
pub struct Agent {
    pub negotiation: Negotiation,
    pub channel: Arc<dyn SignalChannel>,
    pub topic: String,
    pub inbound: mpsc::UnboundedReceiver<ChannelMessage>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub snapshot: watch::Sender<AttemptSnapshot>,
    pub callbacks: Arc<Callbacks>,
    pub presence_interval: Duration,
    pub max_presence_announcements: u32,
    /// most recent error worth showing to the controller
    pub last_error: Option<String>,
}

impl Agent {
    pub async fn run(mut self) {
        let presence = self.negotiation.announce();
        self.publish_all(presence).await;
        self.update_snapshot();
        self.callbacks.report(SessionStatus::Waiting);

        let mut announcements = 1;
        let mut next_announcement = self.next_announcement();
        loop {
            let waiting = self.negotiation.phase() == Phase::WaitingForPeer
                && announcements < self.max_presence_announcements;
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.on_inbound(msg).await,
                    None => {
                        let reason = "signal channel closed";
                        self.negotiation.abort(reason).await;
                        self.last_error = Some(reason.to_string());
                        self.update_snapshot();
                        self.callbacks.report(SessionStatus::Failed);
                        return;
                    }
                },
                Some(event) = self.transport_events.recv() => self.on_transport_event(event).await,
                _ = sleep_until(next_announcement), if waiting => {
                    announcements += 1;
                    log::debug!("re-announcing presence ({})", announcements);
                    let presence = self.negotiation.announce();
                    self.publish_all(presence).await;
                    if announcements == self.max_presence_announcements {
                        log::warn!("no peer answered after {} announcements", announcements);
                    }
                    next_announcement = self.next_announcement();
                }
            }
            if self.negotiation.phase().is_terminal() {
                log::info!("session attempt ended: {}", self.negotiation.phase());
                self.negotiation.release().await;
                return;
            }
        }
    }

    async fn on_inbound(&mut self, msg: ChannelMessage) {
        let envelope = match accept(self.negotiation.local_id(), &msg.payload) {
            Some(envelope) => envelope,
            None => return,
        };
        log::debug!("received {:?} from {}", envelope.signal.kind(), envelope.sender);
        let before = self.negotiation.phase();
        match self.negotiation.handle_signal(envelope).await {
            Ok(outbound) => self.publish_all(outbound).await,
            Err(SessionError::ProtocolAnomaly(reason)) => {
                log::warn!("ignoring signal: {}", reason);
            }
            Err(e) if e.is_fatal() => {
                log::error!("{}", e);
                self.last_error = Some(e.to_string());
                self.callbacks.report(SessionStatus::Failed);
            }
            Err(e) => log::warn!("signal not processed: {}", e),
        }
        self.after_step(before);
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        if let TransportEvent::ApplicationMessage(data) = event {
            self.callbacks.deliver(data);
            return;
        }
        let status = match &event {
            TransportEvent::StateChanged(TransportState::Disconnected) => SessionStatus::Disconnected,
            _ => SessionStatus::Failed,
        };
        let before = self.negotiation.phase();
        match self.negotiation.handle_transport_event(event) {
            Ok(outbound) => self.publish_all(outbound).await,
            Err(e) => {
                log::error!("{}", e);
                self.last_error = Some(e.to_string());
                self.callbacks.report(status);
            }
        }
        self.after_step(before);
    }

    fn after_step(&mut self, before: Phase) {
        let phase = self.negotiation.phase();
        if phase == before {
            return;
        }
        if phase == Phase::Connected {
            self.callbacks.report(SessionStatus::Connected);
        }
        self.update_snapshot();
    }

    async fn publish_all(&mut self, envelopes: Vec<SignalEnvelope>) {
        let mut failed = false;
        for envelope in envelopes {
            let payload = match envelope.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    log::error!("failed to encode {:?}: {}", envelope.signal.kind(), e);
                    continue;
                }
            };
            // publish failures are transient, the attempt carries on
            if let Err(e) = self.channel.publish(&self.topic, payload).await {
                log::error!("{}", e);
                self.last_error = Some(e.to_string());
                failed = true;
            }
        }
        if failed {
            self.update_snapshot();
        }
    }

    fn update_snapshot(&self) {
        self.snapshot.send_replace(AttemptSnapshot {
            local_id: self.negotiation.local_id().clone(),
            phase: self.negotiation.phase(),
            role: self.negotiation.role(),
            remote_id: self.negotiation.remote_id().cloned(),
            last_error: self.last_error.clone(),
        });
    }

    // jittered so two agents started together do not announce in lockstep
    fn next_announcement(&self) -> Instant {
        let jitter_ms = (self.presence_interval.as_millis() / 4) as u64;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        Instant::now() + self.presence_interval + Duration::from_millis(jitter)
    }
}
