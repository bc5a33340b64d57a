use std::sync::Arc;

use crate::internal::arbiter;
use crate::{
    Candidate, Description, MediaTransport, ParticipantId, Phase, Role, SessionError, Signal,
    SignalEnvelope, TransportEvent, TransportState,
};

/// how many candidates one sender may park with us before it is our peer
const MAX_UNBOUND_CANDIDATES: usize = 64;

/// drives the offer/answer/candidate exchange for one session attempt.
///
/// every method returns the envelopes which must be published as a result.
/// the caller owns the signal channel; this type only owns the transport.
///
/// candidates received before a remote description is applied are held back
/// and flushed, in arrival order, right after the description is applied.
pub struct Negotiation {
    local_id: ParticipantId,
    remote_id: Option<ParticipantId>,
    role: Role,
    phase: Phase,
    /// (sender, candidate). the sender matters when the peer is not yet known
    pending_candidates: Vec<(ParticipantId, Candidate)>,
    remote_description_applied: bool,
    transport: Arc<dyn MediaTransport>,
    transport_released: bool,
}

impl Negotiation {
    pub fn new(local_id: ParticipantId, transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            local_id,
            remote_id: None,
            role: Role::Undetermined,
            phase: Phase::Idle,
            pending_candidates: Vec::new(),
            remote_description_applied: false,
            transport,
            transport_released: false,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn remote_id(&self) -> Option<&ParticipantId> {
        self.remote_id.as_ref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// announces this participant. moves IDLE to WAITING_FOR_PEER; repeated
    /// calls while still waiting produce another PRESENCE, afterwards nothing
    pub fn announce(&mut self) -> Vec<SignalEnvelope> {
        match self.phase {
            Phase::Idle => {
                self.set_phase(Phase::WaitingForPeer);
                vec![self.presence()]
            }
            Phase::WaitingForPeer => vec![self.presence()],
            _ => vec![],
        }
    }

    /// processes one inbound envelope. self-echo must already be filtered.
    ///
    /// `ProtocolAnomaly` leaves the attempt untouched. `TransportFailure`
    /// means the attempt is now FAILED.
    pub async fn handle_signal(
        &mut self,
        envelope: SignalEnvelope,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        if self.phase.is_terminal() {
            log::debug!(
                "dropping {:?} from {}: attempt is {}",
                envelope.signal.kind(),
                envelope.sender,
                self.phase
            );
            return Ok(vec![]);
        }
        if let Some(remote) = &self.remote_id {
            if envelope.sender != *remote {
                return Err(SessionError::ProtocolAnomaly(format!(
                    "{:?} from {} while bound to {}",
                    envelope.signal.kind(),
                    envelope.sender,
                    remote
                )));
            }
        }

        let SignalEnvelope { sender, signal } = envelope;
        let result = match signal {
            Signal::Presence => self.on_presence(sender).await,
            Signal::Offer(description) => self.on_offer(sender, description).await,
            Signal::Answer(description) => self.on_answer(description).await,
            Signal::Candidate(candidate) => {
                self.on_candidate(sender, candidate).await;
                Ok(vec![])
            }
        };
        if let Err(SessionError::IdentityCollision(id)) = &result {
            log::error!("peer uses our own id {}, giving up", id);
            self.pending_candidates.clear();
            self.set_phase(Phase::Failed);
        }
        result
    }

    /// processes one event from the media transport
    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        if self.phase.is_terminal() {
            log::debug!("dropping transport event {:?}: attempt is {}", event, self.phase);
            return Ok(vec![]);
        }
        match event {
            // sent whatever the phase; the peer buffers early candidates
            TransportEvent::LocalCandidate(candidate) => Ok(vec![SignalEnvelope::new(
                self.local_id.clone(),
                Signal::Candidate(candidate),
            )]),
            TransportEvent::StateChanged(state) => {
                self.on_transport_state(state)?;
                Ok(vec![])
            }
            TransportEvent::ApplicationMessage(_) => Ok(vec![]),
        }
    }

    /// local hangup: closes the transport and ends the attempt as CLOSED.
    /// safe in any phase
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.release().await;
        self.pending_candidates.clear();
        self.set_phase(Phase::Closed);
    }

    /// ends a live attempt as FAILED, for reasons outside the transport
    /// (the signal channel went away). the transport is released either way
    pub async fn abort(&mut self, reason: &str) {
        if !self.phase.is_terminal() {
            self.fail(reason.to_string());
        }
        self.release().await;
    }

    /// closes the transport once the attempt has ended. later calls do nothing
    pub async fn release(&mut self) {
        if self.transport_released {
            return;
        }
        self.transport_released = true;
        self.transport.close().await;
    }

    async fn on_presence(
        &mut self,
        sender: ParticipantId,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        match self.phase {
            Phase::Idle | Phase::WaitingForPeer => {
                self.bind_peer(sender)?;
                // the peer may have joined before us and missed our presence
                let mut out = vec![self.presence()];
                out.extend(self.start_role().await?);
                Ok(out)
            }
            _ => {
                log::debug!("duplicate presence from {} ignored", sender);
                Ok(vec![])
            }
        }
    }

    async fn on_offer(
        &mut self,
        sender: ParticipantId,
        offer: Description,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        match self.phase {
            // the offer is the first we hear of the peer
            Phase::Idle | Phase::WaitingForPeer => {
                if arbiter::decide(&self.local_id, &sender)? == Role::Initiator {
                    return Err(SessionError::ProtocolAnomaly(format!(
                        "offer from {} which should be answering",
                        sender
                    )));
                }
                self.bind_peer(sender)?;
                self.start_role().await?;
                self.accept_offer(offer).await
            }
            Phase::AwaitingOffer => self.accept_offer(offer).await,
            Phase::OfferSent => Err(SessionError::ProtocolAnomaly(
                "offer received while initiating".into(),
            )),
            phase => Err(SessionError::ProtocolAnomaly(format!(
                "offer received in {}",
                phase
            ))),
        }
    }

    async fn on_answer(
        &mut self,
        answer: Description,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        if self.phase != Phase::OfferSent {
            return Err(SessionError::ProtocolAnomaly(format!(
                "answer received in {}",
                self.phase
            )));
        }
        self.apply_remote_description(answer).await?;
        self.set_phase(Phase::Negotiated);
        Ok(vec![])
    }

    async fn on_candidate(&mut self, sender: ParticipantId, candidate: Candidate) {
        if self.remote_id.is_none() {
            let parked = self
                .pending_candidates
                .iter()
                .filter(|(from, _)| *from == sender)
                .count();
            if parked >= MAX_UNBOUND_CANDIDATES {
                log::warn!("dropping candidate from {}: too many before binding", sender);
                return;
            }
        }
        if !self.remote_description_applied {
            log::debug!(
                "buffering candidate from {} until a remote description is applied",
                sender
            );
            self.pending_candidates.push((sender, candidate));
            return;
        }
        self.add_candidate(candidate).await;
    }

    fn on_transport_state(&mut self, state: TransportState) -> Result<(), SessionError> {
        match state {
            TransportState::Connected => match self.phase {
                Phase::AnswerSent | Phase::Negotiated => self.set_phase(Phase::Connected),
                Phase::Connected => {}
                phase => log::warn!("transport connected while {}", phase),
            },
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed => {
                return Err(self.fail(format!("transport reported {}", state)));
            }
            TransportState::New | TransportState::Connecting => {
                log::debug!("transport is {}", state);
            }
        }
        Ok(())
    }

    fn bind_peer(&mut self, remote: ParticipantId) -> Result<(), SessionError> {
        let role = arbiter::decide(&self.local_id, &remote)?;
        log::info!("peer {} found, acting as {}", remote, role);
        // candidates from anyone else were never ours to apply
        self.pending_candidates.retain(|(sender, _)| *sender == remote);
        self.remote_id = Some(remote);
        self.role = role;
        self.set_phase(Phase::RoleDecided);
        Ok(())
    }

    async fn start_role(&mut self) -> Result<Vec<SignalEnvelope>, SessionError> {
        match self.role {
            Role::Initiator => {
                let offer = self.create_local_description().await?;
                self.set_phase(Phase::OfferSent);
                Ok(vec![SignalEnvelope::new(
                    self.local_id.clone(),
                    Signal::Offer(offer),
                )])
            }
            Role::Responder => {
                self.set_phase(Phase::AwaitingOffer);
                Ok(vec![])
            }
            Role::Undetermined => Err(SessionError::ProtocolAnomaly(
                "role not decided".into(),
            )),
        }
    }

    async fn accept_offer(
        &mut self,
        offer: Description,
    ) -> Result<Vec<SignalEnvelope>, SessionError> {
        self.apply_remote_description(offer).await?;
        let answer = self.create_local_description().await?;
        self.set_phase(Phase::AnswerSent);
        Ok(vec![SignalEnvelope::new(
            self.local_id.clone(),
            Signal::Answer(answer),
        )])
    }

    async fn create_local_description(&mut self) -> Result<Description, SessionError> {
        match self.transport.create_local_description(self.role).await {
            Ok(description) => Ok(description),
            Err(e) => Err(self.fail(format!("failed to create local description: {}", e))),
        }
    }

    async fn apply_remote_description(
        &mut self,
        description: Description,
    ) -> Result<(), SessionError> {
        if let Err(e) = self.transport.apply_remote_description(description).await {
            return Err(self.fail(format!("failed to apply remote description: {}", e)));
        }
        self.remote_description_applied = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            log::debug!("flushing {} buffered candidates", pending.len());
        }
        for (_, candidate) in pending {
            self.add_candidate(candidate).await;
        }
        Ok(())
    }

    // a single bad candidate does not end the attempt
    async fn add_candidate(&self, candidate: Candidate) {
        if let Err(e) = self.transport.add_remote_candidate(candidate).await {
            log::warn!("failed to add remote candidate: {}", e);
        }
    }

    fn fail(&mut self, reason: String) -> SessionError {
        log::error!("session attempt failed: {}", reason);
        self.pending_candidates.clear();
        self.set_phase(Phase::Failed);
        SessionError::TransportFailure(reason)
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            log::debug!("{} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn presence(&self) -> SignalEnvelope {
        SignalEnvelope::presence(self.local_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, TransportCall};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn negotiation(local: &str) -> (Negotiation, Arc<FakeTransport>) {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Arc::new(FakeTransport::new(tx));
        (Negotiation::new(local.into(), transport.clone()), transport)
    }

    fn offer(from: &str) -> SignalEnvelope {
        SignalEnvelope::new(
            from.into(),
            Signal::Offer(Description::new(json!({"type": "offer", "sdp": from}))),
        )
    }

    fn candidate(from: &str, n: u32) -> SignalEnvelope {
        SignalEnvelope::new(from.into(), Signal::Candidate(Candidate::new(json!({ "n": n }))))
    }

    #[tokio::test]
    async fn announce_moves_to_waiting_once() {
        let (mut n, _) = negotiation("aaa");
        assert_eq!(n.announce(), vec![SignalEnvelope::presence("aaa".into())]);
        assert_eq!(n.phase(), Phase::WaitingForPeer);
        assert_eq!(n.announce().len(), 1);
        assert_eq!(n.role(), Role::Undetermined);
    }

    #[tokio::test]
    async fn initiator_offers_after_presence() {
        let (mut n, transport) = negotiation("zzz");
        n.announce();
        let out = n
            .handle_signal(SignalEnvelope::presence("aaa".into()))
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].signal, Signal::Presence);
        assert!(matches!(out[1].signal, Signal::Offer(_)));
        assert_eq!(n.phase(), Phase::OfferSent);
        assert_eq!(n.role(), Role::Initiator);
        assert_eq!(
            transport.calls(),
            vec![TransportCall::CreateLocalDescription(Role::Initiator)]
        );
    }

    #[tokio::test]
    async fn responder_answers_offer_and_flushes_candidates() {
        let (mut n, transport) = negotiation("aaa");
        n.announce();
        n.handle_signal(SignalEnvelope::presence("zzz".into()))
            .await
            .unwrap();
        assert_eq!(n.phase(), Phase::AwaitingOffer);

        n.handle_signal(candidate("zzz", 1)).await.unwrap();
        assert_eq!(n.pending_candidates(), 1);

        let out = n.handle_signal(offer("zzz")).await.unwrap();
        assert!(matches!(out[0].signal, Signal::Answer(_)));
        assert_eq!(n.phase(), Phase::AnswerSent);
        assert_eq!(n.pending_candidates(), 0);
        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::ApplyRemoteDescription(Description::new(
                    json!({"type": "offer", "sdp": "zzz"})
                )),
                TransportCall::AddRemoteCandidate(Candidate::new(json!({"n": 1}))),
                TransportCall::CreateLocalDescription(Role::Responder),
            ]
        );
    }

    #[tokio::test]
    async fn offer_before_presence_binds_peer() {
        let (mut n, _) = negotiation("aaa");
        n.announce();
        let out = n.handle_signal(offer("zzz")).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(n.remote_id(), Some(&ParticipantId::from("zzz")));
        assert_eq!(n.role(), Role::Responder);
        assert_eq!(n.phase(), Phase::AnswerSent);
    }

    #[tokio::test]
    async fn offer_from_lower_id_is_glare() {
        let (mut n, transport) = negotiation("zzz");
        n.announce();
        let err = n.handle_signal(offer("aaa")).await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolAnomaly(_)));
        assert_eq!(n.phase(), Phase::WaitingForPeer);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn initiator_ignores_offer() {
        let (mut n, _) = negotiation("zzz");
        n.announce();
        n.handle_signal(SignalEnvelope::presence("aaa".into()))
            .await
            .unwrap();
        let err = n.handle_signal(offer("aaa")).await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolAnomaly(_)));
        assert_eq!(n.phase(), Phase::OfferSent);
    }

    #[tokio::test]
    async fn second_offer_after_answer_is_ignored() {
        let (mut n, transport) = negotiation("aaa");
        n.announce();
        n.handle_signal(offer("zzz")).await.unwrap();
        let calls = transport.calls().len();
        let err = n.handle_signal(offer("zzz")).await.unwrap_err();
        assert!(matches!(err, SessionError::ProtocolAnomaly(_)));
        assert_eq!(n.phase(), Phase::AnswerSent);
        assert_eq!(transport.calls().len(), calls);
    }

    #[tokio::test]
    async fn third_participant_is_an_anomaly() {
        let (mut n, _) = negotiation("mmm");
        n.announce();
        n.handle_signal(SignalEnvelope::presence("aaa".into()))
            .await
            .unwrap();
        let err = n
            .handle_signal(SignalEnvelope::presence("bbb".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolAnomaly(_)));
        assert_eq!(n.remote_id(), Some(&ParticipantId::from("aaa")));
    }

    #[tokio::test]
    async fn foreign_candidates_are_dropped_when_peer_binds() {
        let (mut n, _) = negotiation("aaa");
        n.announce();
        n.handle_signal(candidate("xxx", 1)).await.unwrap();
        n.handle_signal(candidate("zzz", 2)).await.unwrap();
        assert_eq!(n.pending_candidates(), 2);
        n.handle_signal(SignalEnvelope::presence("zzz".into()))
            .await
            .unwrap();
        assert_eq!(n.pending_candidates(), 1);
    }

    #[tokio::test]
    async fn connected_only_after_negotiation() {
        let (mut n, _) = negotiation("aaa");
        n.announce();
        n.handle_transport_event(TransportEvent::StateChanged(TransportState::Connected))
            .unwrap();
        assert_eq!(n.phase(), Phase::WaitingForPeer);

        n.handle_signal(offer("zzz")).await.unwrap();
        n.handle_transport_event(TransportEvent::StateChanged(TransportState::Connected))
            .unwrap();
        assert_eq!(n.phase(), Phase::Connected);
    }

    #[tokio::test]
    async fn transport_failure_discards_buffered_candidates() {
        let (mut n, _) = negotiation("zzz");
        n.announce();
        n.handle_signal(SignalEnvelope::presence("aaa".into()))
            .await
            .unwrap();
        n.handle_signal(candidate("aaa", 1)).await.unwrap();
        let err = n
            .handle_transport_event(TransportEvent::StateChanged(TransportState::Failed))
            .unwrap_err();
        assert!(matches!(err, SessionError::TransportFailure(_)));
        assert_eq!(n.phase(), Phase::Failed);
        assert_eq!(n.pending_candidates(), 0);

        let out = n
            .handle_signal(SignalEnvelope::new(
                "aaa".into(),
                Signal::Answer(Description::new(json!({}))),
            ))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn failed_description_fails_attempt() {
        let (mut n, transport) = negotiation("aaa");
        transport.fail_descriptions();
        n.announce();
        let err = n.handle_signal(offer("zzz")).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportFailure(_)));
        assert_eq!(n.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn local_candidates_are_published_in_any_live_phase() {
        let (mut n, _) = negotiation("aaa");
        let out = n
            .handle_transport_event(TransportEvent::LocalCandidate(Candidate::new(json!({"n": 9}))))
            .unwrap();
        assert_eq!(out, vec![candidate("aaa", 9)]);

        n.close().await;
        let out = n
            .handle_transport_event(TransportEvent::LocalCandidate(Candidate::new(json!({"n": 9}))))
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn identity_collision_ends_attempt() {
        let (mut n, transport) = negotiation("same");
        n.announce();
        let err = n
            .handle_signal(SignalEnvelope::presence("same".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::IdentityCollision(_)));
        assert_eq!(n.phase(), Phase::Failed);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn unbound_senders_cannot_flood_the_buffer() {
        let (mut n, _) = negotiation("aaa");
        n.announce();
        for i in 0..100 {
            n.handle_signal(candidate("xxx", i)).await.unwrap();
        }
        assert_eq!(n.pending_candidates(), MAX_UNBOUND_CANDIDATES);
        n.handle_signal(candidate("zzz", 1)).await.unwrap();
        assert_eq!(n.pending_candidates(), MAX_UNBOUND_CANDIDATES + 1);

        // the bound peer is not limited
        n.handle_signal(SignalEnvelope::presence("zzz".into()))
            .await
            .unwrap();
        for i in 2..100 {
            n.handle_signal(candidate("zzz", i)).await.unwrap();
        }
        assert_eq!(n.pending_candidates(), 99);
    }

    #[tokio::test]
    async fn abort_fails_and_releases_the_transport() {
        let (mut n, transport) = negotiation("zzz");
        n.announce();
        n.handle_signal(SignalEnvelope::presence("aaa".into()))
            .await
            .unwrap();
        n.handle_signal(candidate("aaa", 1)).await.unwrap();

        n.abort("signal channel closed").await;
        assert_eq!(n.phase(), Phase::Failed);
        assert_eq!(n.pending_candidates(), 0);
        n.release().await;
        n.close().await;
        let closes = transport
            .calls()
            .iter()
            .filter(|c| **c == TransportCall::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut n, transport) = negotiation("aaa");
        n.announce();
        n.close().await;
        n.close().await;
        assert_eq!(n.phase(), Phase::Closed);
        assert_eq!(transport.calls(), vec![TransportCall::Close]);
    }
}
