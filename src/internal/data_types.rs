use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SessionError;

/// uniquely identifies a participant for the lifetime of one session attempt.
/// ordered lexicographically, which is what role arbitration relies on
#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// random, locally generated. collisions are not handled
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// the shared signaling scope. both participants must agree on it out of band
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(secret: &str) -> Result<Self, SessionError> {
        let room = secret.trim();
        if room.is_empty() {
            return Err(SessionError::InvalidRoom("room id is empty".into()));
        }
        // the room is a single topic segment
        if room.contains('/') {
            return Err(SessionError::InvalidRoom(format!(
                "room id may not contain '/': {}",
                room
            )));
        }
        Ok(Self(room.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<prefix>/<room>/signals`
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}/{}/signals", prefix, self.0)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Undetermined,
    Initiator,
    Responder,
}

/// negotiation phase of one session attempt
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    WaitingForPeer,
    RoleDecided,
    OfferSent,
    AwaitingOffer,
    AnswerSent,
    Negotiated,
    Connected,
    Failed,
    Closed,
}

impl Phase {
    /// nothing is processed once an attempt is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Failed | Phase::Closed)
    }
}

/// what the user-facing layer is told
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connecting,
    Waiting,
    Connected,
    Disconnected,
    Failed,
}

/// opaque session description produced and consumed by the media transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Description(serde_json::Value);

impl Description {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// opaque connectivity candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Candidate(serde_json::Value);

impl Candidate {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// point-in-time view of a session attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSnapshot {
    pub local_id: ParticipantId,
    pub phase: Phase,
    pub role: Role,
    pub remote_id: Option<ParticipantId>,
    /// the most recent error of the attempt, transient ones included
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        let a = ParticipantId::generate();
        let b = ParticipantId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn ids_order_lexicographically() {
        assert!(ParticipantId::from("zzz") > ParticipantId::from("aaa"));
        assert!(ParticipantId::from("ab") > ParticipantId::from("a"));
        assert!(ParticipantId::from("B") < ParticipantId::from("a"));
    }

    #[test]
    fn room_topic_follows_convention() {
        let room = RoomId::new("  kitchen ").unwrap();
        assert_eq!(room.as_str(), "kitchen");
        assert_eq!(room.topic("duo"), "duo/kitchen/signals");
    }

    #[test]
    fn rejects_unusable_rooms() {
        assert!(matches!(RoomId::new("   "), Err(SessionError::InvalidRoom(_))));
        assert!(matches!(RoomId::new("a/b"), Err(SessionError::InvalidRoom(_))));
    }
}
