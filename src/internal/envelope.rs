use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Candidate, Description, ParticipantId, SessionError};

/// the negotiation messages exchanged over the signal channel
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// announces a participant. carries no payload
    Presence,
    Offer(Description),
    Answer(Description),
    Candidate(Candidate),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Presence => SignalKind::Presence,
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Presence,
    Offer,
    Answer,
    Candidate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalEnvelope {
    pub sender: ParticipantId,
    pub signal: Signal,
}

// wire form: {"sender": "...", "type": "offer", "data": {...}}
// unknown fields are ignored and `data` may be missing for presence
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    sender: ParticipantId,
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default)]
    data: Value,
}

impl SignalEnvelope {
    pub fn new(sender: ParticipantId, signal: Signal) -> Self {
        Self { sender, signal }
    }

    pub fn presence(sender: ParticipantId) -> Self {
        Self::new(sender, Signal::Presence)
    }

    pub fn encode(&self) -> Result<Bytes, SessionError> {
        let data = match &self.signal {
            Signal::Presence => Value::Object(Default::default()),
            Signal::Offer(d) | Signal::Answer(d) => d.as_value().clone(),
            Signal::Candidate(c) => c.as_value().clone(),
        };
        let wire = WireEnvelope {
            sender: self.sender.clone(),
            kind: self.signal.kind(),
            data,
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SessionError> {
        let wire: WireEnvelope = serde_json::from_slice(payload)?;
        let signal = match wire.kind {
            SignalKind::Presence => Signal::Presence,
            SignalKind::Offer => Signal::Offer(Description::new(require_data(wire.data, "offer")?)),
            SignalKind::Answer => {
                Signal::Answer(Description::new(require_data(wire.data, "answer")?))
            }
            SignalKind::Candidate => {
                Signal::Candidate(Candidate::new(require_data(wire.data, "candidate")?))
            }
        };
        Ok(Self {
            sender: wire.sender,
            signal,
        })
    }
}

fn require_data(data: Value, kind: &str) -> Result<Value, SessionError> {
    if data.is_null() {
        return Err(SessionError::ProtocolAnomaly(format!(
            "{} envelope without data",
            kind
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn offer_wire_shape() {
        let env = SignalEnvelope::new(
            "zzz".into(),
            Signal::Offer(Description::new(json!({"type": "offer", "sdp": "v=0"}))),
        );
        let bytes = env.encode().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"sender": "zzz", "type": "offer", "data": {"type": "offer", "sdp": "v=0"}})
        );
        assert_eq!(SignalEnvelope::decode(&bytes).unwrap(), env);
    }

    #[test]
    fn tolerates_unknown_fields_and_missing_presence_data() {
        let env = SignalEnvelope::decode(br#"{"sender":"a","type":"presence","ttl":3}"#).unwrap();
        assert_eq!(env, SignalEnvelope::presence("a".into()));
    }

    #[test]
    fn rejects_unknown_type() {
        let err = SignalEnvelope::decode(br#"{"sender":"a","type":"bye","data":{}}"#).unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));
    }

    #[test]
    fn rejects_payloadless_candidate() {
        let err = SignalEnvelope::decode(br#"{"sender":"a","type":"candidate"}"#).unwrap_err();
        assert!(matches!(err, SessionError::ProtocolAnomaly(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(SignalEnvelope::decode(b"not json").is_err());
    }
}
