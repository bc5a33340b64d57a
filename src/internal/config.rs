use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::SessionError;

/// tunables for a session agent. missing fields fall back to the defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// topics are named `<topic_prefix>/<room>/signals`
    pub topic_prefix: String,
    /// how often PRESENCE is repeated while nobody has answered
    pub presence_interval_ms: u64,
    /// upper bound on PRESENCE repeats for one attempt
    pub max_presence_announcements: u32,
    /// STUN/TURN urls handed to the media transport
    pub ice_servers: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "duo".into(),
            presence_interval_ms: 2000,
            max_presence_announcements: 30,
            ice_servers: vec![
                "stun:stun.services.mozilla.com:3478".into(),
                "stun:stun.l.google.com:19302".into(),
            ],
        }
    }
}

impl SessionConfig {
    pub fn from_json(s: &str) -> Result<Self, SessionError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn presence_interval(&self) -> Duration {
        Duration::from_millis(self.presence_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let config = SessionConfig::from_json(r#"{"topic_prefix":"lab","ice_servers":[]}"#).unwrap();
        assert_eq!(config.topic_prefix, "lab");
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.presence_interval(), Duration::from_secs(2));
        assert_eq!(config.max_presence_announcements, 30);
    }

    #[test]
    fn rejects_wrong_types() {
        let err = SessionConfig::from_json(r#"{"presence_interval_ms":"soon"}"#).unwrap_err();
        assert!(matches!(err, SessionError::Codec(_)));
    }
}
