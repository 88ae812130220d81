use crate::peer::{IceServer, PeerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Broadcast topics are `<topic_prefix>:<user id>`.
    pub topic_prefix: String,
    /// Table used by the durable path.
    pub table: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "call-signaling".to_string(),
            table: "call_signals".to_string(),
        }
    }
}

impl SignalingConfig {
    pub fn topic_for(&self, user: &ringcore::types::UserId) -> String {
        format!("{}:{}", self.topic_prefix, user)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Seconds an outgoing call may ring before the caller gives up.
    pub ring_timeout_secs: u64,
    /// Start the local stream matching the call type on initiate/accept.
    pub auto_start_media: bool,
    /// Decline a second invitation instead of silently dropping it.
    pub auto_decline_when_busy: bool,
    pub ice_servers: Vec<IceServer>,
    pub signaling: SignalingConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            auto_start_media: true,
            auto_decline_when_busy: true,
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            signaling: SignalingConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }

    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"ring_timeout_secs": 10, "ice_servers": [{{"urls": ["turn:relay.example.org:3478"], "username": "u", "credential": "p"}}]}}"#
        )
        .unwrap();

        let config = CallConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ring_timeout(), Duration::from_secs(10));
        assert!(config.auto_start_media);
        assert_eq!(config.signaling, SignalingConfig::default());
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("u"));
        assert_eq!(config.peer_config().ice_servers, config.ice_servers);
    }

    #[test]
    fn test_topic_naming() {
        let config = SignalingConfig::default();
        assert_eq!(
            config.topic_for(&"user2".into()),
            "call-signaling:user2".to_string()
        );
    }
}
