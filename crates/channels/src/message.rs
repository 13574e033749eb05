use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message received from a channel, consumed exactly once by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// `"<channel>:<external-id>"`.
    pub session_key: String,
    /// Channel name, derived from the session key.
    pub channel: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
    /// True iff `content` starts with `/` and the first token matches a
    /// registered command. Channels leave this false; the runner stamps it
    /// at admission (only the router knows the registered set).
    #[serde(default)]
    pub is_command: bool,
    pub arrival_ts: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(session_key: impl Into<String>, content: impl Into<String>) -> Self {
        let session_key = session_key.into();
        let channel = session_key
            .split(':')
            .next()
            .unwrap_or_default()
            .to_owned();
        Self {
            session_key,
            channel,
            content: content.into(),
            attachments: Vec::new(),
            is_command: false,
            arrival_ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_derives_channel_from_key() {
        let msg = InboundMessage::new("telegram:42", "hello");
        assert_eq!(msg.channel, "telegram");
        assert_eq!(msg.session_key, "telegram:42");
        assert!(!msg.is_command);
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn serde_round_trip() {
        let msg = InboundMessage::new("discord:guild:7", "/status");
        let json = serde_json::to_string(&msg).unwrap();
        let back: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_key, msg.session_key);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.channel, "discord");
    }
}
