//! Channel abstraction — the boundary between the runtime and external
//! conversational transports.
//!
//! A channel delivers [`InboundMessage`]s (serialized per session key) and
//! accepts outbound text/files. Session keys have the form
//! `"<channel>:<external-id>"`; the leading token names the channel.

pub mod chunk;
pub mod message;

pub use chunk::chunk_text;
pub use message::InboundMessage;

use std::path::Path;

use tokio::sync::mpsc;

use wr_domain::Result;

/// Abstract conversational transport.
///
/// Implementations deliver inbound messages in per-session-key order;
/// cross-key ordering is not required. Outbound content may exceed the
/// native message limit — the *runner* segments before calling
/// [`Channel::send_message`], so implementations can assume fitting chunks.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Channel name — the token before the first `:` of its session keys.
    fn name(&self) -> &str;

    /// Largest message the transport accepts, in bytes.
    fn chunk_limit(&self) -> usize {
        4096
    }

    /// Start delivery. Inbound messages are pushed into `sink` until the
    /// channel is closed.
    async fn subscribe(&self, sink: mpsc::Sender<InboundMessage>) -> Result<()>;

    async fn send_message(&self, session_key: &str, content: &str) -> Result<()>;

    async fn send_file(
        &self,
        session_key: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<()>;

    /// Stop delivery and release transport resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Split a session key into `(channel, external_id)`.
pub fn split_session_key(session_key: &str) -> Option<(&str, &str)> {
    match session_key.split_once(':') {
        Some((channel, id)) if !channel.is_empty() && !id.is_empty() => Some((channel, id)),
        _ => None,
    }
}

/// Build a session key from a channel name and an external id.
pub fn make_session_key(channel: &str, external_id: &str) -> String {
    format!("{channel}:{external_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_well_formed_key() {
        assert_eq!(split_session_key("telegram:12345"), Some(("telegram", "12345")));
        // Only the first colon splits; the rest belongs to the external id.
        assert_eq!(
            split_session_key("discord:guild:42"),
            Some(("discord", "guild:42"))
        );
    }

    #[test]
    fn split_rejects_malformed_keys() {
        assert_eq!(split_session_key("no-colon"), None);
        assert_eq!(split_session_key(":id"), None);
        assert_eq!(split_session_key("telegram:"), None);
        assert_eq!(split_session_key(""), None);
    }

    #[test]
    fn make_round_trips() {
        let key = make_session_key("telegram", "42");
        assert_eq!(split_session_key(&key), Some(("telegram", "42")));
    }
}
