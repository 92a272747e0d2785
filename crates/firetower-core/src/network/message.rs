//! Decoded gateway messages.

use std::time::Instant;

use bytes::Bytes;

/// Reserved message kinds.
pub mod kinds {
    /// Application publish.
    pub const PUBLISH: &str = "publish";
    /// Liveness probe, consumed by the transport.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Remove one session from one topic. Payload is the session id.
    pub const OFFLINE_TOPIC_BY_USER: &str = "offline_topic_by_userid";
    /// Remove every subscriber of a topic.
    pub const OFFLINE_TOPIC: &str = "offline_topic";
    /// Close a session. Payload is the session id.
    pub const OFFLINE_USER: &str = "offline_user";
}

/// Well-known values of [`Message::source`].
pub mod sources {
    pub const USER: &str = "user";
    pub const PLATFORM: &str = "platform";
}

/// Local diagnostics attached to a message. Never serialized.
#[derive(Debug, Clone)]
pub struct Origin {
    pub created_at: Instant,
    pub id: String,
    pub source: String,
}

/// One logical message, decoded from a frame or built for publish.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: String,
    pub id: String,
    pub source: String,
    pub topic: String,
    pub payload: Bytes,
    pub origin: Origin,
}

impl Message {
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        source: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let id = id.into();
        let source = source.into();
        Self {
            kind: kind.into(),
            origin: Origin {
                created_at: Instant::now(),
                id: id.clone(),
                source: source.clone(),
            },
            id,
            source,
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Shorthand for a `publish` message.
    pub fn publish(
        id: impl Into<String>,
        source: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(kinds::PUBLISH, id, source, topic, payload)
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.kind == kinds::HEARTBEAT
    }

    /// Payload interpreted as UTF-8, if it is.
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

// `origin` is local bookkeeping and takes no part in equality.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.id == other.id
            && self.source == other.source
            && self.topic == other.topic
            && self.payload == other.payload
    }
}

impl Eq for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_origin() {
        let a = Message::publish("1", sources::USER, "room", "hi");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Message::publish("1", sources::USER, "room", "hi");
        assert_ne!(a.origin.created_at, b.origin.created_at);
        assert_eq!(a, b);
    }

    #[test]
    fn test_heartbeat_kind() {
        let msg = Message::new(kinds::HEARTBEAT, "0", sources::PLATFORM, "-", Bytes::new());
        assert!(msg.is_heartbeat());
        assert!(!Message::publish("1", "user", "room", "x").is_heartbeat());
    }
}
