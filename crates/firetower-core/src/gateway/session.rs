//! Per-connection subscriber handle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::network::Message;

use super::sharding::SubscribeHook;

/// Outcome of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Enqueued,
    /// Queue full; the message was dropped for this session.
    Full,
    /// Session closed or its reader went away.
    Closed,
}

/// One logical subscriber.
///
/// Owned by the gateway manager. The bucket only keeps weak references.
pub struct Session {
    id: String,
    outbound: mpsc::Sender<Arc<Message>>,
    live: AtomicBool,
    done: CancellationToken,
    topics: Mutex<HashSet<String>>,
    hook: Option<Arc<dyn SubscribeHook>>,
}

impl Session {
    /// Create a session with an outbound queue of `capacity` messages.
    ///
    /// The receiver is the session's send path; whoever drains it writes to
    /// the client.
    pub fn new(
        id: impl Into<String>,
        capacity: usize,
        hook: Option<Arc<dyn SubscribeHook>>,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<Message>>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: id.into(),
            outbound,
            live: AtomicBool::new(true),
            done: CancellationToken::new(),
            topics: Mutex::new(HashSet::new()),
            hook,
        });
        (session, rx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Enqueue without waiting.
    pub fn try_deliver(&self, message: Arc<Message>) -> Delivery {
        if !self.is_live() {
            return Delivery::Closed;
        }
        match self.outbound.try_send(message) {
            Ok(()) => Delivery::Enqueued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Run the subscribe hook, if any. Without a hook every request is
    /// allowed unchanged.
    #[must_use]
    pub fn rewrite_topics(&self, topics: Vec<String>) -> (Vec<String>, bool) {
        match &self.hook {
            Some(hook) => hook.before_subscribe(&self.id, topics),
            None => (topics, true),
        }
    }

    /// Topics this session is subscribed to, after rewriting.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.lock_topics().iter().cloned().collect()
    }

    #[must_use]
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.lock_topics().contains(topic)
    }

    pub(crate) fn add_topic(&self, topic: &str) -> bool {
        self.lock_topics().insert(topic.to_string())
    }

    pub(crate) fn remove_topic(&self, topic: &str) -> bool {
        self.lock_topics().remove(topic)
    }

    pub(crate) fn take_topics(&self) -> Vec<String> {
        self.lock_topics().drain().collect()
    }

    /// Fires once the session is closed.
    #[must_use]
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Mark the session closed. Returns `false` if it already was.
    pub fn close(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::AcqRel);
        self.done.cancel();
        was_live
    }

    fn lock_topics(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A panic while holding this lock cannot leave the set half-updated.
        self.topics.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::sharding::HotTopicSharding;

    fn msg(id: &str) -> Arc<Message> {
        Arc::new(Message::publish(id, "user", "room", "x"))
    }

    #[test]
    fn test_deliver_until_full() {
        let (session, mut rx) = Session::new("s1", 1, None);

        assert_eq!(session.try_deliver(msg("1")), Delivery::Enqueued);
        assert_eq!(session.try_deliver(msg("2")), Delivery::Full);

        assert_eq!(rx.try_recv().unwrap().id, "1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deliver_after_close() {
        let (session, _rx) = Session::new("s1", 4, None);
        assert!(session.close());
        assert!(!session.close());
        assert!(session.done().is_cancelled());
        assert_eq!(session.try_deliver(msg("1")), Delivery::Closed);
    }

    #[test]
    fn test_deliver_after_reader_dropped() {
        let (session, rx) = Session::new("s1", 4, None);
        drop(rx);
        assert_eq!(session.try_deliver(msg("1")), Delivery::Closed);
    }

    #[test]
    fn test_rewrite_without_hook() {
        let (session, _rx) = Session::new("s1", 1, None);
        let (topics, allowed) = session.rewrite_topics(vec!["live_stream".to_string()]);
        assert!(allowed);
        assert_eq!(topics, vec!["live_stream".to_string()]);
    }

    #[test]
    fn test_rewrite_with_hook() {
        let hook: Arc<dyn SubscribeHook> = Arc::new(HotTopicSharding::new(["live_stream"], 4));
        let (session, _rx) = Session::new("s1", 1, Some(hook));

        let (topics, allowed) = session.rewrite_topics(vec!["live_stream".to_string()]);
        assert!(allowed);
        assert!(topics[0].starts_with("live_stream_"));
    }

    #[test]
    fn test_topic_set() {
        let (session, _rx) = Session::new("s1", 1, None);
        assert!(session.add_topic("a"));
        assert!(!session.add_topic("a"));
        assert!(session.add_topic("b"));
        assert!(session.is_subscribed("a"));

        assert!(session.remove_topic("a"));
        assert!(!session.is_subscribed("a"));

        assert_eq!(session.take_topics(), vec!["b".to_string()]);
        assert!(session.topics().is_empty());
    }
}
