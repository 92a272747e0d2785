//! Topic fanout table.
//!
//! Maps each topic to the sessions subscribed to it and delivers published
//! messages to all of them without ever waiting on one.
//!
//! Subscriber sets are immutable snapshots behind an `Arc`. Writers replace a
//! topic's snapshot under that topic's shard lock; [`Bucket::push`] clones the
//! `Arc` and iterates outside any lock, so a slow subscriber or a concurrent
//! subscribe never holds up a publish for longer than the clone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::metrics::GatewayMetrics;
use crate::network::Message;

use super::session::{Delivery, Session};

type Subscribers = Arc<HashMap<String, Weak<Session>>>;

/// Result of one [`Bucket::push`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Enqueued on a subscriber queue.
    pub delivered: usize,
    /// Dropped because the subscriber queue was full.
    pub dropped: usize,
    /// Skipped because the subscriber is gone.
    pub stale: usize,
}

/// Result of one [`Bucket::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dead_subscribers: usize,
    pub empty_topics: usize,
}

/// Topic to subscriber fanout table.
pub struct Bucket {
    topics: DashMap<String, Subscribers>,
    metrics: Arc<GatewayMetrics>,
}

impl Bucket {
    #[must_use]
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            topics: DashMap::new(),
            metrics,
        }
    }

    /// Subscribe `session` to `topic`. Idempotent.
    pub fn add_subscribe(&self, topic: &str, session: &Arc<Session>) {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        if entry.get(session.id()).is_some_and(|w| w.ptr_eq(&Arc::downgrade(session))) {
            return;
        }
        let mut next = HashMap::clone(&entry);
        next.insert(session.id().to_string(), Arc::downgrade(session));
        *entry = Arc::new(next);
        drop(entry);

        self.metrics.set_topics(self.topics.len() as i64);
    }

    /// Unsubscribe `session` from `topic`. Drops the topic entry once it has
    /// no subscribers left.
    pub fn remove_subscribe(&self, topic: &str, session: &Session) -> bool {
        let removed = match self.topics.entry(topic.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().contains_key(session.id()) {
                    false
                } else if entry.get().len() == 1 {
                    entry.remove();
                    true
                } else {
                    let mut next = HashMap::clone(entry.get());
                    next.remove(session.id());
                    entry.insert(Arc::new(next));
                    true
                }
            }
            Entry::Vacant(_) => false,
        };

        if removed {
            self.metrics.set_topics(self.topics.len() as i64);
        }
        removed
    }

    /// Drop every subscriber of `topic`. Returns the sessions that were
    /// still alive.
    pub fn remove_topic(&self, topic: &str) -> Vec<Arc<Session>> {
        let removed = self
            .topics
            .remove(topic)
            .map(|(_, subscribers)| subscribers.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default();

        self.metrics.set_topics(self.topics.len() as i64);
        removed
    }

    /// Deliver `message` to every subscriber of its topic.
    ///
    /// Never blocks and never fails. A subscriber whose queue is full misses
    /// this message.
    pub fn push(&self, message: Arc<Message>) -> PushReport {
        let started = Instant::now();
        let mut report = PushReport::default();

        let Some(subscribers) = self.snapshot(&message.topic) else {
            self.metrics.record_push(0, started.elapsed().as_secs_f64());
            return report;
        };

        for (session_id, weak) in subscribers.iter() {
            let Some(session) = weak.upgrade() else {
                report.stale += 1;
                continue;
            };
            match session.try_deliver(Arc::clone(&message)) {
                Delivery::Enqueued => report.delivered += 1,
                Delivery::Full => {
                    report.dropped += 1;
                    self.metrics.record_drop("queue_full");
                    debug!(
                        session_id = %session_id,
                        topic = %message.topic,
                        message_id = %message.id,
                        "subscriber queue full, message dropped"
                    );
                }
                Delivery::Closed => {
                    report.stale += 1;
                    self.metrics.record_drop("closed");
                }
            }
        }

        self.metrics
            .record_push(report.delivered as u64, started.elapsed().as_secs_f64());
        report
    }

    /// Remove subscribers that are gone and topics left empty.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        self.topics.retain(|_, subscribers| {
            let dead = subscribers
                .values()
                .filter(|w| w.upgrade().map_or(true, |s| !s.is_live()))
                .count();
            if dead > 0 {
                let alive: HashMap<_, _> = subscribers
                    .iter()
                    .filter(|(_, w)| w.upgrade().is_some_and(|s| s.is_live()))
                    .map(|(id, w)| (id.clone(), Weak::clone(w)))
                    .collect();
                report.dead_subscribers += dead;
                *subscribers = Arc::new(alive);
            }
            if subscribers.is_empty() {
                report.empty_topics += 1;
                false
            } else {
                true
            }
        });

        self.metrics.set_topics(self.topics.len() as i64);
        report
    }

    /// Live sessions subscribed to `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<Arc<Session>> {
        self.snapshot(topic)
            .map(|s| s.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.snapshot(topic).map_or(0, |s| s.len())
    }

    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn snapshot(&self, topic: &str) -> Option<Subscribers> {
        self.topics.get(topic).map(|entry| Arc::clone(entry.value()))
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new(Arc::new(GatewayMetrics::new()))
    }
}
