//! Subscribe-time topic rewriting.
//!
//! A [`SubscribeHook`] sees every subscribe request before the bucket does. It
//! may rename topics and may refuse the whole request. [`HotTopicSharding`]
//! is the stock policy: subscribers of a designated hot topic are spread over
//! `shard_count` sub-topics named `<topic>_<shard>`, with the shard chosen by
//! hashing the subscriber id so the same subscriber always lands on the same
//! shard.

use std::collections::HashSet;

use tracing::debug;

use crate::config::ShardingConfig;

/// Pre-subscribe interception point.
pub trait SubscribeHook: Send + Sync {
    /// Rewrite `topics` for `subscriber_id`. The boolean is the allow/deny
    /// decision; on deny the returned topics are ignored.
    fn before_subscribe(&self, subscriber_id: &str, topics: Vec<String>) -> (Vec<String>, bool);
}

impl<F> SubscribeHook for F
where
    F: Fn(&str, Vec<String>) -> (Vec<String>, bool) + Send + Sync,
{
    fn before_subscribe(&self, subscriber_id: &str, topics: Vec<String>) -> (Vec<String>, bool) {
        self(subscriber_id, topics)
    }
}

/// 32-bit FNV-1a.
#[must_use]
pub fn fnv1a32(data: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Spreads subscribers of hot topics across shards.
#[derive(Debug, Clone)]
pub struct HotTopicSharding {
    hot_topics: HashSet<String>,
    shard_count: u32,
}

impl HotTopicSharding {
    /// `shard_count` of zero is treated as one.
    pub fn new<I, S>(hot_topics: I, shard_count: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hot_topics: hot_topics.into_iter().map(Into::into).collect(),
            shard_count: shard_count.max(1),
        }
    }

    #[must_use]
    pub fn from_config(config: &ShardingConfig) -> Self {
        Self::new(config.hot_topics.iter().cloned(), config.shard_count)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hot_topics.is_empty()
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Shard index for a subscriber.
    #[must_use]
    pub fn shard_of(&self, subscriber_id: &str) -> u32 {
        fnv1a32(subscriber_id.as_bytes()) % self.shard_count
    }

    /// Rewrite a single topic for a subscriber.
    #[must_use]
    pub fn rewrite(&self, subscriber_id: &str, topic: String) -> String {
        if self.hot_topics.contains(&topic) {
            format!("{topic}_{}", self.shard_of(subscriber_id))
        } else {
            topic
        }
    }
}

impl SubscribeHook for HotTopicSharding {
    fn before_subscribe(&self, subscriber_id: &str, topics: Vec<String>) -> (Vec<String>, bool) {
        let rewritten = topics
            .into_iter()
            .map(|topic| {
                let target = self.rewrite(subscriber_id, topic);
                debug!(subscriber_id, topic = %target, "subscribe rewritten");
                target
            })
            .collect();
        (rewritten, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a32_known_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn test_hot_topic_rewritten() {
        let sharding = HotTopicSharding::new(["live_stream"], 100);
        let expected = format!("live_stream_{}", fnv1a32(b"42") % 100);

        let (topics, allowed) =
            sharding.before_subscribe("42", vec!["live_stream".to_string(), "news".to_string()]);

        assert!(allowed);
        assert_eq!(topics, vec![expected, "news".to_string()]);
    }

    #[test]
    fn test_rewrite_is_stable() {
        let sharding = HotTopicSharding::new(["live_stream"], 16);
        let first = sharding.rewrite("user-7", "live_stream".to_string());
        for _ in 0..10 {
            assert_eq!(sharding.rewrite("user-7", "live_stream".to_string()), first);
        }
    }

    #[test]
    fn test_zero_shards_clamped() {
        let sharding = HotTopicSharding::new(["hot"], 0);
        assert_eq!(sharding.shard_count(), 1);
        assert_eq!(sharding.rewrite("anyone", "hot".to_string()), "hot_0");
    }

    #[test]
    fn test_closure_hook_can_deny() {
        let hook = |_: &str, topics: Vec<String>| {
            let allowed = !topics.iter().any(|t| t.starts_with("admin"));
            (topics, allowed)
        };

        let (_, allowed) = hook.before_subscribe("u", vec!["admin_panel".to_string()]);
        assert!(!allowed);
        let (_, allowed) = hook.before_subscribe("u", vec!["room".to_string()]);
        assert!(allowed);
    }
}
