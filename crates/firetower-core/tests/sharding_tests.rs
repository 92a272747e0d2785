//! Hot-topic sharding distribution and stability.

use std::collections::HashMap;

use firetower_core::gateway::{fnv1a32, HotTopicSharding, SubscribeHook};

#[test]
fn test_rewrite_is_stable() {
    let sharding = HotTopicSharding::new(["live"], 100);
    let first = sharding.rewrite("user-42", "live".to_string());

    for _ in 0..100 {
        assert_eq!(sharding.rewrite("user-42", "live".to_string()), first);
    }
    assert_eq!(first, format!("live_{}", fnv1a32(b"user-42") % 100));
}

#[test]
fn test_distribution_is_roughly_uniform() {
    let shards = 10u32;
    let sharding = HotTopicSharding::new(["live"], shards);
    let mut counts: HashMap<u32, usize> = HashMap::new();

    let subscribers = 20_000;
    for i in 0..subscribers {
        *counts.entry(sharding.shard_of(&format!("subscriber-{i}"))).or_default() += 1;
    }

    assert_eq!(counts.len(), shards as usize);
    let expected = subscribers / shards as usize;
    for (shard, count) in counts {
        assert!(
            count > expected * 8 / 10 && count < expected * 12 / 10,
            "shard {shard} got {count}, expected about {expected}"
        );
    }
}

#[test]
fn test_other_topics_untouched() {
    let sharding = HotTopicSharding::new(["live"], 8);
    let (topics, allowed) = sharding.before_subscribe(
        "user-1",
        vec!["live".into(), "news".into(), "live_3".into()],
    );

    assert!(allowed);
    assert!(topics[0].starts_with("live_"));
    assert_eq!(topics[1], "news");
    assert_eq!(topics[2], "live_3");
}

#[test]
fn test_same_subscriber_same_shard_across_instances() {
    let a = HotTopicSharding::new(["live"], 32);
    let b = HotTopicSharding::new(["live"], 32);
    for i in 0..100 {
        let id = format!("u{i}");
        assert_eq!(a.shard_of(&id), b.shard_of(&id));
    }
}
