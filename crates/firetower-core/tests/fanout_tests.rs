//! Bucket fanout properties.

use std::sync::Arc;
use std::time::{Duration, Instant};

use firetower_core::gateway::{Bucket, Session};
use firetower_core::{GatewayMetrics, Message};

fn message(id: &str, topic: &str) -> Arc<Message> {
    Arc::new(Message::publish(id, "user", topic, "payload"))
}

#[test]
fn test_capacity_one_scenario() {
    let bucket = Bucket::default();
    let (session, mut rx) = Session::new("s", 1, None);
    bucket.add_subscribe("room", &session);

    assert_eq!(bucket.push(message("msg1", "room")).delivered, 1);

    let started = Instant::now();
    let report = bucket.push(message("msg2", "room"));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(report.dropped, 1);

    assert_eq!(rx.try_recv().unwrap().id, "msg1");
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_full_subscriber_does_not_block_others() {
    let metrics = Arc::new(GatewayMetrics::new());
    let bucket = Bucket::new(Arc::clone(&metrics));

    let (slow, _slow_rx) = Session::new("slow", 10, None);
    bucket.add_subscribe("room", &slow);
    for i in 0..10 {
        slow.try_deliver(message(&format!("fill-{i}"), "room"));
    }

    let mut fast = Vec::new();
    for i in 0..50 {
        let (session, rx) = Session::new(format!("fast-{i}"), 10, None);
        bucket.add_subscribe("room", &session);
        fast.push((session, rx));
    }

    let started = Instant::now();
    let report = bucket.push(message("x", "room"));
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(report.delivered, 50);
    assert_eq!(report.dropped, 1);
    for (_, rx) in &mut fast {
        assert_eq!(rx.try_recv().unwrap().id, "x");
    }
    assert_eq!(
        metrics
            .messages_dropped
            .with_label_values(&["queue_full"])
            .get() as u64,
        1
    );
}

#[test]
fn test_membership_follows_subscribe_and_unsubscribe() {
    let bucket = Bucket::default();
    let (a, mut rx_a) = Session::new("a", 8, None);
    let (b, mut rx_b) = Session::new("b", 8, None);

    bucket.add_subscribe("room", &a);
    bucket.add_subscribe("room", &b);
    bucket.push(message("1", "room"));

    bucket.remove_subscribe("room", &a);
    bucket.push(message("2", "room"));

    assert_eq!(rx_a.try_recv().unwrap().id, "1");
    assert!(rx_a.try_recv().is_err());
    assert_eq!(rx_b.try_recv().unwrap().id, "1");
    assert_eq!(rx_b.try_recv().unwrap().id, "2");
}

#[test]
fn test_topics_are_isolated() {
    let bucket = Bucket::default();
    let (a, mut rx_a) = Session::new("a", 8, None);
    let (b, mut rx_b) = Session::new("b", 8, None);
    bucket.add_subscribe("one", &a);
    bucket.add_subscribe("two", &b);

    bucket.push(message("1", "one"));

    assert!(rx_a.try_recv().is_ok());
    assert!(rx_b.try_recv().is_err());
}

#[test]
fn test_concurrent_push_and_subscribe() {
    let bucket = Arc::new(Bucket::default());
    let (anchor, mut anchor_rx) = Session::new("anchor", 10_000, None);
    bucket.add_subscribe("room", &anchor);

    let writer = {
        let bucket = Arc::clone(&bucket);
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for i in 0..500 {
                let (session, rx) = Session::new(format!("s{i}"), 4, None);
                bucket.add_subscribe("room", &session);
                if i % 2 == 0 {
                    bucket.remove_subscribe("room", &session);
                }
                held.push((session, rx));
            }
            held
        })
    };

    for i in 0..1_000 {
        bucket.push(message(&i.to_string(), "room"));
    }
    let held = writer.join().unwrap();

    let mut received = 0;
    while anchor_rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, 1_000);
    assert_eq!(bucket.subscriber_count("room"), 1 + held.len() / 2);
}
