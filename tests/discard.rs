mod common;

use client_queue::core::{DiscardPolicy, Qos};

use common::{topics, Dropped, Harness};

fn fill(h: &Harness, queue: &str, qos: Qos, count: usize, limit: usize, policy: DiscardPolicy) -> Vec<u64> {
    (1..=count)
        .map(|i| {
            let publish = h.publish(qos, &format!("topic{i}"));
            let payload_id = publish.payload_id;
            h.add(queue, false, publish, limit, policy).unwrap();
            payload_id
        })
        .collect()
}

#[test]
fn discard_keeps_the_earliest_messages() {
    let h = Harness::new();
    let payloads = fill(&h, "client", Qos::AtLeastOnce, 5, 3, DiscardPolicy::Discard);

    assert_eq!(h.size("client", false), 3);
    let messages = h.read_new("client", false, &[1, 2, 3, 4, 5]);
    assert_eq!(topics(&messages), vec!["topic1", "topic2", "topic3"]);

    assert_eq!(h.dropped.queue_full_topics(), vec!["topic4", "topic5"]);
    for id in &payloads[..3] {
        assert_eq!(h.payloads.decrements_for(*id), 0);
    }
    for id in &payloads[3..] {
        assert_eq!(h.payloads.decrements_for(*id), 1);
    }
    assert_eq!(h.engine.stats().discarded, 2);
}

#[test]
fn discard_oldest_keeps_the_latest_messages() {
    let h = Harness::new();
    let payloads = fill(&h, "client", Qos::AtLeastOnce, 6, 3, DiscardPolicy::DiscardOldest);

    assert_eq!(h.size("client", false), 3);
    let messages = h.read_new("client", false, &[1, 2, 3, 4, 5, 6]);
    assert_eq!(topics(&messages), vec!["topic4", "topic5", "topic6"]);

    assert_eq!(h.dropped.queue_full_topics(), vec!["topic1", "topic2", "topic3"]);
    for id in &payloads[..3] {
        assert_eq!(h.payloads.decrements_for(*id), 1);
    }
    for id in &payloads[3..] {
        assert_eq!(h.payloads.decrements_for(*id), 0);
    }
}

#[test]
fn discard_oldest_never_evicts_in_flight_messages() {
    let h = Harness::new();
    fill(&h, "client", Qos::AtLeastOnce, 2, 2, DiscardPolicy::DiscardOldest);
    assert_eq!(h.read_new("client", false, &[1, 2]).len(), 2);

    let late = h.publish(Qos::AtLeastOnce, "late");
    let late_payload = late.payload_id;
    h.add("client", false, late, 2, DiscardPolicy::DiscardOldest).unwrap();

    assert_eq!(h.size("client", false), 2);
    assert_eq!(h.dropped.queue_full_topics(), vec!["late"]);
    assert_eq!(h.payloads.decrements_for(late_payload), 1);
}

#[test]
fn qos0_and_qos12_are_limited_separately() {
    let h = Harness::new();
    fill(&h, "client", Qos::AtLeastOnce, 2, 2, DiscardPolicy::Discard);
    fill(&h, "client", Qos::AtMostOnce, 3, 2, DiscardPolicy::Discard);

    assert_eq!(h.size("client", false), 4);
    assert_eq!(
        h.dropped.events(),
        vec![Dropped::QueueFull {
            queue_id: "client".to_string(),
            topic: "topic3".to_string(),
            qos: Qos::AtMostOnce,
        }]
    );
}

#[test]
fn discard_oldest_qos0_evicts_the_oldest_qos0_only() {
    let h = Harness::new();
    h.add_simple("client", Qos::AtLeastOnce, "keep");
    fill(&h, "client", Qos::AtMostOnce, 3, 2, DiscardPolicy::DiscardOldest);

    assert_eq!(h.size("client", false), 3);
    let messages = h.read_new("client", false, &[1, 2, 3, 4]);
    assert_eq!(topics(&messages), vec!["keep", "topic2", "topic3"]);
    assert_eq!(h.dropped.queue_full_topics(), vec!["topic1"]);
}
