mod common;

use std::collections::HashSet;

use client_queue::config::Config;
use client_queue::core::message::NO_PACKET_ID;
use client_queue::core::{DiscardPolicy, InflightMessage, Qos};

use common::{topics, Harness, BIG_BYTE_LIMIT};

fn single_bucket() -> Harness {
    Harness::with_config(Config {
        bucket_count: 1,
        ..Config::default()
    })
}

#[test]
fn shared_and_plain_queues_with_the_same_id_are_independent() {
    let h = Harness::new();
    let plain = h.publish(Qos::AtMostOnce, "not_shared");
    let shared = h.publish(Qos::AtMostOnce, "shared");
    h.add("id", false, plain, 10, DiscardPolicy::Discard).unwrap();
    h.add("id", true, shared, 10, DiscardPolicy::Discard).unwrap();

    assert_eq!(h.size("id", false), 1);
    assert_eq!(h.size("id", true), 1);

    assert_eq!(topics(&h.read_new("id", false, &[1])), vec!["not_shared"]);
    assert_eq!(h.size("id", true), 1);
    assert_eq!(topics(&h.read_new("id", true, &[1])), vec!["shared"]);
}

#[test]
fn shared_queues_are_limited_on_their_own() {
    let h = Harness::new();
    for i in 0..2 {
        let publish = h.publish(Qos::AtLeastOnce, &format!("plain{i}"));
        h.add("id", false, publish, 2, DiscardPolicy::Discard).unwrap();
    }
    let publish = h.publish(Qos::AtLeastOnce, "group");
    h.add("id", true, publish, 2, DiscardPolicy::Discard).unwrap();

    assert_eq!(h.size("id", false), 2);
    assert_eq!(h.size("id", true), 1);
    assert!(h.dropped.events().is_empty());
}

#[test]
fn shared_reads_hand_out_markers_instead_of_packet_ids() {
    let h = Harness::new();
    let bucket = h.bucket("group");
    for i in 0..3 {
        let publish = h.publish(Qos::AtLeastOnce, &format!("topic{i}"));
        h.add("group", true, publish, 10, DiscardPolicy::Discard).unwrap();
    }

    let messages = h.read_new("group", true, &[1, 2]);
    assert_eq!(topics(&messages), vec!["topic0", "topic1"]);
    assert!(messages.iter().all(|m| m.packet_id == NO_PACKET_ID));
    assert_eq!(h.size("group", true), 3);

    let inflight = h
        .engine
        .read_inflight("group", true, 10, BIG_BYTE_LIMIT, bucket)
        .unwrap();
    assert_eq!(inflight.len(), 2);
    assert!(inflight
        .iter()
        .all(|m| matches!(m, InflightMessage::Marker(p) if p.packet_id == NO_PACKET_ID)));

    // Only the unmarked message is still new.
    assert_eq!(topics(&h.read_new("group", true, &[1, 2])), vec!["topic2"]);
}

#[test]
fn removing_a_marker_makes_the_message_new_again() {
    let h = Harness::new();
    let bucket = h.bucket("group");
    let publish = h.publish(Qos::AtLeastOnce, "topic");
    let (unique_id, payload_id) = (publish.unique_id.clone(), publish.payload_id);
    h.add("group", true, publish, 10, DiscardPolicy::Discard).unwrap();
    assert_eq!(h.read_new("group", true, &[1]).len(), 1);
    assert!(h.read_new("group", true, &[1]).is_empty());

    assert!(h.engine.remove_in_flight_marker("group", &unique_id, bucket).unwrap());
    assert!(!h.engine.remove_in_flight_marker("group", &unique_id, bucket).unwrap());

    assert_eq!(h.size("group", true), 1);
    assert_eq!(h.payloads.decrements_for(payload_id), 0);
    assert_eq!(topics(&h.read_new("group", true, &[1])), vec!["topic"]);
}

#[test]
fn remove_shared_deletes_by_unique_id() {
    let h = Harness::new();
    let bucket = h.bucket("group");
    let first = h.publish(Qos::AtLeastOnce, "first");
    let second = h.publish(Qos::AtLeastOnce, "second");
    let (first_id, first_payload) = (first.unique_id.clone(), first.payload_id);
    let second_id = second.unique_id.clone();
    h.add("group", true, first, 10, DiscardPolicy::Discard).unwrap();
    h.add("group", true, second, 10, DiscardPolicy::Discard).unwrap();
    h.read_new("group", true, &[1]);

    // Marked entry.
    assert!(h.engine.remove_shared("group", &first_id, bucket).unwrap());
    assert!(!h.engine.remove_shared("group", &first_id, bucket).unwrap());
    assert_eq!(h.payloads.decrements_for(first_payload), 1);

    // New entry.
    assert!(h.engine.remove_shared("group", &second_id, bucket).unwrap());
    assert_eq!(h.size("group", true), 0);
}

#[test]
fn clean_up_reports_non_empty_shared_queues() {
    let h = single_bucket();
    for group in ["g1", "g2", "g3"] {
        let publish = h.publish(Qos::AtLeastOnce, group);
        h.add(group, true, publish, 10, DiscardPolicy::Discard).unwrap();
    }
    h.add_simple("plain", Qos::AtLeastOnce, "plain");
    h.engine.clear("g2", true, 0).unwrap();

    let active = h.engine.clean_up(0).unwrap();

    let expected: HashSet<String> = ["g1", "g3"].iter().map(|s| s.to_string()).collect();
    assert_eq!(active, expected);
    assert_eq!(h.engine.bucket_summary(0).unwrap().queues, 3);
}
