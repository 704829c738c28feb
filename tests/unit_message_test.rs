use bytes::Bytes;
use std::time::Duration;
use tether::core::message::{Message, MessageFlags, MessageKind};
use tether::core::stats::{ConnStats, TrafficCounter};

#[test]
fn test_request_ids_are_unique() {
    let a = Message::request(Bytes::from_static(b"h"), vec![]);
    let b = Message::request(Bytes::from_static(b"h"), vec![]);
    let c = Message::oneway(Bytes::from_static(b"h"), vec![]);
    assert_ne!(a.id, b.id);
    assert_ne!(b.id, c.id);
    assert_eq!(a.kind, MessageKind::Request);
    assert_eq!(c.kind, MessageKind::OneWay);
    assert!(a.flags.is_empty());
}

#[test]
fn test_response_carries_request_id() {
    let request = Message::request(Bytes::from_static(b"h"), vec![]);
    let response = Message::response(request.id, Bytes::new(), vec![]);
    assert_eq!(response.id, request.id);
    assert_eq!(response.kind, MessageKind::Response);
}

#[test]
fn test_lengths_and_flatten() {
    let msg = Message::request(
        Bytes::from_static(b"head"),
        vec![Bytes::from_static(b"hello "), Bytes::from_static(b"world")],
    );
    assert_eq!(msg.body_len(), 11);
    assert_eq!(msg.wire_len(), 15);
    assert_eq!(msg.flatten_body(), Bytes::from_static(b"hello world"));

    let empty = Message::oneway(Bytes::new(), vec![]);
    assert_eq!(empty.flatten_body(), Bytes::new());
}

#[test]
fn test_with_flags() {
    let msg = Message::request(Bytes::new(), vec![])
        .with_flags(MessageFlags::ASYNC | MessageFlags::USER_ALLOCATED_BUFFER);
    assert!(msg.flags.contains(MessageFlags::ASYNC));
    assert!(!msg.flags.contains(MessageFlags::USER_OWNS_RESPONSE_DATA));
}

#[test]
fn test_kind_index_and_display() {
    let indices: Vec<usize> = MessageKind::ALL.iter().map(|k| k.index()).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(MessageKind::OneWay.to_string(), "oneway");
}

#[test]
fn test_traffic_counter_snapshot() {
    let counter = TrafficCounter::default();
    assert_eq!(counter.snapshot().avg_us, 0);
    counter.record(Duration::from_micros(100));
    counter.record(Duration::from_micros(300));
    let snap = counter.snapshot();
    assert_eq!(snap.count, 2);
    assert_eq!(snap.total_us, 400);
    assert_eq!(snap.avg_us, 200);
    assert_eq!(snap.max_us, 300);
}

#[test]
fn test_conn_stats_track_kinds_separately() {
    let stats = ConnStats::default();
    stats.record_tx(MessageKind::Request, Duration::from_micros(10));
    stats.record_rx(MessageKind::Response, Duration::from_micros(20));
    stats.record_rx(MessageKind::Response, Duration::from_micros(40));

    let snap = stats.snapshot();
    assert_eq!(snap.tx_request.count, 1);
    assert_eq!(snap.rx_response.count, 2);
    assert_eq!(snap.rx_response.avg_us, 30);
    assert_eq!(snap.tx_oneway.count, 0);
    assert_eq!(stats.rx(MessageKind::Request).count, 0);

    let json = serde_json::to_value(snap).unwrap();
    assert_eq!(json["rx_response"]["max_us"], 40);
}
