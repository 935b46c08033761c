//! Message idempotency and acknowledgement transitions in the state store.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use meshclient::adapter::translate;
use meshclient::model::{AckStatus, Message, MessageId, NodeId};
use meshclient::protobuf as proto;
use meshclient::storage::{AckUpdate, StateStore, StoreSettings};

fn store() -> (tempfile::TempDir, StateStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(dir.path().join("messages.db"), StoreSettings::default()).unwrap();
    (dir, store)
}

fn message(id: &str, channel: u32, offset_ms: i64, text: &str) -> Message {
    Message {
        id: MessageId::new(id),
        channel,
        from: NodeId::new("!00000002"),
        to: NodeId::broadcast(),
        text: text.into(),
        timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
            + ChronoDuration::milliseconds(offset_ms),
        ack_status: AckStatus::Unacknowledged,
        rx_snr: None,
        outgoing: false,
        from_name: None,
    }
}

#[test]
fn redelivery_then_ack_leaves_one_acknowledged_row() {
    let (_dir, store) = store();
    let hello = message("msg-001", 0, 0, "hello");

    let first = store.upsert_message(&hello).unwrap();
    assert!(first.inserted && first.is_news());
    let again = store.upsert_message(&hello).unwrap();
    assert!(!again.inserted && !again.is_news());

    let mut acked = hello.clone();
    acked.ack_status = AckStatus::Acknowledged;
    let outcome = store.upsert_message(&acked).unwrap();
    assert!(outcome.status_changed);
    assert_eq!(outcome.message.ack_status, AckStatus::Acknowledged);

    let rows: Vec<Message> = store
        .list_messages(0, Utc.timestamp_opt(0, 0).unwrap())
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text, "hello");
    assert_eq!(rows[0].ack_status, AckStatus::Acknowledged);
}

#[test]
fn replayed_packet_without_id_is_stored_once() {
    let (_dir, store) = store();
    let packet = proto::MeshPacket {
        from: 0x1234,
        to: 0xffff_ffff,
        payload_variant: Some(proto::mesh_packet::PayloadVariant::Decoded(proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: b"anyone on?".to_vec(),
            ..Default::default()
        })),
        ..Default::default()
    };
    let first = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
    let replay = Utc.timestamp_millis_opt(1_700_000_005_000).unwrap();

    let a = store
        .upsert_message(&translate::text_message(&packet, first).unwrap())
        .unwrap();
    let b = store
        .upsert_message(&translate::text_message(&packet, replay).unwrap())
        .unwrap();
    assert!(a.inserted);
    assert!(!b.inserted);
    // The first receipt time is kept.
    assert_eq!(b.message.timestamp, first);

    let rows = store
        .list_messages(0, Utc.timestamp_opt(0, 0).unwrap())
        .count();
    assert_eq!(rows, 1);
}

#[test]
fn acknowledged_never_regresses() {
    let (_dir, store) = store();
    let m = message("msg-002", 0, 0, "ping");
    store.upsert_message(&m).unwrap();
    assert!(matches!(
        store.set_ack_status(&m.id, AckStatus::Acknowledged).unwrap(),
        AckUpdate::Changed(_)
    ));

    // Redelivery of the original, unacknowledged copy.
    let replay = store.upsert_message(&m).unwrap();
    assert!(!replay.is_news());
    assert_eq!(replay.message.ack_status, AckStatus::Acknowledged);

    assert!(matches!(
        store.set_ack_status(&m.id, AckStatus::Failed).unwrap(),
        AckUpdate::Unchanged(_)
    ));
    assert!(matches!(
        store.set_ack_status(&m.id, AckStatus::Unacknowledged).unwrap(),
        AckUpdate::Unchanged(_)
    ));
    assert_eq!(
        store.message(&m.id).unwrap().unwrap().ack_status,
        AckStatus::Acknowledged
    );
}

#[test]
fn ack_for_unknown_message_is_reported_not_stored() {
    let (_dir, store) = store();
    let id = MessageId::new("!0badcafe/00000001");
    assert!(matches!(
        store.set_ack_status(&id, AckStatus::Acknowledged).unwrap(),
        AckUpdate::Unknown
    ));
    assert!(store.message(&id).unwrap().is_none());
}

#[test]
fn listing_filters_channel_and_since_in_time_order() {
    let (_dir, store) = store();
    store.upsert_message(&message("c", 1, 300, "third")).unwrap();
    store.upsert_message(&message("a", 1, 100, "first")).unwrap();
    store.upsert_message(&message("b", 1, 200, "second")).unwrap();
    store.upsert_message(&message("z", 2, 150, "elsewhere")).unwrap();

    let since = Utc.timestamp_millis_opt(1_700_000_000_200).unwrap();
    let texts: Vec<String> = store
        .list_messages(1, since)
        .page_size(1)
        .map(|m| m.unwrap().text)
        .collect();
    assert_eq!(texts, vec!["second", "third"]);
}
