//! The dead-letter pipeline end to end: poison capture, coalescing,
//! resend-loop protection, journeys, acks, and the retention sweep.

mod common;

use std::time::Duration;

use common::{world, World, TENANT};
use stationd::broker::config::EditClusterConfigRequest;
use stationd::broker::dls::{PmAckEvent, SchemaverseDlsEvent, SchemaverseMessage, SchemaverseProducer};
use stationd::broker::sessions::CreateConsumerRequest;
use stationd::constants::{DLS_PRODUCER_MARKER, HDR_PRODUCED_BY};
use stationd::headers::HeaderMap;
use stationd::metadata::{DlsKind, MetadataDb, Station};
use stationd::substrate::Substrate;

const MAX_DELIVERIES: i32 = 10;
const ACK_TIME_MS: i64 = 100;

async fn station_with_group(w: &World, group: &str) -> Station {
    let station = match w.registry.get(TENANT, "orders").await {
        Ok(station) => station,
        Err(_) => {
            let station = w.create_station("orders").await;
            w.producers
                .register(TENANT, &station, "p1", "c1", "10.0.0.1:4222", "root")
                .await
                .unwrap();
            station
        }
    };
    w.consumers
        .create(
            TENANT,
            &station,
            CreateConsumerRequest {
                name: group.to_string(),
                max_ack_time_ms: ACK_TIME_MS,
                max_msg_deliveries: MAX_DELIVERIES,
                last_messages: -1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    station
}

/// Drive a group until its delivery budget for `fail_seq` is spent: every
/// other message is acked, the failing one never is.
async fn exhaust_deliveries(w: &World, group: &str, fail_seq: u64) {
    for _ in 0..(MAX_DELIVERIES as usize + 2) {
        let msgs = w
            .substrate
            .pull_next(TENANT, "orders", group, 10, Duration::from_millis(20))
            .await
            .unwrap();
        for msg in msgs {
            if msg.msg.sequence != fail_seq {
                w.substrate.ack(TENANT, &msg.reply_subject).await.unwrap();
            }
        }
        tokio::time::advance(Duration::from_millis(ACK_TIME_MS as u64 + 50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn poison_event_creates_one_record_and_notifies_once() {
    let w = world().await;
    w.enable_slack(TENANT);
    let station = station_with_group(&w, "g1").await;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        w.publish_native("orders", "c1", "p1", payload).await;
    }

    exhaust_deliveries(&w, "g1", 2).await;
    assert_eq!(w.drain_unacked().await, 1);

    let records = w.db.list_dls_by_station(station.id).await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.message_seq, 2);
    assert_eq!(record.message_type, DlsKind::Poison);
    assert_eq!(record.poisoned_cgs, vec!["g1"]);
    assert_eq!(record.message_details.data, hex::encode(b"b"));

    // Exactly one notification, carrying the record URL.
    let sent = w.sink.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "Poison message");
    assert!(sent[0].2.contains(&format!("/stations/orders/{}", record.id)));

    // The original stays readable until retention expires it.
    let msg = w.substrate.get_message(TENANT, "orders", 2).await.unwrap();
    assert_eq!(&msg.data[..], b"b");
}

#[tokio::test(start_paused = true)]
async fn second_group_coalesces_into_same_record() {
    let w = world().await;
    let station = station_with_group(&w, "g1").await;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        w.publish_native("orders", "c1", "p1", payload).await;
    }
    exhaust_deliveries(&w, "g1", 2).await;
    w.drain_unacked().await;

    station_with_group(&w, "g2").await;
    exhaust_deliveries(&w, "g2", 2).await;
    w.drain_unacked().await;

    let records = w.db.list_dls_by_station(station.id).await.unwrap();
    assert_eq!(records.len(), 1, "coalesced into one record");
    let mut cgs = records[0].poisoned_cgs.clone();
    cgs.sort();
    assert_eq!(cgs, vec!["g1", "g2"]);
}

#[tokio::test(start_paused = true)]
async fn resend_carries_marker_and_never_repoisons() {
    let w = world().await;
    let station = station_with_group(&w, "g1").await;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        w.publish_native("orders", "c1", "p1", payload).await;
    }
    exhaust_deliveries(&w, "g1", 2).await;
    w.drain_unacked().await;
    let record_id = w.db.list_dls_by_station(station.id).await.unwrap()[0].id;

    let resent = w.dls.resend(TENANT, &[record_id]).await.unwrap();
    assert_eq!(resent, 1);

    // The resend landed on the final subject with the DLS marker.
    let msg = w.substrate.get_message(TENANT, "orders", 4).await.unwrap();
    assert_eq!(&msg.data[..], b"b");
    let headers = HeaderMap::decode(&msg.headers).unwrap();
    assert_eq!(headers.get(HDR_PRODUCED_BY), Some(DLS_PRODUCER_MARKER));
    assert_eq!(
        headers.get("$memphis_pm_id"),
        Some(record_id.to_string().as_str())
    );

    // The group fails the resend too; its advisory must not create a new
    // record.
    exhaust_deliveries(&w, "g1", 4).await;
    w.drain_unacked().await;
    let records = w.db.list_dls_by_station(station.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].poisoned_cgs, vec!["g1"]);
}

#[tokio::test(start_paused = true)]
async fn journey_reports_per_group_snapshot() {
    let w = world().await;
    let station = station_with_group(&w, "g1").await;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        w.publish_native("orders", "c1", "p1", payload).await;
    }
    exhaust_deliveries(&w, "g1", 2).await;
    w.drain_unacked().await;
    let record_id = w.db.list_dls_by_station(station.id).await.unwrap()[0].id;

    let journey = w.dls.journey(record_id).await.unwrap();
    assert_eq!(journey.station_name, "orders");
    assert_eq!(journey.message_seq, 2);
    assert_eq!(journey.message_type, DlsKind::Poison);

    let producer = journey.producer.expect("native station has a producer");
    assert_eq!(producer.name, "p1");
    assert_eq!(producer.connection_id, "c1");
    assert_eq!(producer.client_address, "10.0.0.1:4222");

    assert_eq!(journey.poisoned_cgs.len(), 1);
    let cg = &journey.poisoned_cgs[0];
    assert_eq!(cg.cg_name, "g1");
    assert_eq!(cg.max_ack_time_ms, ACK_TIME_MS);
    assert_eq!(cg.max_msg_deliveries, MAX_DELIVERIES);
    assert_eq!(cg.total_poison_messages, 1);
    assert_eq!(cg.members.len(), 1);
    assert!(cg.is_active);
    assert!(!cg.is_deleted);

    // Reserved headers never reach the journey view.
    assert!(journey.message.headers.keys().all(|k| !k.starts_with("$memphis")));
}

#[tokio::test(start_paused = true)]
async fn pm_ack_paths_modern_and_legacy() {
    let w = world().await;
    let station = station_with_group(&w, "g1").await;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        w.publish_native("orders", "c1", "p1", payload).await;
    }
    exhaust_deliveries(&w, "g1", 2).await;
    w.drain_unacked().await;
    station_with_group(&w, "g2").await;
    exhaust_deliveries(&w, "g2", 2).await;
    w.drain_unacked().await;
    let record_id = w.db.list_dls_by_station(station.id).await.unwrap()[0].id;

    // Modern path drops one group.
    w.dls
        .handle_pm_ack(&PmAckEvent {
            id: record_id,
            cg_name: "g1".into(),
            tenant_name: TENANT.into(),
        })
        .await
        .unwrap();
    let record = w.db.get_dls_message(record_id).await.unwrap().unwrap();
    assert_eq!(record.poisoned_cgs, vec!["g2"]);

    // Dropping the last group removes the record.
    w.dls
        .handle_pm_ack(&PmAckEvent {
            id: record_id,
            cg_name: "g2".into(),
            tenant_name: TENANT.into(),
        })
        .await
        .unwrap();
    assert!(w.db.get_dls_message(record_id).await.unwrap().is_none());

    // Legacy path (no group) drops the whole record.
    w.publish_native("orders", "c1", "p1", b"d").await;
    exhaust_deliveries(&w, "g2", 4).await;
    w.drain_unacked().await;
    let record_id = w.db.list_dls_by_station(station.id).await.unwrap()[0].id;
    w.dls
        .handle_pm_ack(&PmAckEvent {
            id: record_id,
            cg_name: String::new(),
            tenant_name: TENANT.into(),
        })
        .await
        .unwrap();
    assert!(w.db.get_dls_message(record_id).await.unwrap().is_none());
}

#[tokio::test]
async fn schema_failure_path_records_without_groups() {
    let w = world().await;
    let station = w
        .registry
        .create(
            TENANT,
            stationd::broker::station::CreateStationRequest {
                name: "orders".into(),
                dls_schemaverse: true,
                created_by_username: "root".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    w.producers
        .register(TENANT, &station, "p1", "c1", "", "root")
        .await
        .unwrap();

    let event = SchemaverseDlsEvent {
        station_name: "orders".into(),
        producer: SchemaverseProducer {
            name: "p1".into(),
            connection_id: "c1".into(),
        },
        message: SchemaverseMessage {
            time_sent: None,
            size: 4,
            data: hex::encode(b"data"),
            headers: Default::default(),
        },
        validation_error: "Schema validation has failed: expected field id".into(),
        tenant_name: TENANT.into(),
    };
    let id = w
        .dls
        .process_schema_failure(&event)
        .await
        .unwrap()
        .expect("recorded");

    let record = w.db.get_dls_message(id).await.unwrap().unwrap();
    assert_eq!(record.message_type, DlsKind::Schema);
    assert!(record.poisoned_cgs.is_empty());
    assert!(record.validation_error.contains("expected field id"));

    // Unknown producers are dropped, not errors.
    let mut orphan = event.clone();
    orphan.producer.name = "ghost".into();
    assert!(w.dls.process_schema_failure(&orphan).await.unwrap().is_none());

    let (poison, schema, total) = w.dls.list_light(&station).await.unwrap();
    assert!(poison.is_empty());
    assert_eq!(schema.len(), 1);
    assert_eq!(total, 1);
}

#[tokio::test(start_paused = true)]
async fn retention_sweep_honors_the_window() {
    let w = world().await;
    let station = station_with_group(&w, "g1").await;
    for payload in [b"a" as &[u8], b"b", b"c"] {
        w.publish_native("orders", "c1", "p1", payload).await;
    }
    exhaust_deliveries(&w, "g1", 2).await;
    w.drain_unacked().await;
    assert_eq!(w.db.list_dls_by_station(station.id).await.unwrap().len(), 1);

    // A generous window spares the record.
    assert_eq!(w.dls.sweep_retention().await.unwrap(), 0);

    // Let the wall clock move past the record's timestamp, then shrink
    // the window to zero so the next sweep expires it.
    std::thread::sleep(Duration::from_millis(5));
    w.coordinator
        .edit(EditClusterConfigRequest {
            dls_retention_hours: 0,
            logs_retention_days: 30,
            tiered_storage_time_sec: 8,
            broker_host: String::new(),
            ui_host: String::new(),
            rest_gw_host: String::new(),
            max_msg_size_mb: 1,
        })
        .await
        .unwrap();
    assert_eq!(w.dls.sweep_retention().await.unwrap(), 1);
    assert!(w.db.list_dls_by_station(station.id).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn light_listing_truncates_previews() {
    let w = world().await;
    let station = station_with_group(&w, "g1").await;
    let big = vec![0xabu8; 200];
    w.publish_native("orders", "c1", "p1", &big).await;
    exhaust_deliveries(&w, "g1", 1).await;
    w.drain_unacked().await;

    let (poison, _, total) = w.dls.list_light(&station).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(poison[0].message.data.len(), 80);
    // The stored record keeps the full payload.
    let full = &w.db.list_dls_by_station(station.id).await.unwrap()[0];
    assert_eq!(full.message_details.data.len(), 400);
}
