//! Tiered-storage offload: ingest, batch upload, ack-after-durable-upload,
//! retry on failure, and window reconfiguration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use common::{world, World, TENANT};
use object_store::memory::InMemory;
use object_store::ObjectStore;
use stationd::broker::config::EditClusterConfigRequest;
use stationd::broker::tiered_storage::TieredStorageMsg;
use stationd::constants::{
    GLOBAL_ACCOUNT, TIERED_STORAGE_CONSUMER, TIERED_STORAGE_STREAM,
};
use stationd::headers::HeaderMap;
use stationd::substrate::Substrate;

/// Republish a station message into the tiered-storage work queue, the
/// way the write path shadows it.
async fn shadow_publish(w: &World, station: &str, payload: &[u8]) {
    let mut headers = HeaderMap::new();
    headers.insert("$memphis_connectionId", "c1");
    let mut frame = headers.encode().to_vec();
    frame.extend_from_slice(payload);
    let wire = TieredStorageMsg {
        station_name: station.to_string(),
        tenant_name: TENANT.to_string(),
        buf: BASE64.encode(&frame),
    };
    w.substrate
        .publish(
            GLOBAL_ACCOUNT,
            &format!("{TIERED_STORAGE_STREAM}.{station}"),
            None,
            None,
            Bytes::from(serde_json::to_vec(&wire).unwrap()),
        )
        .await
        .unwrap();
}

async fn work_queue_depth(w: &World) -> u64 {
    w.substrate
        .stream_info(GLOBAL_ACCOUNT, TIERED_STORAGE_STREAM)
        .await
        .unwrap()
        .state
        .msgs
}

#[tokio::test(start_paused = true)]
async fn flush_uploads_batch_and_drains_queue() {
    let w = world().await;
    let store = Arc::new(InMemory::new());
    w.store_provider.insert(TENANT, store.clone());

    // tiered_storage_time_sec = 5, per the scenario.
    w.coordinator
        .edit(EditClusterConfigRequest {
            dls_retention_hours: 3,
            logs_retention_days: 30,
            tiered_storage_time_sec: 5,
            broker_host: String::new(),
            ui_host: String::new(),
            rest_gw_host: String::new(),
            max_msg_size_mb: 1,
        })
        .await
        .unwrap();

    for i in 0..100 {
        shadow_publish(&w, "orders", format!("m{i}").as_bytes()).await;
    }
    assert_eq!(work_queue_depth(&w).await, 100);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let ingest = tokio::spawn(Arc::clone(&w.tiered).run_ingest(stop_rx.clone()));
    let flush = tokio::spawn(Arc::clone(&w.tiered).run_flush(stop_rx));

    // Within two windows the batch must be durable and the queue empty.
    for _ in 0..100 {
        tokio::time::advance(Duration::from_millis(200)).await;
        if work_queue_depth(&w).await == 0 {
            break;
        }
    }
    assert_eq!(work_queue_depth(&w).await, 0, "work queue drained");

    let objects: Vec<_> = {
        use futures::TryStreamExt;
        store.list(None).try_collect().await.unwrap()
    };
    assert!(!objects.is_empty());
    let mut total_entries = 0;
    for meta in &objects {
        let body = store.get(&meta.location).await.unwrap().bytes().await.unwrap();
        let entries: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert!(meta.location.as_ref().starts_with("acme/orders/"));
        total_entries += entries.len();
    }
    assert_eq!(total_entries, 100, "every message appears exactly once");

    let _ = stop_tx.send(true);
    let _ = tokio::join!(ingest, flush);
}

#[tokio::test]
async fn tenants_without_integration_are_acked_without_upload() {
    let w = world().await;
    // No store registered for the tenant.
    shadow_publish(&w, "orders", b"x").await;

    let pulled = w
        .substrate
        .pull_next(
            GLOBAL_ACCOUNT,
            TIERED_STORAGE_STREAM,
            TIERED_STORAGE_CONSUMER,
            1000,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert_eq!(pulled.len(), 1);
    for msg in pulled {
        let (tenant, buffered) = stationd::broker::tiered_storage::parse_frame(&msg).unwrap();
        assert_eq!(tenant, TENANT);
        w.tiered.buffer(tenant, buffered);
    }
    assert_eq!(w.tiered.buffered_count(), 1);

    let acked = w.tiered.flush_once().await.unwrap();
    assert_eq!(acked, 1);
    assert_eq!(w.tiered.buffered_count(), 0);
    assert_eq!(work_queue_depth(&w).await, 0);
}

#[tokio::test]
async fn failed_upload_retains_buffer_and_leaves_queue_unacked() {
    let w = world().await;

    // A filesystem store whose backing directory is gone fails every put.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone");
    std::fs::create_dir_all(&path).unwrap();
    let store = Arc::new(object_store::local::LocalFileSystem::new_with_prefix(&path).unwrap());
    std::fs::remove_dir_all(&path).unwrap();
    w.store_provider.insert(TENANT, store);

    shadow_publish(&w, "orders", b"precious").await;
    let pulled = w
        .substrate
        .pull_next(
            GLOBAL_ACCOUNT,
            TIERED_STORAGE_STREAM,
            TIERED_STORAGE_CONSUMER,
            1000,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    for msg in pulled {
        let (tenant, buffered) = stationd::broker::tiered_storage::parse_frame(&msg).unwrap();
        w.tiered.buffer(tenant, buffered);
    }

    let err = w.tiered.flush_once().await.unwrap_err();
    assert!(err.to_string().contains("upload failed"), "{err}");
    // Nothing lost: the buffer is retained and the queue keeps the
    // unacked message for redelivery.
    assert_eq!(w.tiered.buffered_count(), 1);
    assert_eq!(work_queue_depth(&w).await, 1);

    // Once the target heals, the same cycle succeeds and drains.
    std::fs::create_dir_all(&path).unwrap();
    let acked = w.tiered.flush_once().await.unwrap();
    assert_eq!(acked, 1);
    assert_eq!(w.tiered.buffered_count(), 0);
    assert_eq!(work_queue_depth(&w).await, 0);
}

#[tokio::test(start_paused = true)]
async fn window_reconfig_rebuilds_consumer_ack_wait() {
    let w = world().await;
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let flush = tokio::spawn(Arc::clone(&w.tiered).run_flush(stop_rx));
    tokio::time::advance(Duration::from_millis(10)).await;

    w.coordinator
        .edit(EditClusterConfigRequest {
            dls_retention_hours: 3,
            logs_retention_days: 30,
            tiered_storage_time_sec: 7,
            broker_host: String::new(),
            ui_host: String::new(),
            rest_gw_host: String::new(),
            max_msg_size_mb: 1,
        })
        .await
        .unwrap();

    // Give the flush task a tick to observe the change.
    for _ in 0..10 {
        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
    }

    let info = w
        .substrate
        .consumer_info(GLOBAL_ACCOUNT, TIERED_STORAGE_STREAM, TIERED_STORAGE_CONSUMER)
        .await
        .unwrap();
    assert_eq!(
        info.config.ack_wait,
        Duration::from_secs(14),
        "ack wait equals twice the window"
    );
    assert!(w.streams.tiered_storage_ready());

    let _ = stop_tx.send(true);
    let _ = flush.await;
}
