//! Background wiring: the full task table over the in-process substrate,
//! the startup contract, and the wire-driven loops.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{world, World, TENANT};
use stationd::broker::{start_background_tasks, BackgroundDeps};
use stationd::constants::{
    CONFIG_RELOAD_SIGNAL_SUBJECT, CONN_STATUS_SUBJECT, GLOBAL_ACCOUNT,
    INTEGRATIONS_UPDATES_SUBJECT, NOTIFICATIONS_SUBJECT, PM_ACKS_SUBJECT,
};
use stationd::error::Error;
use stationd::headers::HeaderMap;
use stationd::metadata::MetadataDb;
use stationd::substrate::{
    Bus, ConnectionInfo, ServerStats, Subscription, Substrate, SubstrateError, SubstrateResult,
};

fn deps(w: &World) -> BackgroundDeps {
    BackgroundDeps {
        substrate: Arc::clone(&w.substrate),
        db: w.db.clone(),
        streams: Arc::clone(&w.streams),
        dls: Arc::clone(&w.dls),
        tiered: Arc::clone(&w.tiered),
        throughput: Arc::clone(&w.throughput),
        coordinator: Arc::clone(&w.coordinator),
        integrations: w.integrations.clone(),
        notifier: w.notifier.clone(),
    }
}

#[tokio::test]
async fn full_task_table_starts_and_stops() {
    let w = world().await;
    let registry = start_background_tasks(deps(&w)).await.unwrap();

    for task in [
        "zombie_conn_check",
        "integration_updates",
        "config_reload",
        "notifications",
        "pm_acks",
        "schemaverse_dls",
        "dls_retention_sweep",
        "dls_unacked_consume",
        "tiered_storage_ingest",
        "tiered_storage_flush",
        "throughput_sampler",
    ] {
        assert!(registry.is_running(task), "{task} not running");
    }
    assert_eq!(registry.task_count(), 11);

    registry.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn zombie_conn_check_replies_with_connection_ids() {
    let w = world().await;
    w.bus.register_connection("conn-1::producer-a", "10.0.0.1:4222");
    w.bus.register_connection("conn-2::consumer-b", "10.0.0.2:4222");
    let registry = start_background_tasks(deps(&w)).await.unwrap();

    let mut inbox = w
        .substrate
        .subscribe(GLOBAL_ACCOUNT, "$memphis_conn_check_reply", None)
        .await
        .unwrap();
    w.substrate
        .publish(
            GLOBAL_ACCOUNT,
            CONN_STATUS_SUBJECT,
            Some("$memphis_conn_check_reply"),
            None,
            Bytes::new(),
        )
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("conn check reply")
        .unwrap();
    let ids: HashMap<String, String> = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains_key("conn-1"));
    assert!(ids.contains_key("conn-2"));

    registry.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn wire_events_drive_the_queue_loops() {
    let w = world().await;
    w.enable_slack(TENANT);
    let registry = start_background_tasks(deps(&w)).await.unwrap();

    // Notification event → recording sink.
    let notification = serde_json::json!({
        "title": "Poison message",
        "msg": "something broke",
        "type": "poison_message_alert",
        "tenant_name": TENANT,
    });
    w.substrate
        .publish(
            GLOBAL_ACCOUNT,
            NOTIFICATIONS_SUBJECT,
            None,
            None,
            Bytes::from(notification.to_string()),
        )
        .await
        .unwrap();

    // Integration update event → cache.
    let integration = serde_json::json!({
        "name": "s3",
        "keys": {
            "access_key": "ak", "secret_key": "sk",
            "bucket_name": "tier2", "region": "us-east-1"
        },
        "properties": {},
        "tenant_name": "globex",
    });
    w.substrate
        .publish(
            GLOBAL_ACCOUNT,
            INTEGRATIONS_UPDATES_SUBJECT,
            None,
            None,
            Bytes::from(integration.to_string()),
        )
        .await
        .unwrap();

    // Config reload signal → coordinator re-reads persisted values.
    w.db
        .upsert_configuration("dls_retention", "9")
        .await
        .unwrap();
    w.substrate
        .publish(
            GLOBAL_ACCOUNT,
            CONFIG_RELOAD_SIGNAL_SUBJECT,
            None,
            None,
            Bytes::new(),
        )
        .await
        .unwrap();

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if !w.sink.sent.lock().unwrap().is_empty()
            && w.integrations.s3("globex").is_some()
            && w.config.current().dls_retention_hours == 9
        {
            break;
        }
    }
    assert_eq!(w.sink.sent.lock().unwrap().len(), 1);
    assert!(w.integrations.s3("globex").is_some());
    assert_eq!(w.config.current().dls_retention_hours, 9);

    registry.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn pm_ack_event_drops_group_from_record() {
    let w = world().await;
    let station = w.create_station("orders").await;
    let id = w
        .db
        .upsert_poison_dls(
            station.id,
            1,
            "g1",
            0,
            &stationd::metadata::MessagePayload::default(),
            TENANT,
        )
        .await
        .unwrap()
        .record_id()
        .unwrap();
    let registry = start_background_tasks(deps(&w)).await.unwrap();

    let ack = serde_json::json!({ "id": id, "cg_name": "g1", "tenant_name": TENANT });
    w.substrate
        .publish(
            GLOBAL_ACCOUNT,
            PM_ACKS_SUBJECT,
            None,
            None,
            Bytes::from(ack.to_string()),
        )
        .await
        .unwrap();

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if w.db.get_dls_message(id).await.unwrap().is_none() {
            break;
        }
    }
    assert!(w.db.get_dls_message(id).await.unwrap().is_none());

    registry.shutdown(Duration::from_secs(2)).await;
}

// =============================================================================
// Startup contract
// =============================================================================

/// A bus whose subscribes always fail, for the bind-failure contract.
struct DeadBus;

#[async_trait]
impl Bus for DeadBus {
    async fn publish(
        &self,
        _account: &str,
        _subject: &str,
        _reply: Option<&str>,
        _headers: Option<&HeaderMap>,
        _payload: Bytes,
    ) -> SubstrateResult<()> {
        Ok(())
    }

    async fn subscribe(
        &self,
        _account: &str,
        subject: &str,
        _queue_group: Option<&str>,
    ) -> SubstrateResult<Subscription> {
        Err(SubstrateError::Closed(subject.to_string()))
    }

    async fn server_stats(&self) -> SubstrateResult<ServerStats> {
        Ok(ServerStats::default())
    }

    async fn connections(&self) -> SubstrateResult<Vec<ConnectionInfo>> {
        Ok(Vec::new())
    }

    fn is_clustered(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn subscription_bind_failure_is_fatal() {
    let w = world().await;
    let dead: Arc<dyn Substrate> =
        Arc::new(stationd::substrate::JsApiClient::new(Arc::new(DeadBus)));

    let mut d = deps(&w);
    d.substrate = dead;
    let err = start_background_tasks(d).await.unwrap_err();
    assert!(matches!(err, Error::Fatal(_)));
    assert!(err.to_string().contains("failed subscribing"));
}
