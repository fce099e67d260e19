//! Operator configuration: validation, persistence, reload fan-out, and
//! the syslogs side effect.

mod common;

use std::time::Duration;

use common::world;
use stationd::broker::config::EditClusterConfigRequest;
use stationd::constants::{CONFIG_RELOAD_SIGNAL_SUBJECT, GLOBAL_ACCOUNT, SYSLOGS_STREAM};
use stationd::error::Error;
use stationd::metadata::MetadataDb;
use stationd::substrate::Substrate;

fn edit(tiered_sec: i64) -> EditClusterConfigRequest {
    EditClusterConfigRequest {
        dls_retention_hours: 3,
        logs_retention_days: 30,
        tiered_storage_time_sec: tiered_sec,
        broker_host: String::new(),
        ui_host: String::new(),
        rest_gw_host: String::new(),
        max_msg_size_mb: 1,
    }
}

#[tokio::test]
async fn tiered_window_bounds_are_user_visible_errors() {
    let w = world().await;
    for bad in [4, 0, -1, 3601] {
        let err = w.coordinator.edit(edit(bad)).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)), "{bad}");
        assert!(err.is_showable());
        assert_eq!(err.http_status(), 400);
    }
    // The boundaries themselves are legal.
    w.coordinator.edit(edit(5)).await.unwrap();
    w.coordinator.edit(edit(3600)).await.unwrap();
}

#[tokio::test]
async fn max_msg_size_floor() {
    let w = world().await;
    let mut request = edit(8);
    request.max_msg_size_mb = 0;
    let err = w.coordinator.edit(request).await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
}

#[tokio::test]
async fn edit_persists_lowercases_and_broadcasts() {
    let w = world().await;
    let mut reload = w
        .substrate
        .subscribe(GLOBAL_ACCOUNT, CONFIG_RELOAD_SIGNAL_SUBJECT, None)
        .await
        .unwrap();

    let mut request = edit(20);
    request.broker_host = "Broker.Example.COM".into();
    request.ui_host = "UI.Example.com".into();
    let applied = w.coordinator.edit(request).await.unwrap();
    assert_eq!(applied.broker_host, "broker.example.com");
    assert_eq!(applied.ui_host, "ui.example.com");
    assert_eq!(applied.tiered_storage_time_sec, 20);
    assert_eq!(w.config.current().tiered_storage_time_sec, 20);

    // The reload signal went out on the wire.
    let signal = tokio::time::timeout(Duration::from_secs(1), reload.recv())
        .await
        .expect("reload signal")
        .unwrap();
    assert!(signal.payload.is_empty());

    // And the values were persisted.
    let persisted = w.db.get_all_configurations().await.unwrap();
    let get = |key: &str| {
        persisted
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.clone())
            .unwrap()
    };
    assert_eq!(get("tiered_storage_time_sec"), "20");
    assert_eq!(get("broker_host"), "broker.example.com");
}

#[tokio::test]
async fn noop_edit_skips_the_broadcast() {
    let w = world().await;
    let mut reload = w
        .substrate
        .subscribe(GLOBAL_ACCOUNT, CONFIG_RELOAD_SIGNAL_SUBJECT, None)
        .await
        .unwrap();

    // Current values resubmitted verbatim.
    let current = w.config.current();
    w.coordinator
        .edit(EditClusterConfigRequest {
            dls_retention_hours: current.dls_retention_hours,
            logs_retention_days: current.logs_retention_days,
            tiered_storage_time_sec: current.tiered_storage_time_sec,
            broker_host: current.broker_host.clone(),
            ui_host: current.ui_host.clone(),
            rest_gw_host: current.rest_gw_host.clone(),
            max_msg_size_mb: current.max_msg_size_mb,
        })
        .await
        .unwrap();

    let timed_out = tokio::time::timeout(Duration::from_millis(100), reload.recv())
        .await
        .is_err();
    assert!(timed_out, "no signal for a no-op edit");
}

#[tokio::test]
async fn load_seeds_defaults_and_reload_is_idempotent() {
    let w = world().await;
    // `world()` already loaded once; defaults must be persisted.
    let persisted = w.db.get_all_configurations().await.unwrap();
    assert!(persisted.iter().any(|e| e.key == "dls_retention"));
    assert!(persisted.iter().any(|e| e.key == "analytics"));

    // A value changed behind our back (another broker wrote it) is picked
    // up by the reload handler.
    w.db
        .upsert_configuration("dls_retention", "12")
        .await
        .unwrap();
    w.coordinator.reload().await.unwrap();
    assert_eq!(w.config.current().dls_retention_hours, 12);

    // Reload is idempotent against the latest persisted values.
    w.coordinator.reload().await.unwrap();
    assert_eq!(w.config.current().dls_retention_hours, 12);

    // Unknown keys are ignored with a warning, not an error.
    w.db.upsert_configuration("who_knows", "x").await.unwrap();
    w.coordinator.reload().await.unwrap();
}

#[tokio::test]
async fn logs_retention_updates_syslogs_stream() {
    let w = world().await;
    let mut request = edit(8);
    request.logs_retention_days = 7;
    w.coordinator.edit(request).await.unwrap();

    let info = w
        .substrate
        .stream_info(GLOBAL_ACCOUNT, SYSLOGS_STREAM)
        .await
        .unwrap();
    assert_eq!(info.config.max_age, Duration::from_secs(7 * 24 * 60 * 60));
}
