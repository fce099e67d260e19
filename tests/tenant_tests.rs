//! Tenant boundary and session-activity lifecycle.

mod common;

use common::{world, TENANT};
use stationd::broker::tenants::TenantManager;
use stationd::constants::GLOBAL_ACCOUNT;
use stationd::error::Error;
use stationd::metadata::MetadataDb;
use stationd::substrate::SubstrateError;

#[tokio::test]
async fn ensure_is_idempotent_and_lowercases() {
    let w = world().await;
    let tenants = TenantManager::new(w.db.clone(), w.substrate.clone());

    let first = tenants.ensure("Acme").await.unwrap();
    assert_eq!(first.name, "acme");
    let second = tenants.ensure("acme").await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.internal_credential, second.internal_credential);

    assert!(matches!(tenants.ensure("").await, Err(Error::Invalid(_))));
    assert!(matches!(
        tenants.get("ghost").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn destroy_purges_streams_and_rows() {
    let w = world().await;
    let tenants = TenantManager::new(w.db.clone(), w.substrate.clone());
    tenants.ensure(TENANT).await.unwrap();
    let station = w.create_station("orders").await;

    tenants.destroy(TENANT).await.unwrap();

    let err = w.substrate.stream_info(TENANT, "orders").await.unwrap_err();
    assert!(matches!(err, SubstrateError::StreamNotFound(_)));
    assert!(w.db.get_station_by_id(station.id).await.unwrap().is_none());
    assert!(matches!(tenants.get(TENANT).await, Err(Error::NotFound(_))));

    // The global account is not removable; absent tenants are NotFound.
    assert!(matches!(
        tenants.destroy(GLOBAL_ACCOUNT).await,
        Err(Error::Invalid(_))
    ));
    assert!(matches!(
        tenants.destroy(TENANT).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn producer_activity_follows_its_connection() {
    let w = world().await;
    let station = w.create_station("orders").await;
    let producer = w
        .producers
        .register(TENANT, &station, "p1", "c1", "10.0.0.1:4222", "root")
        .await
        .unwrap();
    assert!(producer.is_active);

    w.producers.handle_disconnect("c1").await.unwrap();
    let row = w.db.get_producer_by_id(producer.id).await.unwrap().unwrap();
    assert!(!row.is_active);
    assert!(!row.is_deleted);

    w.producers.handle_reconnect("c1").await.unwrap();
    let row = w.db.get_producer_by_id(producer.id).await.unwrap().unwrap();
    assert!(row.is_active);

    // Re-registering on the same connection reuses the row.
    let again = w
        .producers
        .register(TENANT, &station, "p1", "c1", "10.0.0.1:4222", "root")
        .await
        .unwrap();
    assert_eq!(again.id, producer.id);
}

#[tokio::test]
async fn resource_mover_recreates_substrate_state() {
    let w = world().await;
    let station = w.create_station("orders").await;
    w.consumers
        .create(
            TENANT,
            &station,
            stationd::broker::sessions::CreateConsumerRequest {
                name: "g1".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Simulate substrate loss: the stream and durable vanish, the
    // metadata rows survive.
    w.substrate.delete_stream(TENANT, "orders").await.unwrap();

    let restored = w.streams.restore_station_streams(&*w.db).await.unwrap();
    assert_eq!(restored, 1);
    let consumers = w
        .consumers
        .restore_station_consumers(TENANT, &station)
        .await
        .unwrap();
    assert_eq!(consumers, 1);

    assert!(w.substrate.stream_info(TENANT, "orders").await.is_ok());
    assert!(w
        .substrate
        .consumer_info(TENANT, "orders", "g1")
        .await
        .is_ok());
}
