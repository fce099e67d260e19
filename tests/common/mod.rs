//! Shared world builder for the integration suites: an in-process
//! substrate, an in-memory metadata store, and every subsystem wired the
//! way a broker process wires them.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use stationd::broker::config::{ConfigCoordinator, ConfigStore};
use stationd::broker::dls::DlsEngine;
use stationd::broker::integrations::{
    IntegrationUpdateEvent, IntegrationsCache, NotificationSink, Notifier,
};
use stationd::broker::object_store::StaticStoreProvider;
use stationd::broker::sessions::{ConsumerSessions, ProducerSessions};
use stationd::broker::station::{CreateStationRequest, StationRegistry};
use stationd::broker::streams::StreamManager;
use stationd::broker::throughput::ThroughputAccountant;
use stationd::broker::tiered_storage::TieredStoragePipeline;
use stationd::constants::{HDR_CONNECTION_ID, HDR_PRODUCED_BY};
use stationd::error::Result;
use stationd::headers::HeaderMap;
use stationd::metadata::{MemoryMetadataDb, MetadataDb, RetentionKind};
use stationd::substrate::{JsApiClient, MemoryBus, Substrate};

pub const TENANT: &str = "acme";
pub const BROKER_NAME: &str = "broker-0";

/// Records every notification the dispatcher let through.
pub struct RecordingSink {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, tenant: &str, _channel_id: &str, title: &str, msg: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((tenant.to_string(), title.to_string(), msg.to_string()));
        Ok(())
    }
}

pub struct World {
    pub bus: Arc<MemoryBus>,
    pub substrate: Arc<dyn Substrate>,
    pub db: Arc<MemoryMetadataDb>,
    pub config: ConfigStore,
    pub streams: Arc<StreamManager>,
    pub producers: Arc<ProducerSessions>,
    pub consumers: Arc<ConsumerSessions>,
    pub registry: Arc<StationRegistry>,
    pub integrations: IntegrationsCache,
    pub notifier: Notifier,
    pub sink: Arc<RecordingSink>,
    pub dls: Arc<DlsEngine>,
    pub store_provider: Arc<StaticStoreProvider>,
    pub tiered: Arc<TieredStoragePipeline>,
    pub throughput: Arc<ThroughputAccountant>,
    pub coordinator: Arc<ConfigCoordinator>,
}

/// Build a fully wired broker over the in-process substrate, with internal
/// resources created.
pub async fn world() -> World {
    let bus = Arc::new(MemoryBus::new());
    let substrate: Arc<dyn Substrate> = Arc::new(
        JsApiClient::new(Arc::clone(&bus)).with_timeout(Duration::from_secs(5)),
    );
    let db = Arc::new(MemoryMetadataDb::new());
    let db_dyn: Arc<dyn MetadataDb> = db.clone();

    let config = ConfigStore::default();
    let streams = Arc::new(StreamManager::new(Arc::clone(&substrate), config.clone()));
    streams
        .create_internal_resources()
        .await
        .expect("internal resources");

    let producers = Arc::new(ProducerSessions::new(
        Arc::clone(&db_dyn),
        Arc::clone(&substrate),
    ));
    let consumers = Arc::new(ConsumerSessions::new(
        Arc::clone(&db_dyn),
        Arc::clone(&substrate),
    ));
    let registry = Arc::new(StationRegistry::new(
        Arc::clone(&db_dyn),
        Arc::clone(&streams),
        Arc::clone(&producers),
    ));

    let integrations = IntegrationsCache::new();
    let sink = Arc::new(RecordingSink {
        sent: Mutex::new(Vec::new()),
    });
    let notifier = Notifier::new(integrations.clone(), sink.clone());

    let dls = Arc::new(DlsEngine::new(
        Arc::clone(&db_dyn),
        Arc::clone(&substrate),
        notifier.clone(),
        config.clone(),
    ));

    let store_provider = Arc::new(StaticStoreProvider::new());
    let tiered = Arc::new(TieredStoragePipeline::new(
        Arc::clone(&substrate),
        Arc::clone(&streams),
        store_provider.clone(),
        config.clone(),
    ));

    let throughput = Arc::new(ThroughputAccountant::new(
        Arc::clone(&substrate),
        BROKER_NAME,
    ));

    let coordinator = Arc::new(ConfigCoordinator::new(
        Arc::clone(&db_dyn),
        Arc::clone(&substrate),
        config.clone(),
        Arc::clone(&streams),
    ));
    coordinator.load().await.expect("config load");

    World {
        bus,
        substrate,
        db,
        config,
        streams,
        producers,
        consumers,
        registry,
        integrations,
        notifier,
        sink,
        dls,
        store_provider,
        tiered,
        throughput,
        coordinator,
    }
}

impl World {
    /// Create a station with one-week age retention unless overridden.
    pub async fn create_station(&self, name: &str) -> stationd::metadata::Station {
        self.registry
            .create(
                TENANT,
                CreateStationRequest {
                    name: name.to_string(),
                    retention_type: Some(RetentionKind::MessageAgeSec),
                    retention_value: 604_800,
                    replicas: 1,
                    idempotency_window_ms: 120_000,
                    created_by_username: "root".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("create station")
    }

    /// Publish a native-produced message onto a station's final subject.
    pub async fn publish_native(
        &self,
        station_intern: &str,
        connection_id: &str,
        produced_by: &str,
        payload: &[u8],
    ) {
        let headers = HeaderMap::from_pairs([
            (HDR_CONNECTION_ID, connection_id),
            (HDR_PRODUCED_BY, produced_by),
        ]);
        self.substrate
            .publish(
                TENANT,
                &format!("{station_intern}.final"),
                None,
                Some(&headers),
                Bytes::copy_from_slice(payload),
            )
            .await
            .expect("publish");
    }

    /// Enable a Slack integration with the poison alert toggled on.
    pub fn enable_slack(&self, tenant: &str) {
        let event = IntegrationUpdateEvent {
            name: "slack".into(),
            keys: std::collections::HashMap::from([
                ("auth_token".to_string(), "xoxb-test".to_string()),
                ("channel_id".to_string(), "C42".to_string()),
            ]),
            properties: std::collections::HashMap::from([
                ("poison_message_alert".to_string(), true),
                ("schema_validation_fail_alert".to_string(), true),
            ]),
            ui_url: None,
            tenant_name: tenant.to_string(),
        };
        self.integrations.apply_update(&event).unwrap();
    }

    /// Drain the dls-unacked work queue once, acking whatever the engine
    /// accepted. Returns how many advisories were processed.
    pub async fn drain_unacked(&self) -> usize {
        use stationd::constants::{DLS_UNACKED_CONSUMER, DLS_UNACKED_STREAM, GLOBAL_ACCOUNT};
        use stationd::substrate::MaxDeliveriesAdvisory;

        let pulled = self
            .substrate
            .pull_next(
                GLOBAL_ACCOUNT,
                DLS_UNACKED_STREAM,
                DLS_UNACKED_CONSUMER,
                100,
                Duration::from_millis(50),
            )
            .await
            .expect("pull unacked");
        let mut processed = 0;
        for msg in pulled {
            let advisory: MaxDeliveriesAdvisory =
                serde_json::from_slice(&msg.msg.data).expect("advisory json");
            self.dls
                .process_advisory(&advisory)
                .await
                .expect("process advisory");
            self.substrate
                .ack(GLOBAL_ACCOUNT, &msg.reply_subject)
                .await
                .expect("ack advisory");
            processed += 1;
        }
        processed
    }
}
