//! Stream lifecycle.
//!
//! `StreamManager` owns the idempotent mapping from station rows to
//! substrate stream configs, the per-tenant DLS stream, and the internal
//! system streams created once per cluster at startup. It never touches
//! metadata rows; the registry owns those.
//!
//! # Internal streams
//!
//! | stream | retention | notes |
//! |---|---|---|
//! | syslogs | limits | max-age = `logs_retention` days, max-bytes ≤ ⅓ of node store |
//! | tiered-storage | work-queue | max-age 24 h, 1 min dedup window |
//! | dls-unacked | work-queue | captures max-deliveries advisories, max-age 24 h |
//! | throughput-v1 | limits | per-subject ring of `ws_updates_interval_sec` samples |
//!
//! Bootstrap retries while the cluster has no peers; persistent failure is
//! fatal, the process must not proceed without its system streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use tracing::{info, warn};

use crate::constants::{
    DLS_STREAM, DLS_UNACKED_ACK_WAIT, DLS_UNACKED_CONSUMER, DLS_UNACKED_STREAM, GLOBAL_ACCOUNT,
    INTERNAL_WORK_QUEUE_MAX_AGE, MAX_DELIVERIES_ADVISORY_PREFIX, MAX_MSG_DELIVERIES,
    SYSLOGS_STREAM, THROUGHPUT_LEGACY_STREAM, THROUGHPUT_STREAM, TIERED_STORAGE_CONSUMER,
    TIERED_STORAGE_DEDUP_WINDOW, TIERED_STORAGE_STREAM, WS_UPDATES_INTERVAL_SEC,
};
use crate::error::{Error, Result};
use crate::metadata::{MetadataDb, RetentionKind, Station};
use crate::retry::bootstrap_policy;
use crate::substrate::{
    AckPolicy, ConsumerConfig, DeliverPolicy, RetentionPolicy, StorageKind, StreamConfig,
    Substrate, SubstrateError,
};

use super::config::ConfigStore;

/// Creation state of the internal resources. Flags survive bootstrap
/// retries so each resource is attempted once per process.
#[derive(Default)]
struct BootState {
    syslogs_stream: AtomicBool,
    tiered_storage_stream: AtomicBool,
    tiered_storage_consumer: AtomicBool,
    dls_unacked_stream: AtomicBool,
    dls_unacked_consumer: AtomicBool,
    throughput_stream: AtomicBool,
    /// Set by the detection pass that precedes resource creation.
    legacy_throughput_exists: AtomicBool,
}

pub struct StreamManager {
    substrate: Arc<dyn Substrate>,
    config: ConfigStore,
    boot: BootState,
}

impl StreamManager {
    pub fn new(substrate: Arc<dyn Substrate>, config: ConfigStore) -> Self {
        Self {
            substrate,
            config,
            boot: BootState::default(),
        }
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.substrate
    }

    fn internal_replicas(&self) -> i32 {
        if self.substrate.is_clustered() {
            3
        } else {
            1
        }
    }

    // =========================================================================
    // Station streams
    // =========================================================================

    /// Derive the primary stream config from a station row.
    pub fn station_stream_config(station: &Station, intern_name: &str) -> StreamConfig {
        let max_msgs = match station.retention_type {
            RetentionKind::Messages if station.retention_value > 0 => station.retention_value,
            _ => -1,
        };
        let max_bytes = match station.retention_type {
            RetentionKind::Bytes if station.retention_value > 0 => station.retention_value,
            _ => -1,
        };
        let max_age = match station.retention_type {
            RetentionKind::MessageAgeSec => {
                Duration::from_secs(station.retention_value.max(0) as u64)
            }
            _ => Duration::ZERO,
        };
        StreamConfig {
            name: intern_name.to_string(),
            subjects: vec![format!("{intern_name}.>")],
            retention: RetentionPolicy::Limits,
            max_consumers: -1,
            max_msgs,
            max_bytes,
            max_age,
            max_msgs_per_subject: -1,
            storage: station.storage_type,
            replicas: station.replicas,
            duplicates: Duration::from_millis(station.idempotency_window_ms.max(0) as u64),
            tiered_storage_enabled: station.tiered_storage_enabled,
        }
    }

    /// Create-or-observe-already-exists for a station's primary stream.
    pub async fn create_station_stream(
        &self,
        tenant: &str,
        station: &Station,
        intern_name: &str,
    ) -> Result<()> {
        let config = Self::station_stream_config(station, intern_name);
        match self.substrate.create_stream(tenant, &config).await {
            Ok(()) | Err(SubstrateError::StreamNameExist(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_station_stream(
        &self,
        tenant: &str,
        station: &Station,
        intern_name: &str,
    ) -> Result<()> {
        let config = Self::station_stream_config(station, intern_name);
        self.substrate.update_stream(tenant, &config).await?;
        Ok(())
    }

    /// Idempotent delete: an absent stream is a success.
    pub async fn delete_station_stream(&self, tenant: &str, intern_name: &str) -> Result<()> {
        match self.substrate.delete_stream(tenant, intern_name).await {
            Ok(()) | Err(SubstrateError::StreamNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Total retained messages of a station; an absent stream counts zero.
    pub async fn total_station_messages(&self, tenant: &str, intern_name: &str) -> Result<u64> {
        match self.substrate.stream_info(tenant, intern_name).await {
            Ok(info) => Ok(info.state.msgs),
            Err(SubstrateError::StreamNotFound(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure the tenant's shared DLS stream exists.
    pub async fn ensure_tenant_dls_stream(&self, tenant: &str) -> Result<()> {
        let retention_hours = self.config.current().dls_retention_hours.max(1) as u64;
        let config = StreamConfig {
            name: DLS_STREAM.to_string(),
            subjects: vec![format!("{DLS_STREAM}.>")],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(retention_hours * 60 * 60),
            storage: StorageKind::File,
            replicas: self.internal_replicas(),
            ..Default::default()
        };
        match self.substrate.create_stream(tenant, &config).await {
            Ok(()) | Err(SubstrateError::StreamNameExist(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Internal resources
    // =========================================================================

    /// Create the system streams and their durable consumers, retrying
    /// while the cluster forms. Called once at startup; failure is fatal.
    pub async fn create_internal_resources(&self) -> Result<()> {
        // Detection pass: does the legacy throughput stream exist?
        match self
            .substrate
            .stream_info(GLOBAL_ACCOUNT, THROUGHPUT_LEGACY_STREAM)
            .await
        {
            Ok(_) => self
                .boot
                .legacy_throughput_exists
                .store(true, Ordering::SeqCst),
            Err(SubstrateError::StreamNotFound(_)) => {}
            Err(e) => warn!(error = %e, "legacy throughput stream probe failed"),
        }

        (|| async { self.try_create_internal_resources().await })
            .retry(bootstrap_policy())
            .when(|e: &Error| e.is_retriable())
            .await
            .map_err(|e| Error::Fatal(format!("system streams creation failed: {e}")))?;

        info!("internal substrate resources ready");
        Ok(())
    }

    async fn try_create_internal_resources(&self) -> Result<()> {
        let replicas = self.internal_replicas();
        let system_config = self.config.current();

        if !self.boot.syslogs_stream.load(Ordering::SeqCst) {
            let max_store = self.substrate.server_stats().await?.max_store;
            let max_bytes = if max_store > 0 {
                (max_store / 3) as i64
            } else {
                -1
            };
            self.create_internal_stream(StreamConfig {
                name: SYSLOGS_STREAM.to_string(),
                subjects: vec![format!("{SYSLOGS_STREAM}.>")],
                retention: RetentionPolicy::Limits,
                max_age: system_config.logs_retention(),
                max_bytes,
                storage: StorageKind::File,
                replicas,
                ..Default::default()
            })
            .await?;
            self.boot.syslogs_stream.store(true, Ordering::SeqCst);
        }

        if !self.boot.tiered_storage_stream.load(Ordering::SeqCst) {
            self.create_internal_stream(StreamConfig {
                name: TIERED_STORAGE_STREAM.to_string(),
                subjects: vec![format!("{TIERED_STORAGE_STREAM}.>")],
                retention: RetentionPolicy::WorkQueue,
                max_age: INTERNAL_WORK_QUEUE_MAX_AGE,
                storage: StorageKind::File,
                replicas,
                duplicates: TIERED_STORAGE_DEDUP_WINDOW,
                ..Default::default()
            })
            .await?;
            self.boot.tiered_storage_stream.store(true, Ordering::SeqCst);
        }

        if !self.boot.tiered_storage_consumer.load(Ordering::SeqCst) {
            self.substrate
                .create_consumer(
                    GLOBAL_ACCOUNT,
                    TIERED_STORAGE_STREAM,
                    &tiered_storage_consumer_config(system_config.tiered_storage_ack_wait()),
                )
                .await?;
            self.boot
                .tiered_storage_consumer
                .store(true, Ordering::SeqCst);
        }

        if !self.boot.dls_unacked_stream.load(Ordering::SeqCst) {
            self.create_internal_stream(StreamConfig {
                name: DLS_UNACKED_STREAM.to_string(),
                subjects: vec![format!("{MAX_DELIVERIES_ADVISORY_PREFIX}.>")],
                retention: RetentionPolicy::WorkQueue,
                max_age: INTERNAL_WORK_QUEUE_MAX_AGE,
                storage: StorageKind::File,
                replicas,
                ..Default::default()
            })
            .await?;
            self.boot.dls_unacked_stream.store(true, Ordering::SeqCst);
        }

        if !self.boot.dls_unacked_consumer.load(Ordering::SeqCst) {
            self.substrate
                .create_consumer(
                    GLOBAL_ACCOUNT,
                    DLS_UNACKED_STREAM,
                    &ConsumerConfig {
                        durable_name: Some(DLS_UNACKED_CONSUMER.to_string()),
                        deliver_policy: DeliverPolicy::All,
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: DLS_UNACKED_ACK_WAIT,
                        max_deliver: MAX_MSG_DELIVERIES as i64,
                        max_ack_pending: -1,
                        ..Default::default()
                    },
                )
                .await?;
            self.boot.dls_unacked_consumer.store(true, Ordering::SeqCst);
        }

        if self.boot.legacy_throughput_exists.swap(false, Ordering::SeqCst) {
            match self
                .substrate
                .delete_stream(GLOBAL_ACCOUNT, THROUGHPUT_LEGACY_STREAM)
                .await
            {
                Ok(()) | Err(SubstrateError::StreamNotFound(_)) => {}
                Err(e) => warn!(error = %e, "failed deleting legacy throughput stream"),
            }
        }

        if !self.boot.throughput_stream.load(Ordering::SeqCst) {
            self.create_internal_stream(StreamConfig {
                name: THROUGHPUT_STREAM.to_string(),
                subjects: vec![format!("{THROUGHPUT_STREAM}.>")],
                retention: RetentionPolicy::Limits,
                max_msgs_per_subject: WS_UPDATES_INTERVAL_SEC,
                storage: StorageKind::File,
                replicas,
                ..Default::default()
            })
            .await?;
            self.boot.throughput_stream.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    async fn create_internal_stream(&self, config: StreamConfig) -> Result<()> {
        match self.substrate.create_stream(GLOBAL_ACCOUNT, &config).await {
            Ok(()) | Err(SubstrateError::StreamNameExist(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the tiered-storage stream and consumer are ready; the
    /// ingest loop spins until this reads true.
    pub fn tiered_storage_ready(&self) -> bool {
        self.boot.tiered_storage_stream.load(Ordering::SeqCst)
            && self.boot.tiered_storage_consumer.load(Ordering::SeqCst)
    }

    /// Rebuild the tiered-storage consumer after a window change so its
    /// ack wait tracks `2 × tiered_storage_time_sec`.
    pub async fn rebuild_tiered_storage_consumer(&self, ack_wait: Duration) -> Result<()> {
        self.boot
            .tiered_storage_consumer
            .store(false, Ordering::SeqCst);
        match self
            .substrate
            .delete_consumer(GLOBAL_ACCOUNT, TIERED_STORAGE_STREAM, TIERED_STORAGE_CONSUMER)
            .await
        {
            Ok(()) | Err(SubstrateError::ConsumerNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.substrate
            .create_consumer(
                GLOBAL_ACCOUNT,
                TIERED_STORAGE_STREAM,
                &tiered_storage_consumer_config(ack_wait),
            )
            .await?;
        self.boot
            .tiered_storage_consumer
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Apply a new `logs_retention` to the syslogs stream.
    pub async fn update_syslogs_retention(&self, max_age: Duration) -> Result<()> {
        let info = match self.substrate.stream_info(GLOBAL_ACCOUNT, SYSLOGS_STREAM).await {
            Ok(info) => info,
            // Log persistence disabled on this deployment.
            Err(SubstrateError::StreamNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut config = info.config;
        config.max_age = max_age;
        self.substrate.update_stream(GLOBAL_ACCOUNT, &config).await?;
        Ok(())
    }

    /// Re-create every station stream recorded in the metadata DB. Used
    /// when substrate resources move between accounts.
    pub async fn restore_station_streams(&self, db: &dyn MetadataDb) -> Result<usize> {
        let stations = db.list_all_stations().await?;
        let mut restored = 0;
        for station in &stations {
            let name = super::station::StationName::parse(&station.name)?;
            self.create_station_stream(&station.tenant_name, station, name.intern())
                .await?;
            restored += 1;
        }
        Ok(restored)
    }
}

fn tiered_storage_consumer_config(ack_wait: Duration) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some(TIERED_STORAGE_CONSUMER.to_string()),
        deliver_policy: DeliverPolicy::All,
        ack_policy: AckPolicy::Explicit,
        ack_wait,
        max_deliver: MAX_MSG_DELIVERIES as i64,
        filter_subject: Some(format!("{TIERED_STORAGE_STREAM}.>")),
        max_ack_pending: -1,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn station(retention_type: RetentionKind, retention_value: i64) -> Station {
        Station {
            id: 1,
            tenant_name: "acme".into(),
            name: "site.orders".into(),
            retention_type,
            retention_value,
            storage_type: StorageKind::Memory,
            replicas: 3,
            idempotency_window_ms: 120_000,
            is_native: true,
            dls_poison: true,
            dls_schemaverse: false,
            tiered_storage_enabled: true,
            schema_name: String::new(),
            schema_version_number: 0,
            created_by_username: "root".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_deleted: false,
        }
    }

    #[test]
    fn age_retention_maps_to_max_age() {
        let config = StreamManager::station_stream_config(
            &station(RetentionKind::MessageAgeSec, 60),
            "site#orders",
        );
        assert_eq!(config.name, "site#orders");
        assert_eq!(config.subjects, vec!["site#orders.>"]);
        assert_eq!(config.max_age, Duration::from_secs(60));
        assert_eq!(config.max_msgs, -1);
        assert_eq!(config.max_bytes, -1);
        assert_eq!(config.duplicates, Duration::from_millis(120_000));
        assert_eq!(config.replicas, 3);
        assert_eq!(config.storage, StorageKind::Memory);
        assert!(config.tiered_storage_enabled);
    }

    #[test]
    fn count_retention_maps_to_max_msgs() {
        let config = StreamManager::station_stream_config(
            &station(RetentionKind::Messages, 5000),
            "site#orders",
        );
        assert_eq!(config.max_msgs, 5000);
        assert_eq!(config.max_age, Duration::ZERO);
        assert_eq!(config.max_bytes, -1);
    }

    #[test]
    fn byte_retention_maps_to_max_bytes() {
        let config = StreamManager::station_stream_config(
            &station(RetentionKind::Bytes, 1 << 20),
            "site#orders",
        );
        assert_eq!(config.max_bytes, 1 << 20);
        assert_eq!(config.max_msgs, -1);
    }

    #[test]
    fn tiered_consumer_ack_wait_follows_window() {
        let config = tiered_storage_consumer_config(Duration::from_secs(10));
        assert_eq!(config.ack_wait, Duration::from_secs(10));
        assert_eq!(config.max_deliver, 10);
        assert_eq!(
            config.filter_subject.as_deref(),
            Some("$memphis_tiered_storage.>")
        );
    }
}
