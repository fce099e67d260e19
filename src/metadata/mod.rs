//! The metadata store.
//!
//! The metadata DB is the single source of truth for tenants, stations,
//! producers, consumers, DLS records, configuration keys, and audit logs.
//! Substrate streams are derived state; rows here are authoritative.
//!
//! # What this module is NOT
//!
//! This is not the data plane. Message payloads live on the substrate (and,
//! for DLS records, as hex-encoded copies inside the record row); nothing
//! here stores live traffic.
//!
//! # Backends
//!
//! - [`memory::MemoryMetadataDb`]: in-process `HashMap`s behind an async
//!   lock, for local development, tests, and deployments where durability
//!   is not required
//! - [`postgres::PostgresMetadataDb`]: durable backend via `sqlx`; every
//!   multi-row-sensitive update is a single SQL statement with a
//!   conflict/returning clause so concurrent writers coalesce in the DB
//!
//! # Key invariants
//!
//! - `(tenant, station.name)` unique among non-deleted stations
//! - `(station_id, message_seq, message_type)` unique for DLS records; the
//!   poison upsert is atomic and arrival-order independent
//! - configuration keys unique

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::substrate::StorageKind;

pub use memory::MemoryMetadataDb;
pub use postgres::PostgresMetadataDb;

pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Backend unreachable or misbehaving; retried by background loops.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

// =============================================================================
// Row models
// =============================================================================

/// Station retention dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    MessageAgeSec,
    Messages,
    Bytes,
}

impl std::fmt::Display for RetentionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetentionKind::MessageAgeSec => "message_age_sec",
            RetentionKind::Messages => "messages",
            RetentionKind::Bytes => "bytes",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RetentionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message_age_sec" => Ok(RetentionKind::MessageAgeSec),
            "messages" => Ok(RetentionKind::Messages),
            "bytes" => Ok(RetentionKind::Bytes),
            other => Err(format!(
                "retention type can be one of the following message_age_sec/messages/bytes, got {other:?}"
            )),
        }
    }
}

/// DLS record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlsKind {
    Poison,
    Schema,
}

impl std::fmt::Display for DlsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    /// Opaque internal service credential; encryption at rest is the DB
    /// deployment's concern.
    pub internal_credential: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: i64,
    pub tenant_name: String,
    /// External (human-facing) name, lowercase.
    pub name: String,
    pub retention_type: RetentionKind,
    pub retention_value: i64,
    pub storage_type: StorageKind,
    pub replicas: i32,
    pub idempotency_window_ms: i64,
    pub is_native: bool,
    pub dls_poison: bool,
    pub dls_schemaverse: bool,
    pub tiered_storage_enabled: bool,
    /// Empty when no schema is attached.
    pub schema_name: String,
    pub schema_version_number: i32,
    pub created_by_username: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl Station {
    pub fn schema_attachment(&self) -> Option<(&str, i32)> {
        if self.schema_name.is_empty() {
            None
        } else {
            Some((&self.schema_name, self.schema_version_number))
        }
    }
}

/// Insert shape for stations; the store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewStation {
    pub tenant_name: String,
    pub name: String,
    pub retention_type: RetentionKind,
    pub retention_value: i64,
    pub storage_type: StorageKind,
    pub replicas: i32,
    pub idempotency_window_ms: i64,
    pub is_native: bool,
    pub dls_poison: bool,
    pub dls_schemaverse: bool,
    pub tiered_storage_enabled: bool,
    pub schema_name: String,
    pub schema_version_number: i32,
    pub created_by_username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub id: i64,
    pub station_id: i64,
    pub name: String,
    pub connection_id: String,
    pub client_address: String,
    pub created_by_username: String,
    pub is_active: bool,
    pub is_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct NewProducer {
    pub station_id: i64,
    pub name: String,
    pub connection_id: String,
    pub client_address: String,
    pub created_by_username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    pub id: i64,
    pub station_id: i64,
    pub name: String,
    pub consumers_group: String,
    pub connection_id: String,
    pub client_address: String,
    pub created_by_username: String,
    pub max_ack_time_ms: i64,
    pub max_msg_deliveries: i32,
    pub start_consume_from_seq: i64,
    pub last_messages: i64,
    pub is_active: bool,
    pub is_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct NewConsumer {
    pub station_id: i64,
    pub name: String,
    pub consumers_group: String,
    pub connection_id: String,
    pub client_address: String,
    pub created_by_username: String,
    pub max_ack_time_ms: i64,
    pub max_msg_deliveries: i32,
    pub start_consume_from_seq: i64,
    pub last_messages: i64,
}

/// A consumer-group member as the DLS journey reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgMember {
    pub name: String,
    pub client_address: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub max_ack_time_ms: i64,
    pub max_msg_deliveries: i32,
    pub created_by_username: String,
}

/// The captured message inside a DLS record. `data` is hex-encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub time_sent: DateTime<Utc>,
    pub size: i64,
    pub data: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DlsMessage {
    pub id: i64,
    pub station_id: i64,
    pub message_seq: i64,
    pub producer_id: i64,
    pub poisoned_cgs: Vec<String>,
    pub message_details: MessagePayload,
    pub updated_at: DateTime<Utc>,
    pub message_type: DlsKind,
    pub validation_error: String,
    pub tenant_name: String,
}

/// Outcome of the atomic poison upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlsUpsert {
    /// First advisory for this (station, seq): record created.
    Created(i64),
    /// Record existed; this consumer group was appended to the set.
    CgAdded(i64),
    /// Record existed and already named this consumer group.
    Unchanged,
}

impl DlsUpsert {
    pub fn record_id(&self) -> Option<i64> {
        match self {
            DlsUpsert::Created(id) | DlsUpsert::CgAdded(id) => Some(*id),
            DlsUpsert::Unchanged => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub tenant_name: String,
    pub station_name: String,
    pub message: String,
    pub created_by_username: String,
}

// =============================================================================
// The store contract
// =============================================================================

/// Every metadata operation the broker core performs.
///
/// Operations that must be atomic under concurrency (station uniqueness,
/// the poison-cg upsert, cascade flag updates) are single calls here so
/// each backend can express them as one statement.
#[async_trait]
pub trait MetadataDb: Send + Sync + 'static {
    // --- tenants ---

    /// Create or return the tenant row for `name` (already lowercased).
    async fn upsert_tenant(&self, name: &str, internal_credential: &str)
        -> MetadataResult<Tenant>;
    async fn get_tenant(&self, name: &str) -> MetadataResult<Option<Tenant>>;
    async fn list_tenants(&self) -> MetadataResult<Vec<Tenant>>;
    async fn delete_tenant(&self, name: &str) -> MetadataResult<()>;

    // --- stations ---

    /// Insert a station. `AlreadyExists` when a non-deleted station with
    /// the same (tenant, name) exists; concurrent creates resolve to
    /// exactly one success.
    async fn insert_station(&self, station: NewStation) -> MetadataResult<Station>;
    async fn get_station(&self, tenant: &str, name: &str) -> MetadataResult<Option<Station>>;
    async fn get_station_by_id(&self, id: i64) -> MetadataResult<Option<Station>>;
    async fn list_stations(&self, tenant: &str) -> MetadataResult<Vec<Station>>;
    async fn list_all_stations(&self) -> MetadataResult<Vec<Station>>;

    /// Soft-delete; returns the row as it was, or `None` when absent.
    async fn soft_delete_station(
        &self,
        tenant: &str,
        name: &str,
    ) -> MetadataResult<Option<Station>>;

    /// Set (or clear, with an empty name) the schema attachment.
    /// Returns false when the station does not exist.
    async fn update_station_schema(
        &self,
        tenant: &str,
        name: &str,
        schema_name: &str,
        version_number: i32,
    ) -> MetadataResult<bool>;

    // --- producers ---

    /// Insert, or reactivate the row matching (station, name, connection).
    async fn upsert_producer(&self, producer: NewProducer) -> MetadataResult<Producer>;
    async fn get_producer_by_name_and_connection(
        &self,
        name: &str,
        connection_id: &str,
    ) -> MetadataResult<Option<Producer>>;
    async fn get_producer_by_id(&self, id: i64) -> MetadataResult<Option<Producer>>;
    async fn list_station_producers(&self, station_id: i64) -> MetadataResult<Vec<Producer>>;

    /// Flip `is_active` for every producer of a connection (disconnect /
    /// reconnect).
    async fn set_producers_active_by_connection(
        &self,
        connection_id: &str,
        active: bool,
    ) -> MetadataResult<u64>;

    /// Station-delete cascade: mark all the station's producers inactive
    /// and deleted. One statement.
    async fn deactivate_station_producers(&self, station_id: i64) -> MetadataResult<u64>;

    // --- consumers ---

    async fn insert_consumer(&self, consumer: NewConsumer) -> MetadataResult<Consumer>;
    async fn list_cg_members(
        &self,
        station_id: i64,
        consumers_group: &str,
    ) -> MetadataResult<Vec<CgMember>>;
    async fn list_station_consumer_groups(&self, station_id: i64) -> MetadataResult<Vec<String>>;

    /// Mark one consumer group's rows deleted; returns affected count.
    async fn delete_consumer_group(
        &self,
        station_id: i64,
        consumers_group: &str,
    ) -> MetadataResult<u64>;

    /// Station-delete cascade: mark all the station's consumers inactive
    /// and deleted. One statement.
    async fn deactivate_station_consumers(&self, station_id: i64) -> MetadataResult<u64>;

    // --- DLS records ---

    /// The atomic poison upsert keyed on (station, seq, type=poison).
    async fn upsert_poison_dls(
        &self,
        station_id: i64,
        message_seq: i64,
        cg_name: &str,
        producer_id: i64,
        details: &MessagePayload,
        tenant_name: &str,
    ) -> MetadataResult<DlsUpsert>;

    async fn insert_schema_dls(
        &self,
        station_id: i64,
        producer_id: i64,
        details: &MessagePayload,
        validation_error: &str,
        tenant_name: &str,
    ) -> MetadataResult<i64>;

    async fn get_dls_message(&self, id: i64) -> MetadataResult<Option<DlsMessage>>;
    async fn list_dls_by_station(&self, station_id: i64) -> MetadataResult<Vec<DlsMessage>>;
    async fn delete_dls_messages(&self, ids: &[i64]) -> MetadataResult<u64>;
    async fn delete_dls_by_station(&self, station_id: i64) -> MetadataResult<u64>;

    /// Drop one consumer group from a record, deleting the record when the
    /// set empties. Idempotent.
    async fn remove_cg_from_dls(&self, id: i64, cg_name: &str) -> MetadataResult<()>;

    /// Retention sweep: delete every record updated before `cutoff`.
    async fn delete_dls_older_than(&self, cutoff: DateTime<Utc>) -> MetadataResult<u64>;

    async fn count_poison_dls_by_cg(
        &self,
        station_id: i64,
        cg_name: &str,
    ) -> MetadataResult<i64>;

    // --- configuration ---

    async fn upsert_configuration(&self, key: &str, value: &str) -> MetadataResult<()>;
    async fn get_all_configurations(&self) -> MetadataResult<Vec<ConfigEntry>>;

    // --- audit logs ---

    async fn insert_audit_log(&self, log: NewAuditLog) -> MetadataResult<()>;
    async fn delete_audit_logs_by_station(
        &self,
        tenant: &str,
        station_name: &str,
    ) -> MetadataResult<u64>;
}

// Display for DlsKind without another serde round trip.
impl DlsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlsKind::Poison => "poison",
            DlsKind::Schema => "schema",
        }
    }
}

impl std::str::FromStr for DlsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poison" => Ok(DlsKind::Poison),
            "schema" => Ok(DlsKind::Schema),
            other => Err(format!("unknown dls type {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retention_kind_round_trip() {
        for kind in [
            RetentionKind::MessageAgeSec,
            RetentionKind::Messages,
            RetentionKind::Bytes,
        ] {
            let parsed: RetentionKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("forever".parse::<RetentionKind>().is_err());
    }

    #[test]
    fn dls_kind_strings() {
        assert_eq!(DlsKind::Poison.as_str(), "poison");
        assert_eq!("schema".parse::<DlsKind>().unwrap(), DlsKind::Schema);
        assert!("other".parse::<DlsKind>().is_err());
    }

    #[test]
    fn schema_attachment_accessor() {
        let mut station = Station {
            id: 1,
            tenant_name: "acme".into(),
            name: "orders".into(),
            retention_type: RetentionKind::MessageAgeSec,
            retention_value: 60,
            storage_type: StorageKind::File,
            replicas: 1,
            idempotency_window_ms: 120_000,
            is_native: true,
            dls_poison: true,
            dls_schemaverse: false,
            tiered_storage_enabled: false,
            schema_name: String::new(),
            schema_version_number: 0,
            created_by_username: "root".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            is_deleted: false,
        };
        assert!(station.schema_attachment().is_none());
        station.schema_name = "invoice".into();
        station.schema_version_number = 2;
        assert_eq!(station.schema_attachment(), Some(("invoice", 2)));
    }

    #[test]
    fn dls_upsert_record_id() {
        assert_eq!(DlsUpsert::Created(7).record_id(), Some(7));
        assert_eq!(DlsUpsert::CgAdded(7).record_id(), Some(7));
        assert_eq!(DlsUpsert::Unchanged.record_id(), None);
    }
}
