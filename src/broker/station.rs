//! The station catalog.
//!
//! `StationRegistry` owns station rows: create, look up, enumerate,
//! soft-delete with cascade, and schema attachment. Substrate streams are
//! derived from these rows through the [`StreamManager`]; the registry is
//! the only writer of station metadata.
//!
//! Station lifecycle is `live → soft-deleted`. Soft-deleted stations never
//! reappear in listings and their names become reusable immediately.

use std::sync::Arc;

use tracing::{info, warn};

use crate::constants::{
    DEFAULT_IDEMPOTENCY_WINDOW_MS, DEFAULT_RETENTION_SECS, MAX_REPLICAS,
    MIN_IDEMPOTENCY_WINDOW_MS,
};
use crate::error::{Error, Result};
use crate::metadata::{MetadataDb, NewAuditLog, NewStation, RetentionKind, Station};
use crate::substrate::{RetentionPolicy, StorageKind, StreamConfig};
use crate::validation::{replace_delimiters, revert_delimiters, validate_name};

use super::sessions::{ProducerSessions, SchemaUpdate};
use super::streams::StreamManager;

/// Stream names observed at the non-native wire boundary keep the legacy
/// 32-character cap.
const MAX_EXTERNAL_STREAM_NAME: usize = 32;

/// A station's external (human-facing) and internal (substrate) name pair.
///
/// The internal form substitutes `.` with `#` and is the substrate stream
/// name; the pair is a bijection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationName {
    external: String,
    internal: String,
}

impl StationName {
    /// Normalize and validate an external name.
    pub fn parse(name: &str) -> Result<Self> {
        let external = name.to_lowercase();
        validate_name(&external, "Station")?;
        let internal = replace_delimiters(&external);
        Ok(Self { external, internal })
    }

    /// Recover the pair from a substrate stream name.
    pub fn from_stream_name(stream: &str) -> Self {
        Self {
            external: revert_delimiters(stream),
            internal: stream.to_string(),
        }
    }

    pub fn ext(&self) -> &str {
        &self.external
    }

    pub fn intern(&self) -> &str {
        &self.internal
    }
}

impl std::fmt::Display for StationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.external)
    }
}

/// Parameters of a station create. Unset optionals take the documented
/// defaults during validation.
#[derive(Debug, Clone)]
pub struct CreateStationRequest {
    pub name: String,
    pub retention_type: Option<RetentionKind>,
    pub retention_value: i64,
    pub storage_type: Option<StorageKind>,
    /// Zero means default (1).
    pub replicas: i32,
    /// Non-positive means default; values under the floor are clamped up.
    pub idempotency_window_ms: i64,
    pub dls_poison: bool,
    pub dls_schemaverse: bool,
    pub tiered_storage_enabled: bool,
    pub schema_name: String,
    pub schema_version_number: i32,
    pub is_native: bool,
    pub created_by_username: String,
}

impl Default for CreateStationRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            retention_type: None,
            retention_value: 0,
            storage_type: None,
            replicas: 0,
            idempotency_window_ms: 0,
            dls_poison: true,
            dls_schemaverse: false,
            tiered_storage_enabled: false,
            schema_name: String::new(),
            schema_version_number: 0,
            is_native: true,
            created_by_username: String::new(),
        }
    }
}

/// A station with the derived fields listings report.
#[derive(Debug, Clone)]
pub struct StationDetails {
    pub station: Station,
    pub total_messages: u64,
    pub total_dls_messages: usize,
    pub has_dls_messages: bool,
}

pub struct StationRegistry {
    db: Arc<dyn MetadataDb>,
    streams: Arc<StreamManager>,
    producers: Arc<ProducerSessions>,
}

impl StationRegistry {
    pub fn new(
        db: Arc<dyn MetadataDb>,
        streams: Arc<StreamManager>,
        producers: Arc<ProducerSessions>,
    ) -> Self {
        Self {
            db,
            streams,
            producers,
        }
    }

    /// Create a station: validate, insert the row (the unique index
    /// arbitrates concurrent creates), then derive the primary stream. The
    /// substrate is never touched when the insert loses.
    pub async fn create(&self, tenant: &str, request: CreateStationRequest) -> Result<Station> {
        let name = StationName::parse(&request.name)?;

        let (retention_type, retention_value) = match request.retention_type {
            Some(kind) => {
                if request.retention_value <= 0 {
                    return Err(Error::Invalid(
                        "Retention value must be a positive number".to_string(),
                    ));
                }
                (kind, request.retention_value)
            }
            None => (RetentionKind::MessageAgeSec, DEFAULT_RETENTION_SECS),
        };

        let replicas = match request.replicas {
            0 => 1,
            r if r < 0 => {
                return Err(Error::Invalid("Replicas must be a positive number".to_string()))
            }
            r if r > MAX_REPLICAS => {
                return Err(Error::Invalid("max replicas in a cluster is 5".to_string()))
            }
            r => r,
        };

        let idempotency_window_ms = if request.idempotency_window_ms <= 0 {
            DEFAULT_IDEMPOTENCY_WINDOW_MS
        } else {
            request.idempotency_window_ms.max(MIN_IDEMPOTENCY_WINDOW_MS)
        };

        let station = self
            .db
            .insert_station(NewStation {
                tenant_name: tenant.to_string(),
                name: name.ext().to_string(),
                retention_type,
                retention_value,
                storage_type: request.storage_type.unwrap_or(StorageKind::File),
                replicas,
                idempotency_window_ms,
                is_native: request.is_native,
                dls_poison: request.dls_poison,
                dls_schemaverse: request.dls_schemaverse,
                tiered_storage_enabled: request.tiered_storage_enabled,
                schema_name: request.schema_name,
                schema_version_number: request.schema_version_number,
                created_by_username: request.created_by_username.clone(),
            })
            .await?;

        if let Err(e) = self
            .streams
            .create_station_stream(tenant, &station, name.intern())
            .await
        {
            // Free the name again; the row without its stream is useless.
            let _ = self.db.soft_delete_station(tenant, name.ext()).await;
            return Err(e);
        }

        if station.dls_poison {
            self.streams.ensure_tenant_dls_stream(tenant).await?;
        }

        let message = format!(
            "Station {} has been created by user {}",
            name.ext(),
            request.created_by_username
        );
        info!("[tenant: {tenant}]create_station: {message}");
        if let Err(e) = self
            .db
            .insert_audit_log(NewAuditLog {
                tenant_name: tenant.to_string(),
                station_name: name.ext().to_string(),
                message,
                created_by_username: request.created_by_username,
            })
            .await
        {
            warn!("[tenant: {tenant}]create_station: audit log write failed: {e}");
        }

        Ok(station)
    }

    pub async fn get(&self, tenant: &str, name: &str) -> Result<Station> {
        let name = StationName::parse(name)?;
        self.db
            .get_station(tenant, name.ext())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Station {} does not exist", name.ext())))
    }

    /// Soft-delete a station and remove its primary stream. Cascade
    /// cleanup (session flags, DLS records, audit logs) is best-effort.
    pub async fn delete(&self, tenant: &str, name: &str, removed_by: &str) -> Result<()> {
        let name = StationName::parse(name)?;
        let station = self
            .db
            .soft_delete_station(tenant, name.ext())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Station {} does not exist", name.ext())))?;

        self.streams
            .delete_station_stream(tenant, name.intern())
            .await?;

        if let Err(e) = self.db.deactivate_station_producers(station.id).await {
            warn!("[tenant: {tenant}]remove_station: producer cleanup failed: {e}");
        }
        if let Err(e) = self.db.deactivate_station_consumers(station.id).await {
            warn!("[tenant: {tenant}]remove_station: consumer cleanup failed: {e}");
        }
        if let Err(e) = self.db.delete_dls_by_station(station.id).await {
            warn!("[tenant: {tenant}]remove_station: dls cleanup failed: {e}");
        }
        if let Err(e) = self
            .db
            .delete_audit_logs_by_station(tenant, name.ext())
            .await
        {
            warn!("[tenant: {tenant}]remove_station: audit log cleanup failed: {e}");
        }

        info!(
            "[tenant: {tenant}]remove_station: Station {} has been deleted by user {removed_by}",
            name.ext()
        );
        Ok(())
    }

    /// Attach a schema and notify the station's live producers.
    pub async fn attach_schema(
        &self,
        tenant: &str,
        station_name: &str,
        schema_name: &str,
        version_number: i32,
    ) -> Result<()> {
        if schema_name.is_empty() {
            return Err(Error::Invalid("Schema name can not be empty".to_string()));
        }
        let name = StationName::parse(station_name)?;
        let updated = self
            .db
            .update_station_schema(tenant, name.ext(), schema_name, version_number)
            .await?;
        if !updated {
            return Err(Error::NotFound(format!(
                "Station {} does not exist",
                name.ext()
            )));
        }
        self.producers
            .publish_schema_update(
                tenant,
                name.intern(),
                &SchemaUpdate::Init {
                    schema_name: schema_name.to_string(),
                    version_number,
                },
            )
            .await
    }

    /// Detach the schema and notify the station's live producers.
    pub async fn detach_schema(&self, tenant: &str, station_name: &str) -> Result<()> {
        let name = StationName::parse(station_name)?;
        let updated = self
            .db
            .update_station_schema(tenant, name.ext(), "", 0)
            .await?;
        if !updated {
            return Err(Error::NotFound(format!(
                "Station {} does not exist",
                name.ext()
            )));
        }
        self.producers
            .publish_schema_update(tenant, name.intern(), &SchemaUpdate::Drop)
            .await
    }

    /// Stations of a tenant with their derived counters.
    pub async fn list(&self, tenant: &str) -> Result<Vec<StationDetails>> {
        let stations = self.db.list_stations(tenant).await?;
        let mut details = Vec::with_capacity(stations.len());
        for station in stations {
            let name = StationName::parse(&station.name)?;
            let total_messages = self
                .streams
                .total_station_messages(tenant, name.intern())
                .await?;
            let total_dls_messages = self.db.list_dls_by_station(station.id).await?.len();
            details.push(StationDetails {
                station,
                total_messages,
                total_dls_messages,
                has_dls_messages: total_dls_messages > 0,
            });
        }
        Ok(details)
    }

    // =========================================================================
    // Non-native mirroring
    // =========================================================================

    /// Mirror a stream a tenant created directly against the substrate, so
    /// a station row exists for it. Called by the wire boundary after it
    /// observed a successful plain stream create. Returns `None` when a
    /// station of that name already exists.
    pub async fn register_external_stream(
        &self,
        tenant: &str,
        config: &StreamConfig,
        created_by_username: &str,
    ) -> Result<Option<Station>> {
        if config.retention != RetentionPolicy::Limits {
            return Err(Error::Invalid(
                "The only supported retention type is limits".to_string(),
            ));
        }
        if config.name.len() > MAX_EXTERNAL_STREAM_NAME {
            return Err(Error::Invalid(
                "Stream name can not be greater than 32 characters".to_string(),
            ));
        }

        let (retention_type, retention_value) = if !config.max_age.is_zero() {
            (
                Some(RetentionKind::MessageAgeSec),
                config.max_age.as_secs() as i64,
            )
        } else if config.max_bytes > 0 {
            (Some(RetentionKind::Bytes), config.max_bytes)
        } else if config.max_msgs > 0 {
            (Some(RetentionKind::Messages), config.max_msgs)
        } else {
            (None, 0)
        };

        let request = CreateStationRequest {
            name: StationName::from_stream_name(&config.name).ext().to_string(),
            retention_type,
            retention_value,
            storage_type: Some(config.storage),
            replicas: config.replicas,
            idempotency_window_ms: config.duplicates.as_millis() as i64,
            dls_poison: true,
            dls_schemaverse: false,
            tiered_storage_enabled: config.tiered_storage_enabled,
            is_native: false,
            created_by_username: created_by_username.to_string(),
            ..Default::default()
        };

        match self.create(tenant, request).await {
            Ok(station) => Ok(Some(station)),
            Err(Error::AlreadyExists(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Mirror a direct stream delete. Idempotent.
    pub async fn unregister_external_stream(&self, tenant: &str, stream_name: &str) -> Result<()> {
        let name = StationName::from_stream_name(stream_name);
        match self.delete(tenant, name.ext(), "").await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
