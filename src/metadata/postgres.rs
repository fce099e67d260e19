//! Postgres-backed implementation of the metadata store.
//!
//! Implements [`MetadataDb`] over `sqlx`. Row structs are kept separate
//! from the domain types so schema details (column names, string enums)
//! stay localized here, and every update the trait requires to be atomic is
//! a single statement with a conflict/returning clause:
//!
//! - station uniqueness rides on a partial unique index over live rows;
//!   concurrent creates resolve in the database, not in application code
//! - the poison-DLS upsert is one `INSERT … ON CONFLICT DO UPDATE … WHERE`
//!   whose returning row distinguishes created / group-added / unchanged
//!   (`xmax = 0` reads true only for freshly inserted rows)
//! - cascade flag updates (station delete) are single `UPDATE` statements
//!
//! Migrations are applied at connect time via `sqlx::migrate!` so the
//! schema is present before the broker serves anything.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};

use super::{
    CgMember, ConfigEntry, Consumer, DlsMessage, DlsUpsert, MetadataDb, MetadataError,
    MetadataResult, MessagePayload, NewAuditLog, NewConsumer, NewProducer, NewStation, Producer,
    Station, Tenant,
};

/// Durable metadata store backed by Postgres.
///
/// Safe to share across tasks; `sqlx` leases connections from the pool per
/// statement. Timeouts are explicit because hanging forever on DB failures
/// is unacceptable in a broker data path.
pub struct PostgresMetadataDb {
    pool: PgPool,
}

impl PostgresMetadataDb {
    /// Connect, bounding both pool size and acquire time, and run
    /// migrations.
    pub async fn connect(url: &str, max_connections: u32) -> MetadataResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| MetadataError::Unavailable(format!("connect: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| MetadataError::Unavailable(format!("migrate: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> MetadataError {
    MetadataError::Unavailable(e.to_string())
}

// =============================================================================
// Row shapes
// =============================================================================

#[derive(Debug, FromRow)]
struct DbTenant {
    id: i64,
    name: String,
    internal_credential: String,
}

impl From<DbTenant> for Tenant {
    fn from(row: DbTenant) -> Self {
        Tenant {
            id: row.id,
            name: row.name,
            internal_credential: row.internal_credential,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbStation {
    id: i64,
    tenant_name: String,
    name: String,
    retention_type: String,
    retention_value: i64,
    storage_type: String,
    replicas: i32,
    idempotency_window_ms: i64,
    is_native: bool,
    dls_poison: bool,
    dls_schemaverse: bool,
    tiered_storage_enabled: bool,
    schema_name: String,
    schema_version_number: i32,
    created_by_username: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_deleted: bool,
}

impl DbStation {
    fn into_domain(self) -> MetadataResult<Station> {
        Ok(Station {
            id: self.id,
            tenant_name: self.tenant_name,
            name: self.name,
            retention_type: self
                .retention_type
                .parse()
                .map_err(MetadataError::Unavailable)?,
            retention_value: self.retention_value,
            storage_type: self
                .storage_type
                .parse()
                .map_err(MetadataError::Unavailable)?,
            replicas: self.replicas,
            idempotency_window_ms: self.idempotency_window_ms,
            is_native: self.is_native,
            dls_poison: self.dls_poison,
            dls_schemaverse: self.dls_schemaverse,
            tiered_storage_enabled: self.tiered_storage_enabled,
            schema_name: self.schema_name,
            schema_version_number: self.schema_version_number,
            created_by_username: self.created_by_username,
            created_at: self.created_at,
            updated_at: self.updated_at,
            is_deleted: self.is_deleted,
        })
    }
}

const STATION_COLS: &str = "id, tenant_name, name, retention_type, retention_value, storage_type, \
     replicas, idempotency_window_ms, is_native, dls_poison, dls_schemaverse, \
     tiered_storage_enabled, schema_name, schema_version_number, created_by_username, \
     created_at, updated_at, is_deleted";

#[derive(Debug, FromRow)]
struct DbProducer {
    id: i64,
    station_id: i64,
    name: String,
    connection_id: String,
    client_address: String,
    created_by_username: String,
    is_active: bool,
    is_deleted: bool,
}

impl From<DbProducer> for Producer {
    fn from(row: DbProducer) -> Self {
        Producer {
            id: row.id,
            station_id: row.station_id,
            name: row.name,
            connection_id: row.connection_id,
            client_address: row.client_address,
            created_by_username: row.created_by_username,
            is_active: row.is_active,
            is_deleted: row.is_deleted,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbConsumer {
    id: i64,
    station_id: i64,
    name: String,
    consumers_group: String,
    connection_id: String,
    client_address: String,
    created_by_username: String,
    max_ack_time_ms: i64,
    max_msg_deliveries: i32,
    start_consume_from_seq: i64,
    last_messages: i64,
    is_active: bool,
    is_deleted: bool,
}

impl From<DbConsumer> for Consumer {
    fn from(row: DbConsumer) -> Self {
        Consumer {
            id: row.id,
            station_id: row.station_id,
            name: row.name,
            consumers_group: row.consumers_group,
            connection_id: row.connection_id,
            client_address: row.client_address,
            created_by_username: row.created_by_username,
            max_ack_time_ms: row.max_ack_time_ms,
            max_msg_deliveries: row.max_msg_deliveries,
            start_consume_from_seq: row.start_consume_from_seq,
            last_messages: row.last_messages,
            is_active: row.is_active,
            is_deleted: row.is_deleted,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbDlsMessage {
    id: i64,
    station_id: i64,
    message_seq: i64,
    producer_id: i64,
    poisoned_cgs: Vec<String>,
    message_details: Json<MessagePayload>,
    updated_at: DateTime<Utc>,
    message_type: String,
    validation_error: String,
    tenant_name: String,
}

impl DbDlsMessage {
    fn into_domain(self) -> MetadataResult<DlsMessage> {
        Ok(DlsMessage {
            id: self.id,
            station_id: self.station_id,
            message_seq: self.message_seq,
            producer_id: self.producer_id,
            poisoned_cgs: self.poisoned_cgs,
            message_details: self.message_details.0,
            updated_at: self.updated_at,
            message_type: self
                .message_type
                .parse()
                .map_err(MetadataError::Unavailable)?,
            validation_error: self.validation_error,
            tenant_name: self.tenant_name,
        })
    }
}

const DLS_COLS: &str = "id, station_id, message_seq, producer_id, poisoned_cgs, \
     message_details, updated_at, message_type, validation_error, tenant_name";

// =============================================================================
// MetadataDb impl
// =============================================================================

#[async_trait]
impl MetadataDb for PostgresMetadataDb {
    async fn upsert_tenant(
        &self,
        name: &str,
        internal_credential: &str,
    ) -> MetadataResult<Tenant> {
        // DO UPDATE on the no-op column so RETURNING always yields the row.
        let row: DbTenant = sqlx::query_as(
            "INSERT INTO tenants (name, internal_credential) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
             RETURNING id, name, internal_credential",
        )
        .bind(name)
        .bind(internal_credential)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get_tenant(&self, name: &str) -> MetadataResult<Option<Tenant>> {
        let row: Option<DbTenant> =
            sqlx::query_as("SELECT id, name, internal_credential FROM tenants WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_tenants(&self) -> MetadataResult<Vec<Tenant>> {
        let rows: Vec<DbTenant> =
            sqlx::query_as("SELECT id, name, internal_credential FROM tenants ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_tenant(&self, name: &str) -> MetadataResult<()> {
        // Multiple statements, so a transaction keeps the cascade atomic.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "DELETE FROM producers WHERE station_id IN
                 (SELECT id FROM stations WHERE tenant_name = $1)",
        )
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "DELETE FROM consumers WHERE station_id IN
                 (SELECT id FROM stations WHERE tenant_name = $1)",
        )
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        for table in ["dls_messages", "stations", "audit_logs"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE tenant_name = $1"))
                .bind(name)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query("DELETE FROM tenants WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn insert_station(&self, station: NewStation) -> MetadataResult<Station> {
        let now = Utc::now();
        let result: Result<DbStation, sqlx::Error> = sqlx::query_as(&format!(
            "INSERT INTO stations (tenant_name, name, retention_type, retention_value, \
                 storage_type, replicas, idempotency_window_ms, is_native, dls_poison, \
                 dls_schemaverse, tiered_storage_enabled, schema_name, schema_version_number, \
                 created_by_username, created_at, updated_at, is_deleted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15, FALSE)
             RETURNING {STATION_COLS}"
        ))
        .bind(&station.tenant_name)
        .bind(&station.name)
        .bind(station.retention_type.to_string())
        .bind(station.retention_value)
        .bind(station.storage_type.to_string())
        .bind(station.replicas)
        .bind(station.idempotency_window_ms)
        .bind(station.is_native)
        .bind(station.dls_poison)
        .bind(station.dls_schemaverse)
        .bind(station.tiered_storage_enabled)
        .bind(&station.schema_name)
        .bind(station.schema_version_number)
        .bind(&station.created_by_username)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.into_domain(),
            Err(e)
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation()) =>
            {
                Err(MetadataError::AlreadyExists(format!(
                    "Station {} already exists",
                    station.name
                )))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_station(&self, tenant: &str, name: &str) -> MetadataResult<Option<Station>> {
        let row: Option<DbStation> = sqlx::query_as(&format!(
            "SELECT {STATION_COLS} FROM stations
             WHERE tenant_name = $1 AND name = $2 AND NOT is_deleted"
        ))
        .bind(tenant)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(DbStation::into_domain).transpose()
    }

    async fn get_station_by_id(&self, id: i64) -> MetadataResult<Option<Station>> {
        let row: Option<DbStation> =
            sqlx::query_as(&format!("SELECT {STATION_COLS} FROM stations WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(DbStation::into_domain).transpose()
    }

    async fn list_stations(&self, tenant: &str) -> MetadataResult<Vec<Station>> {
        let rows: Vec<DbStation> = sqlx::query_as(&format!(
            "SELECT {STATION_COLS} FROM stations
             WHERE tenant_name = $1 AND NOT is_deleted ORDER BY name"
        ))
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(DbStation::into_domain).collect()
    }

    async fn list_all_stations(&self) -> MetadataResult<Vec<Station>> {
        let rows: Vec<DbStation> = sqlx::query_as(&format!(
            "SELECT {STATION_COLS} FROM stations WHERE NOT is_deleted ORDER BY tenant_name, name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(DbStation::into_domain).collect()
    }

    async fn soft_delete_station(
        &self,
        tenant: &str,
        name: &str,
    ) -> MetadataResult<Option<Station>> {
        let row: Option<DbStation> = sqlx::query_as(&format!(
            "UPDATE stations SET is_deleted = TRUE, updated_at = $3
             WHERE tenant_name = $1 AND name = $2 AND NOT is_deleted
             RETURNING {STATION_COLS}"
        ))
        .bind(tenant)
        .bind(name)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(DbStation::into_domain).transpose()
    }

    async fn update_station_schema(
        &self,
        tenant: &str,
        name: &str,
        schema_name: &str,
        version_number: i32,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE stations SET schema_name = $3, schema_version_number = $4, updated_at = $5
             WHERE tenant_name = $1 AND name = $2 AND NOT is_deleted",
        )
        .bind(tenant)
        .bind(name)
        .bind(schema_name)
        .bind(version_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_producer(&self, producer: NewProducer) -> MetadataResult<Producer> {
        let row: DbProducer = sqlx::query_as(
            "INSERT INTO producers (station_id, name, connection_id, client_address, \
                 created_by_username, is_active, is_deleted)
             VALUES ($1, $2, $3, $4, $5, TRUE, FALSE)
             ON CONFLICT (station_id, name, connection_id)
             DO UPDATE SET is_active = TRUE, is_deleted = FALSE
             RETURNING id, station_id, name, connection_id, client_address, \
                 created_by_username, is_active, is_deleted",
        )
        .bind(producer.station_id)
        .bind(&producer.name)
        .bind(&producer.connection_id)
        .bind(&producer.client_address)
        .bind(&producer.created_by_username)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn get_producer_by_name_and_connection(
        &self,
        name: &str,
        connection_id: &str,
    ) -> MetadataResult<Option<Producer>> {
        let row: Option<DbProducer> = sqlx::query_as(
            "SELECT id, station_id, name, connection_id, client_address, created_by_username, \
                 is_active, is_deleted
             FROM producers WHERE name = $1 AND connection_id = $2 AND NOT is_deleted",
        )
        .bind(name)
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn get_producer_by_id(&self, id: i64) -> MetadataResult<Option<Producer>> {
        let row: Option<DbProducer> = sqlx::query_as(
            "SELECT id, station_id, name, connection_id, client_address, created_by_username, \
                 is_active, is_deleted
             FROM producers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_station_producers(&self, station_id: i64) -> MetadataResult<Vec<Producer>> {
        let rows: Vec<DbProducer> = sqlx::query_as(
            "SELECT id, station_id, name, connection_id, client_address, created_by_username, \
                 is_active, is_deleted
             FROM producers WHERE station_id = $1 AND NOT is_deleted",
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_producers_active_by_connection(
        &self,
        connection_id: &str,
        active: bool,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE producers SET is_active = $2 WHERE connection_id = $1 AND NOT is_deleted",
        )
        .bind(connection_id)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn deactivate_station_producers(&self, station_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE producers SET is_active = FALSE, is_deleted = TRUE WHERE station_id = $1",
        )
        .bind(station_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn insert_consumer(&self, consumer: NewConsumer) -> MetadataResult<Consumer> {
        let row: DbConsumer = sqlx::query_as(
            "INSERT INTO consumers (station_id, name, consumers_group, connection_id, \
                 client_address, created_by_username, max_ack_time_ms, max_msg_deliveries, \
                 start_consume_from_seq, last_messages, is_active, is_deleted)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE, FALSE)
             RETURNING id, station_id, name, consumers_group, connection_id, client_address, \
                 created_by_username, max_ack_time_ms, max_msg_deliveries, \
                 start_consume_from_seq, last_messages, is_active, is_deleted",
        )
        .bind(consumer.station_id)
        .bind(&consumer.name)
        .bind(&consumer.consumers_group)
        .bind(&consumer.connection_id)
        .bind(&consumer.client_address)
        .bind(&consumer.created_by_username)
        .bind(consumer.max_ack_time_ms)
        .bind(consumer.max_msg_deliveries)
        .bind(consumer.start_consume_from_seq)
        .bind(consumer.last_messages)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.into())
    }

    async fn list_cg_members(
        &self,
        station_id: i64,
        consumers_group: &str,
    ) -> MetadataResult<Vec<CgMember>> {
        let rows: Vec<DbConsumer> = sqlx::query_as(
            "SELECT id, station_id, name, consumers_group, connection_id, client_address, \
                 created_by_username, max_ack_time_ms, max_msg_deliveries, \
                 start_consume_from_seq, last_messages, is_active, is_deleted
             FROM consumers WHERE station_id = $1 AND consumers_group = $2",
        )
        .bind(station_id)
        .bind(consumers_group)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|c| CgMember {
                name: c.name,
                client_address: c.client_address,
                is_active: c.is_active,
                is_deleted: c.is_deleted,
                max_ack_time_ms: c.max_ack_time_ms,
                max_msg_deliveries: c.max_msg_deliveries,
                created_by_username: c.created_by_username,
            })
            .collect())
    }

    async fn list_station_consumer_groups(&self, station_id: i64) -> MetadataResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT consumers_group FROM consumers
             WHERE station_id = $1 AND NOT is_deleted ORDER BY consumers_group",
        )
        .bind(station_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("consumers_group"))
            .collect())
    }

    async fn delete_consumer_group(
        &self,
        station_id: i64,
        consumers_group: &str,
    ) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE consumers SET is_active = FALSE, is_deleted = TRUE
             WHERE station_id = $1 AND consumers_group = $2 AND NOT is_deleted",
        )
        .bind(station_id)
        .bind(consumers_group)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn deactivate_station_consumers(&self, station_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE consumers SET is_active = FALSE, is_deleted = TRUE WHERE station_id = $1",
        )
        .bind(station_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn upsert_poison_dls(
        &self,
        station_id: i64,
        message_seq: i64,
        cg_name: &str,
        producer_id: i64,
        details: &MessagePayload,
        tenant_name: &str,
    ) -> MetadataResult<DlsUpsert> {
        // One statement: the conflict branch appends the group only when it
        // is missing; an already-present group updates no row, so RETURNING
        // is empty and the caller sees Unchanged. `xmax = 0` distinguishes
        // a fresh insert from a conflict update.
        let row = sqlx::query(
            "INSERT INTO dls_messages (station_id, message_seq, producer_id, poisoned_cgs, \
                 message_details, updated_at, message_type, validation_error, tenant_name)
             VALUES ($1, $2, $3, ARRAY[$4], $5, $6, 'poison', '', $7)
             ON CONFLICT (station_id, message_seq, message_type) WHERE message_type = 'poison'
             DO UPDATE SET poisoned_cgs = array_append(dls_messages.poisoned_cgs, $4), \
                 updated_at = $6
             WHERE NOT ($4 = ANY(dls_messages.poisoned_cgs))
             RETURNING id, (xmax = 0) AS inserted",
        )
        .bind(station_id)
        .bind(message_seq)
        .bind(producer_id)
        .bind(cg_name)
        .bind(Json(details))
        .bind(Utc::now())
        .bind(tenant_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row {
            None => DlsUpsert::Unchanged,
            Some(row) => {
                let id: i64 = row.get("id");
                if row.get::<bool, _>("inserted") {
                    DlsUpsert::Created(id)
                } else {
                    DlsUpsert::CgAdded(id)
                }
            }
        })
    }

    async fn insert_schema_dls(
        &self,
        station_id: i64,
        producer_id: i64,
        details: &MessagePayload,
        validation_error: &str,
        tenant_name: &str,
    ) -> MetadataResult<i64> {
        let row = sqlx::query(
            "INSERT INTO dls_messages (station_id, message_seq, producer_id, poisoned_cgs, \
                 message_details, updated_at, message_type, validation_error, tenant_name)
             VALUES ($1, 0, $2, '{}', $3, $4, 'schema', $5, $6)
             RETURNING id",
        )
        .bind(station_id)
        .bind(producer_id)
        .bind(Json(details))
        .bind(Utc::now())
        .bind(validation_error)
        .bind(tenant_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("id"))
    }

    async fn get_dls_message(&self, id: i64) -> MetadataResult<Option<DlsMessage>> {
        let row: Option<DbDlsMessage> =
            sqlx::query_as(&format!("SELECT {DLS_COLS} FROM dls_messages WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(DbDlsMessage::into_domain).transpose()
    }

    async fn list_dls_by_station(&self, station_id: i64) -> MetadataResult<Vec<DlsMessage>> {
        let rows: Vec<DbDlsMessage> = sqlx::query_as(&format!(
            "SELECT {DLS_COLS} FROM dls_messages WHERE station_id = $1"
        ))
        .bind(station_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(DbDlsMessage::into_domain).collect()
    }

    async fn delete_dls_messages(&self, ids: &[i64]) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM dls_messages WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_dls_by_station(&self, station_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM dls_messages WHERE station_id = $1")
            .bind(station_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn remove_cg_from_dls(&self, id: i64, cg_name: &str) -> MetadataResult<()> {
        // Drop the group, then garbage-collect the record if the set is
        // empty. Two statements, one transaction.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "UPDATE dls_messages SET poisoned_cgs = array_remove(poisoned_cgs, $2), \
                 updated_at = $3
             WHERE id = $1",
        )
        .bind(id)
        .bind(cg_name)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "DELETE FROM dls_messages WHERE id = $1 AND cardinality(poisoned_cgs) = 0
                 AND message_type = 'poison'",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn delete_dls_older_than(&self, cutoff: DateTime<Utc>) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM dls_messages WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn count_poison_dls_by_cg(
        &self,
        station_id: i64,
        cg_name: &str,
    ) -> MetadataResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM dls_messages
             WHERE station_id = $1 AND message_type = 'poison' AND $2 = ANY(poisoned_cgs)",
        )
        .bind(station_id)
        .bind(cg_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("n"))
    }

    async fn upsert_configuration(&self, key: &str, value: &str) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO configurations (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_all_configurations(&self) -> MetadataResult<Vec<ConfigEntry>> {
        let rows = sqlx::query("SELECT key, value FROM configurations ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| ConfigEntry {
                key: row.get("key"),
                value: row.get("value"),
            })
            .collect())
    }

    async fn insert_audit_log(&self, log: NewAuditLog) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO audit_logs (tenant_name, station_name, message, created_by_username, \
                 created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&log.tenant_name)
        .bind(&log.station_name)
        .bind(&log.message)
        .bind(&log.created_by_username)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_audit_logs_by_station(
        &self,
        tenant: &str,
        station_name: &str,
    ) -> MetadataResult<u64> {
        let result =
            sqlx::query("DELETE FROM audit_logs WHERE tenant_name = $1 AND station_name = $2")
                .bind(tenant)
                .bind(station_name)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
