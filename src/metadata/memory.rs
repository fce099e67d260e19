//! In-memory implementation of the metadata store.
//!
//! Implements [`MetadataDb`] entirely in memory using `HashMap`s guarded by
//! a `tokio::sync::RwLock`. It exists for:
//!
//! - local development and tests (no external dependencies)
//! - embedded deployments where durability is not required
//!
//! **Not durable**: all state is lost on process restart. Operations are
//! consistent within one process; mutations take the write lock, so the
//! "single statement" atomicity the trait demands holds trivially.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    CgMember, ConfigEntry, Consumer, DlsKind, DlsMessage, DlsUpsert, MetadataDb, MetadataError,
    MetadataResult, MessagePayload, NewAuditLog, NewConsumer, NewProducer, NewStation, Producer,
    Station, Tenant,
};

#[derive(Default)]
struct State {
    next_id: i64,
    tenants: HashMap<String, Tenant>,
    stations: Vec<Station>,
    producers: Vec<Producer>,
    consumers: Vec<Consumer>,
    dls: Vec<DlsMessage>,
    configurations: HashMap<String, String>,
    audit_logs: Vec<StoredAuditLog>,
}

struct StoredAuditLog {
    tenant_name: String,
    station_name: String,
    #[allow(dead_code)]
    message: String,
    #[allow(dead_code)]
    created_by_username: String,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory metadata store. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryMetadataDb {
    state: std::sync::Arc<RwLock<State>>,
}

impl MemoryMetadataDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataDb for MemoryMetadataDb {
    // --- tenants ---

    async fn upsert_tenant(
        &self,
        name: &str,
        internal_credential: &str,
    ) -> MetadataResult<Tenant> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.tenants.get(name) {
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let tenant = Tenant {
            id,
            name: name.to_string(),
            internal_credential: internal_credential.to_string(),
        };
        state.tenants.insert(name.to_string(), tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant(&self, name: &str) -> MetadataResult<Option<Tenant>> {
        Ok(self.state.read().await.tenants.get(name).cloned())
    }

    async fn list_tenants(&self) -> MetadataResult<Vec<Tenant>> {
        let mut tenants: Vec<_> = self.state.read().await.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tenants)
    }

    async fn delete_tenant(&self, name: &str) -> MetadataResult<()> {
        let mut state = self.state.write().await;
        state.tenants.remove(name);
        let station_ids: Vec<i64> = state
            .stations
            .iter()
            .filter(|s| s.tenant_name == name)
            .map(|s| s.id)
            .collect();
        state.stations.retain(|s| s.tenant_name != name);
        state
            .producers
            .retain(|p| !station_ids.contains(&p.station_id));
        state
            .consumers
            .retain(|c| !station_ids.contains(&c.station_id));
        state.dls.retain(|d| d.tenant_name != name);
        state.audit_logs.retain(|a| a.tenant_name != name);
        Ok(())
    }

    // --- stations ---

    async fn insert_station(&self, station: NewStation) -> MetadataResult<Station> {
        let mut state = self.state.write().await;
        let exists = state
            .stations
            .iter()
            .any(|s| !s.is_deleted && s.tenant_name == station.tenant_name && s.name == station.name);
        if exists {
            return Err(MetadataError::AlreadyExists(format!(
                "Station {} already exists",
                station.name
            )));
        }
        let now = Utc::now();
        let id = state.next_id();
        let row = Station {
            id,
            tenant_name: station.tenant_name,
            name: station.name,
            retention_type: station.retention_type,
            retention_value: station.retention_value,
            storage_type: station.storage_type,
            replicas: station.replicas,
            idempotency_window_ms: station.idempotency_window_ms,
            is_native: station.is_native,
            dls_poison: station.dls_poison,
            dls_schemaverse: station.dls_schemaverse,
            tiered_storage_enabled: station.tiered_storage_enabled,
            schema_name: station.schema_name,
            schema_version_number: station.schema_version_number,
            created_by_username: station.created_by_username,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        state.stations.push(row.clone());
        Ok(row)
    }

    async fn get_station(&self, tenant: &str, name: &str) -> MetadataResult<Option<Station>> {
        Ok(self
            .state
            .read()
            .await
            .stations
            .iter()
            .find(|s| !s.is_deleted && s.tenant_name == tenant && s.name == name)
            .cloned())
    }

    async fn get_station_by_id(&self, id: i64) -> MetadataResult<Option<Station>> {
        Ok(self
            .state
            .read()
            .await
            .stations
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn list_stations(&self, tenant: &str) -> MetadataResult<Vec<Station>> {
        Ok(self
            .state
            .read()
            .await
            .stations
            .iter()
            .filter(|s| !s.is_deleted && s.tenant_name == tenant)
            .cloned()
            .collect())
    }

    async fn list_all_stations(&self) -> MetadataResult<Vec<Station>> {
        Ok(self
            .state
            .read()
            .await
            .stations
            .iter()
            .filter(|s| !s.is_deleted)
            .cloned()
            .collect())
    }

    async fn soft_delete_station(
        &self,
        tenant: &str,
        name: &str,
    ) -> MetadataResult<Option<Station>> {
        let mut state = self.state.write().await;
        let row = state
            .stations
            .iter_mut()
            .find(|s| !s.is_deleted && s.tenant_name == tenant && s.name == name);
        match row {
            Some(station) => {
                let snapshot = station.clone();
                station.is_deleted = true;
                station.updated_at = Utc::now();
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    async fn update_station_schema(
        &self,
        tenant: &str,
        name: &str,
        schema_name: &str,
        version_number: i32,
    ) -> MetadataResult<bool> {
        let mut state = self.state.write().await;
        let row = state
            .stations
            .iter_mut()
            .find(|s| !s.is_deleted && s.tenant_name == tenant && s.name == name);
        match row {
            Some(station) => {
                station.schema_name = schema_name.to_string();
                station.schema_version_number = version_number;
                station.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // --- producers ---

    async fn upsert_producer(&self, producer: NewProducer) -> MetadataResult<Producer> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.producers.iter_mut().find(|p| {
            p.station_id == producer.station_id
                && p.name == producer.name
                && p.connection_id == producer.connection_id
        }) {
            existing.is_active = true;
            existing.is_deleted = false;
            return Ok(existing.clone());
        }
        let id = state.next_id();
        let row = Producer {
            id,
            station_id: producer.station_id,
            name: producer.name,
            connection_id: producer.connection_id,
            client_address: producer.client_address,
            created_by_username: producer.created_by_username,
            is_active: true,
            is_deleted: false,
        };
        state.producers.push(row.clone());
        Ok(row)
    }

    async fn get_producer_by_name_and_connection(
        &self,
        name: &str,
        connection_id: &str,
    ) -> MetadataResult<Option<Producer>> {
        Ok(self
            .state
            .read()
            .await
            .producers
            .iter()
            .find(|p| !p.is_deleted && p.name == name && p.connection_id == connection_id)
            .cloned())
    }

    async fn get_producer_by_id(&self, id: i64) -> MetadataResult<Option<Producer>> {
        Ok(self
            .state
            .read()
            .await
            .producers
            .iter()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn list_station_producers(&self, station_id: i64) -> MetadataResult<Vec<Producer>> {
        Ok(self
            .state
            .read()
            .await
            .producers
            .iter()
            .filter(|p| p.station_id == station_id && !p.is_deleted)
            .cloned()
            .collect())
    }

    async fn set_producers_active_by_connection(
        &self,
        connection_id: &str,
        active: bool,
    ) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let mut affected = 0;
        for producer in state
            .producers
            .iter_mut()
            .filter(|p| !p.is_deleted && p.connection_id == connection_id)
        {
            producer.is_active = active;
            affected += 1;
        }
        Ok(affected)
    }

    async fn deactivate_station_producers(&self, station_id: i64) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let mut affected = 0;
        for producer in state
            .producers
            .iter_mut()
            .filter(|p| p.station_id == station_id)
        {
            producer.is_active = false;
            producer.is_deleted = true;
            affected += 1;
        }
        Ok(affected)
    }

    // --- consumers ---

    async fn insert_consumer(&self, consumer: NewConsumer) -> MetadataResult<Consumer> {
        let mut state = self.state.write().await;
        let id = state.next_id();
        let row = Consumer {
            id,
            station_id: consumer.station_id,
            name: consumer.name,
            consumers_group: consumer.consumers_group,
            connection_id: consumer.connection_id,
            client_address: consumer.client_address,
            created_by_username: consumer.created_by_username,
            max_ack_time_ms: consumer.max_ack_time_ms,
            max_msg_deliveries: consumer.max_msg_deliveries,
            start_consume_from_seq: consumer.start_consume_from_seq,
            last_messages: consumer.last_messages,
            is_active: true,
            is_deleted: false,
        };
        state.consumers.push(row.clone());
        Ok(row)
    }

    async fn list_cg_members(
        &self,
        station_id: i64,
        consumers_group: &str,
    ) -> MetadataResult<Vec<CgMember>> {
        Ok(self
            .state
            .read()
            .await
            .consumers
            .iter()
            .filter(|c| c.station_id == station_id && c.consumers_group == consumers_group)
            .map(|c| CgMember {
                name: c.name.clone(),
                client_address: c.client_address.clone(),
                is_active: c.is_active,
                is_deleted: c.is_deleted,
                max_ack_time_ms: c.max_ack_time_ms,
                max_msg_deliveries: c.max_msg_deliveries,
                created_by_username: c.created_by_username.clone(),
            })
            .collect())
    }

    async fn list_station_consumer_groups(&self, station_id: i64) -> MetadataResult<Vec<String>> {
        let state = self.state.read().await;
        let mut groups: Vec<String> = state
            .consumers
            .iter()
            .filter(|c| c.station_id == station_id && !c.is_deleted)
            .map(|c| c.consumers_group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        Ok(groups)
    }

    async fn delete_consumer_group(
        &self,
        station_id: i64,
        consumers_group: &str,
    ) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let mut affected = 0;
        for consumer in state.consumers.iter_mut().filter(|c| {
            c.station_id == station_id && c.consumers_group == consumers_group && !c.is_deleted
        }) {
            consumer.is_active = false;
            consumer.is_deleted = true;
            affected += 1;
        }
        Ok(affected)
    }

    async fn deactivate_station_consumers(&self, station_id: i64) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let mut affected = 0;
        for consumer in state
            .consumers
            .iter_mut()
            .filter(|c| c.station_id == station_id)
        {
            consumer.is_active = false;
            consumer.is_deleted = true;
            affected += 1;
        }
        Ok(affected)
    }

    // --- DLS records ---

    async fn upsert_poison_dls(
        &self,
        station_id: i64,
        message_seq: i64,
        cg_name: &str,
        producer_id: i64,
        details: &MessagePayload,
        tenant_name: &str,
    ) -> MetadataResult<DlsUpsert> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.dls.iter_mut().find(|d| {
            d.station_id == station_id
                && d.message_seq == message_seq
                && d.message_type == DlsKind::Poison
        }) {
            if existing.poisoned_cgs.iter().any(|cg| cg == cg_name) {
                return Ok(DlsUpsert::Unchanged);
            }
            existing.poisoned_cgs.push(cg_name.to_string());
            existing.updated_at = Utc::now();
            return Ok(DlsUpsert::CgAdded(existing.id));
        }
        let id = state.next_id();
        state.dls.push(DlsMessage {
            id,
            station_id,
            message_seq,
            producer_id,
            poisoned_cgs: vec![cg_name.to_string()],
            message_details: details.clone(),
            updated_at: Utc::now(),
            message_type: DlsKind::Poison,
            validation_error: String::new(),
            tenant_name: tenant_name.to_string(),
        });
        Ok(DlsUpsert::Created(id))
    }

    async fn insert_schema_dls(
        &self,
        station_id: i64,
        producer_id: i64,
        details: &MessagePayload,
        validation_error: &str,
        tenant_name: &str,
    ) -> MetadataResult<i64> {
        let mut state = self.state.write().await;
        let id = state.next_id();
        state.dls.push(DlsMessage {
            id,
            station_id,
            // Schema failures never reached the stream; there is no seq.
            message_seq: 0,
            producer_id,
            poisoned_cgs: Vec::new(),
            message_details: details.clone(),
            updated_at: Utc::now(),
            message_type: DlsKind::Schema,
            validation_error: validation_error.to_string(),
            tenant_name: tenant_name.to_string(),
        });
        Ok(id)
    }

    async fn get_dls_message(&self, id: i64) -> MetadataResult<Option<DlsMessage>> {
        Ok(self
            .state
            .read()
            .await
            .dls
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn list_dls_by_station(&self, station_id: i64) -> MetadataResult<Vec<DlsMessage>> {
        Ok(self
            .state
            .read()
            .await
            .dls
            .iter()
            .filter(|d| d.station_id == station_id)
            .cloned()
            .collect())
    }

    async fn delete_dls_messages(&self, ids: &[i64]) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let before = state.dls.len();
        state.dls.retain(|d| !ids.contains(&d.id));
        Ok((before - state.dls.len()) as u64)
    }

    async fn delete_dls_by_station(&self, station_id: i64) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let before = state.dls.len();
        state.dls.retain(|d| d.station_id != station_id);
        Ok((before - state.dls.len()) as u64)
    }

    async fn remove_cg_from_dls(&self, id: i64, cg_name: &str) -> MetadataResult<()> {
        let mut state = self.state.write().await;
        if let Some(record) = state.dls.iter_mut().find(|d| d.id == id) {
            record.poisoned_cgs.retain(|cg| cg != cg_name);
            record.updated_at = Utc::now();
            if record.poisoned_cgs.is_empty() {
                state.dls.retain(|d| d.id != id);
            }
        }
        Ok(())
    }

    async fn delete_dls_older_than(&self, cutoff: DateTime<Utc>) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let before = state.dls.len();
        state.dls.retain(|d| d.updated_at >= cutoff);
        Ok((before - state.dls.len()) as u64)
    }

    async fn count_poison_dls_by_cg(
        &self,
        station_id: i64,
        cg_name: &str,
    ) -> MetadataResult<i64> {
        Ok(self
            .state
            .read()
            .await
            .dls
            .iter()
            .filter(|d| {
                d.station_id == station_id
                    && d.message_type == DlsKind::Poison
                    && d.poisoned_cgs.iter().any(|cg| cg == cg_name)
            })
            .count() as i64)
    }

    // --- configuration ---

    async fn upsert_configuration(&self, key: &str, value: &str) -> MetadataResult<()> {
        self.state
            .write()
            .await
            .configurations
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_all_configurations(&self) -> MetadataResult<Vec<ConfigEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<ConfigEntry> = state
            .configurations
            .iter()
            .map(|(key, value)| ConfigEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    // --- audit logs ---

    async fn insert_audit_log(&self, log: NewAuditLog) -> MetadataResult<()> {
        self.state.write().await.audit_logs.push(StoredAuditLog {
            tenant_name: log.tenant_name,
            station_name: log.station_name,
            message: log.message,
            created_by_username: log.created_by_username,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn delete_audit_logs_by_station(
        &self,
        tenant: &str,
        station_name: &str,
    ) -> MetadataResult<u64> {
        let mut state = self.state.write().await;
        let before = state.audit_logs.len();
        state
            .audit_logs
            .retain(|a| !(a.tenant_name == tenant && a.station_name == station_name));
        Ok((before - state.audit_logs.len()) as u64)
    }
}
