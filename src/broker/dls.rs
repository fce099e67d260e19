//! The dead-letter store engine.
//!
//! Two independent ingresses feed one persisted store:
//!
//! - **Poison path**: max-deliveries advisories drained from the
//!   dls-unacked work queue. Advisories for the same (station, sequence)
//!   coalesce through an atomic upsert, so the recorded consumer-group set
//!   is the union of everything observed, independent of arrival order.
//! - **Schema path**: validation failures producer SDKs report on the
//!   schemaverse subject.
//!
//! Advisories are acked only after the record durably landed; everything
//! the engine decides to skip (non-native stations, resends, expired
//! messages) is acked silently so the work queue drains.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{
    station_final_subject, DLS_PRODUCER_MARKER, GLOBAL_ACCOUNT, HDR_PM_ID, HDR_PRODUCED_BY,
};
use crate::error::{Error, Result};
use crate::headers::{HeaderMap, StationHeaders};
use crate::metadata::{CgMember, DlsKind, DlsUpsert, MessagePayload, MetadataDb, Station};
use crate::substrate::{MaxDeliveriesAdvisory, Substrate, SubstrateError};
use crate::validation::{replace_delimiters, revert_delimiters};

use super::config::ConfigStore;
use super::integrations::{AlertType, Notifier};
use super::sessions::cg_status;
use super::station::StationName;

/// Cap on records returned per type by the light listing.
const LIGHT_LIST_LIMIT: usize = 1000;

/// Preview length of the light listing, in bytes of the stored encoding.
const PREVIEW_LIMIT: usize = 80;

const POISON_MESSAGE_TITLE: &str = "Poison message";

/// What the poison path did with one advisory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvisoryOutcome {
    /// A record was created or gained a consumer group.
    Stored { record_id: i64 },
    /// Nothing to record; the advisory is acked silently.
    Skipped(&'static str),
}

/// Wire shape of a schema-validation failure reported by a producer SDK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaverseDlsEvent {
    pub station_name: String,
    pub producer: SchemaverseProducer,
    pub message: SchemaverseMessage,
    #[serde(default)]
    pub validation_error: String,
    #[serde(default)]
    pub tenant_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaverseProducer {
    pub name: String,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaverseMessage {
    #[serde(default)]
    pub time_sent: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub size: i64,
    /// Hex-encoded payload, as captured by the SDK.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

/// Wire shape of a poison-message ack from a consumer SDK.
///
/// The presence of `cg_name` selects the modern path (drop the group from
/// the record); its absence selects the legacy whole-record drop, kept for
/// SDKs that predate per-group acks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmAckEvent {
    pub id: i64,
    #[serde(default)]
    pub cg_name: String,
    #[serde(default)]
    pub tenant_name: String,
}

/// One consumer group's snapshot inside a journey.
#[derive(Debug, Clone, Serialize)]
pub struct PoisonedCgDetails {
    pub cg_name: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub total_poison_messages: i64,
    pub max_ack_time_ms: i64,
    pub max_msg_deliveries: i32,
    /// Messages the group has not been handed yet.
    pub unprocessed_messages: u64,
    /// Delivered but unacked.
    pub in_process_messages: u64,
    pub members: Vec<CgMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerDetails {
    pub name: String,
    pub connection_id: String,
    pub client_address: String,
    pub created_by_username: String,
    pub is_active: bool,
    pub is_deleted: bool,
}

/// A DLS record with everything the journey view needs.
#[derive(Debug, Clone, Serialize)]
pub struct DlsJourney {
    pub id: i64,
    pub station_name: String,
    pub message_seq: i64,
    pub message_type: DlsKind,
    pub producer: Option<ProducerDetails>,
    pub message: MessagePayload,
    pub validation_error: String,
    pub updated_at: chrono::DateTime<Utc>,
    pub poisoned_cgs: Vec<PoisonedCgDetails>,
}

/// A truncated record for station-page listings.
#[derive(Debug, Clone, Serialize)]
pub struct LightDlsMessage {
    pub id: i64,
    pub message_seq: i64,
    pub message: MessagePayload,
}

pub struct DlsEngine {
    db: Arc<dyn MetadataDb>,
    substrate: Arc<dyn Substrate>,
    notifier: Notifier,
    config: ConfigStore,
}

impl DlsEngine {
    pub fn new(
        db: Arc<dyn MetadataDb>,
        substrate: Arc<dyn Substrate>,
        notifier: Notifier,
        config: ConfigStore,
    ) -> Self {
        Self {
            db,
            substrate,
            notifier,
            config,
        }
    }

    // =========================================================================
    // Poison path
    // =========================================================================

    /// Handle one max-deliveries advisory. `Ok` means the advisory may be
    /// acked (work done or legitimately skipped); `Err` leaves it for
    /// redelivery.
    pub async fn process_advisory(
        &self,
        advisory: &MaxDeliveriesAdvisory,
    ) -> Result<AdvisoryOutcome> {
        // Pre-multi-tenant substrates omit the account.
        let tenant = if advisory.account.is_empty() {
            GLOBAL_ACCOUNT
        } else {
            advisory.account.as_str()
        };

        let station_name = StationName::from_stream_name(&advisory.stream);
        let Some(station) = self.db.get_station(tenant, station_name.ext()).await? else {
            // Advisories for internal streams land here too; they carry no
            // station and are operational visibility only.
            return Ok(AdvisoryOutcome::Skipped("station not found"));
        };
        if !station.dls_poison {
            return Ok(AdvisoryOutcome::Skipped("poison dls disabled"));
        }
        if !station.is_native {
            return Ok(AdvisoryOutcome::Skipped("non-native station"));
        }

        let cg_name = revert_delimiters(&advisory.consumer);

        let stored = match self
            .substrate
            .get_message(tenant, station_name.intern(), advisory.stream_seq)
            .await
        {
            Ok(msg) => msg,
            // Retention already expired the message.
            Err(SubstrateError::MessageNotFound { .. }) => {
                return Ok(AdvisoryOutcome::Skipped("message expired"))
            }
            Err(e) => return Err(e.into()),
        };

        let headers = HeaderMap::decode(&stored.headers)
            .map_err(|e| Error::Transient(format!("bad message headers: {e}")))?;
        let Some(station_headers) = StationHeaders::from_map(&headers) else {
            warn!(
                "[tenant: {tenant}]handle_unacked_msg: missing mandatory message headers, \
                 please upgrade the SDK version you are using"
            );
            return Ok(AdvisoryOutcome::Skipped("missing mandatory headers"));
        };
        if station_headers.is_dls_resend() {
            return Ok(AdvisoryOutcome::Skipped("dls resend"));
        }

        let Some(producer) = self
            .db
            .get_producer_by_name_and_connection(
                &station_headers.produced_by,
                &station_headers.connection_id,
            )
            .await?
        else {
            warn!(
                "[tenant: {tenant}]handle_unacked_msg: producer {} couldn't be found",
                station_headers.produced_by
            );
            return Ok(AdvisoryOutcome::Skipped("producer not found"));
        };

        let details = MessagePayload {
            time_sent: stored.time,
            size: (stored.data.len() + stored.headers.len()) as i64,
            data: hex::encode(&stored.data),
            headers: storable_headers(&headers),
        };

        let outcome = self
            .db
            .upsert_poison_dls(
                station.id,
                advisory.stream_seq as i64,
                &cg_name,
                producer.id,
                &details,
                tenant,
            )
            .await?;

        let record_id = match outcome {
            DlsUpsert::Created(id) | DlsUpsert::CgAdded(id) => id,
            DlsUpsert::Unchanged => return Ok(AdvisoryOutcome::Skipped("already recorded")),
        };

        if matches!(outcome, DlsUpsert::Created(_)) {
            let ui_host = self.config.current().ui_host;
            let msg = format!(
                "Poison message has been identified, for more details head to: \
                 {ui_host}/stations/{}/{record_id}",
                station_name.ext()
            );
            if let Err(e) = self
                .notifier
                .notify(tenant, AlertType::PoisonMessage, POISON_MESSAGE_TITLE, &msg)
                .await
            {
                warn!("[tenant: {tenant}]handle_unacked_msg: notification failed: {e}");
            }
        }

        Ok(AdvisoryOutcome::Stored { record_id })
    }

    // =========================================================================
    // Schema path
    // =========================================================================

    /// Record a schema-validation failure. Unknown stations and producers
    /// warn and drop; the event is fire-and-forget from the SDK side.
    pub async fn process_schema_failure(
        &self,
        event: &SchemaverseDlsEvent,
    ) -> Result<Option<i64>> {
        let tenant = if event.tenant_name.is_empty() {
            GLOBAL_ACCOUNT
        } else {
            event.tenant_name.as_str()
        };
        let station_name = StationName::parse(&event.station_name)?;
        let Some(station) = self.db.get_station(tenant, station_name.ext()).await? else {
            warn!(
                "[tenant: {tenant}]schemaverse_dls: station {} not found",
                station_name.ext()
            );
            return Ok(None);
        };
        if !station.dls_schemaverse {
            return Ok(None);
        }
        let Some(producer) = self
            .db
            .get_producer_by_name_and_connection(
                &event.producer.name,
                &event.producer.connection_id,
            )
            .await?
        else {
            warn!(
                "[tenant: {tenant}]schemaverse_dls: producer {} not found",
                event.producer.name
            );
            return Ok(None);
        };

        let details = MessagePayload {
            time_sent: event.message.time_sent.unwrap_or_else(Utc::now),
            size: event.message.size,
            data: event.message.data.clone(),
            headers: event.message.headers.clone(),
        };
        let id = self
            .db
            .insert_schema_dls(
                station.id,
                producer.id,
                &details,
                &event.validation_error,
                tenant,
            )
            .await?;
        Ok(Some(id))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Full journey of one record, with a live snapshot per poisoned
    /// consumer group.
    pub async fn journey(&self, dls_id: i64) -> Result<DlsJourney> {
        let record = self
            .db
            .get_dls_message(dls_id)
            .await?
            .ok_or_else(|| Error::NotFound("dls message does not exist".to_string()))?;
        let station = self
            .db
            .get_station_by_id(record.station_id)
            .await?
            .ok_or_else(|| Error::NotFound("Station does not exist".to_string()))?;
        let station_name = StationName::parse(&station.name)?;
        let tenant = &record.tenant_name;

        let producer = if station.is_native {
            self.db
                .get_producer_by_id(record.producer_id)
                .await?
                .map(|p| ProducerDetails {
                    name: p.name,
                    connection_id: p.connection_id,
                    client_address: p.client_address,
                    created_by_username: p.created_by_username,
                    is_active: p.is_active,
                    is_deleted: p.is_deleted,
                })
        } else {
            None
        };

        let mut poisoned_cgs = Vec::with_capacity(record.poisoned_cgs.len());
        for cg_name in &record.poisoned_cgs {
            let members = self.db.list_cg_members(station.id, cg_name).await?;
            let (is_active, is_deleted) = cg_status(&members);
            let (unprocessed, in_process) = match self
                .substrate
                .consumer_info(tenant, station_name.intern(), &replace_delimiters(cg_name))
                .await
            {
                Ok(info) => (info.num_pending, info.num_ack_pending),
                Err(SubstrateError::ConsumerNotFound(_)) => (0, 0),
                Err(e) => return Err(e.into()),
            };
            let total = self.db.count_poison_dls_by_cg(station.id, cg_name).await?;
            // Members share delivery parameters by construction.
            let (max_ack_time_ms, max_msg_deliveries) = members
                .first()
                .map(|m| (m.max_ack_time_ms, m.max_msg_deliveries))
                .unwrap_or((0, 0));
            poisoned_cgs.push(PoisonedCgDetails {
                cg_name: cg_name.clone(),
                is_active,
                is_deleted,
                total_poison_messages: total,
                max_ack_time_ms,
                max_msg_deliveries,
                unprocessed_messages: unprocessed,
                in_process_messages: in_process,
                members,
            });
        }
        poisoned_cgs.sort_by(|a, b| a.cg_name.cmp(&b.cg_name));

        let mut message = record.message_details.clone();
        message
            .headers
            .retain(|k, _| !k.starts_with(crate::constants::RESERVED_HDR_PREFIX));
        if record.message_type == DlsKind::Schema {
            message.size = (message.data.len() + message.headers.len()) as i64;
        }

        Ok(DlsJourney {
            id: record.id,
            station_name: station.name,
            message_seq: record.message_seq,
            message_type: record.message_type,
            producer,
            message,
            validation_error: record.validation_error,
            updated_at: record.updated_at,
            poisoned_cgs,
        })
    }

    /// Up to 1000 most-recent records of each type, newest first, with an
    /// 80-byte payload preview.
    pub async fn list_light(
        &self,
        station: &Station,
    ) -> Result<(Vec<LightDlsMessage>, Vec<LightDlsMessage>, usize)> {
        let records = self.db.list_dls_by_station(station.id).await?;
        let total = records.len();

        let mut poison = Vec::new();
        let mut schema = Vec::new();
        for record in records {
            let mut message = record.message_details;
            match record.message_type {
                DlsKind::Poison => {
                    message.data.truncate(PREVIEW_LIMIT);
                    poison.push(LightDlsMessage {
                        id: record.id,
                        message_seq: record.message_seq,
                        message,
                    });
                }
                DlsKind::Schema => {
                    message.size = (message.data.len() + message.headers.len()) as i64;
                    schema.push(LightDlsMessage {
                        id: record.id,
                        message_seq: record.message_seq,
                        message,
                    });
                }
            }
        }
        for list in [&mut poison, &mut schema] {
            list.sort_by(|a, b| b.message.time_sent.cmp(&a.message.time_sent));
            list.truncate(LIGHT_LIST_LIMIT);
        }
        Ok((poison, schema, total))
    }

    // =========================================================================
    // Acks, drops, resend
    // =========================================================================

    /// Drop records by id. Idempotent.
    pub async fn drop_messages(&self, ids: &[i64]) -> Result<u64> {
        Ok(self.db.delete_dls_messages(ids).await?)
    }

    /// Handle a poison-message ack from a consumer SDK: the modern path
    /// drops one group from the record, the legacy path (no `cg_name`)
    /// drops the whole record.
    pub async fn handle_pm_ack(&self, event: &PmAckEvent) -> Result<()> {
        if event.cg_name.is_empty() {
            self.db.delete_dls_messages(&[event.id]).await?;
        } else {
            self.db.remove_cg_from_dls(event.id, &event.cg_name).await?;
        }
        Ok(())
    }

    /// Publish poison records back onto their station. The resend carries
    /// the original payload with `$memphis_producedBy` stamped to the DLS
    /// marker so a repeated failure never re-poisons, and keeps the record
    /// id in `$memphis_pm_id` for correlation.
    pub async fn resend(&self, tenant: &str, ids: &[i64]) -> Result<usize> {
        let mut resent = 0;
        for &id in ids {
            let Some(record) = self.db.get_dls_message(id).await? else {
                continue;
            };
            if record.message_type != DlsKind::Poison {
                continue;
            }
            let Some(station) = self.db.get_station_by_id(record.station_id).await? else {
                continue;
            };
            let station_name = StationName::parse(&station.name)?;

            let mut headers = HeaderMap::from_pairs(
                record
                    .message_details
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            headers.insert(HDR_PRODUCED_BY, DLS_PRODUCER_MARKER);
            headers.remove("producedBy");
            if headers.get(HDR_PM_ID).is_none() {
                headers.insert(HDR_PM_ID, id.to_string());
            }

            let payload = hex::decode(&record.message_details.data)
                .map_err(|e| Error::Invalid(format!("corrupt dls payload: {e}")))?;
            self.substrate
                .publish(
                    tenant,
                    &station_final_subject(station_name.intern()),
                    None,
                    Some(&headers),
                    payload.into(),
                )
                .await?;
            resent += 1;
        }
        Ok(resent)
    }

    // =========================================================================
    // Retention
    // =========================================================================

    /// Delete records whose `updated_at` fell behind the retention window.
    /// Runs from the two-minute sweeper.
    pub async fn sweep_retention(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.current().dls_retention();
        Ok(self.db.delete_dls_older_than(cutoff).await?)
    }
}

/// Headers as persisted on a DLS record: reserved keys stripped, except
/// the pm id which resend correlation needs.
fn storable_headers(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter(|(k, _)| !k.starts_with(crate::constants::RESERVED_HDR_PREFIX) || *k == HDR_PM_ID)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
