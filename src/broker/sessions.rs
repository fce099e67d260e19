//! Producer and consumer sessions.
//!
//! Producers are tracked for observability only; they never back-pressure
//! the core. A registration is keyed on (station, name, connection): a
//! disconnect flips `active` off for the connection's producers and a
//! reconnect flips it back.
//!
//! Consumer groups are the real abstraction on the read side: each group
//! materializes as exactly one durable substrate consumer filtered on
//! `<station-internal>.final`, and name collisions within a station share
//! that consumer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::{
    schema_updates_subject, station_final_subject, DEFAULT_MAX_ACK_TIME_MS, MAX_MSG_DELIVERIES,
};
use crate::error::Result;
use crate::metadata::{CgMember, Consumer, MetadataDb, NewConsumer, NewProducer, Producer, Station};
use crate::substrate::{
    AckPolicy, ConsumerConfig, DeliverPolicy, Substrate, SubstrateError,
};
use crate::validation::{replace_delimiters, validate_name};

use super::station::StationName;

/// Schema lifecycle event pushed to a station's producers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "update_type", rename_all = "snake_case")]
pub enum SchemaUpdate {
    /// A schema was attached (or its active version changed).
    Init {
        schema_name: String,
        version_number: i32,
    },
    /// The schema was detached.
    Drop,
}

// =============================================================================
// Producers
// =============================================================================

pub struct ProducerSessions {
    db: Arc<dyn MetadataDb>,
    substrate: Arc<dyn Substrate>,
}

impl ProducerSessions {
    pub fn new(db: Arc<dyn MetadataDb>, substrate: Arc<dyn Substrate>) -> Self {
        Self { db, substrate }
    }

    /// Register (or re-activate) a producer on a station.
    pub async fn register(
        &self,
        tenant: &str,
        station: &Station,
        name: &str,
        connection_id: &str,
        client_address: &str,
        created_by_username: &str,
    ) -> Result<Producer> {
        let name = name.to_lowercase();
        validate_name(&name, "Producer")?;
        let producer = self
            .db
            .upsert_producer(NewProducer {
                station_id: station.id,
                name: name.clone(),
                connection_id: connection_id.to_string(),
                client_address: client_address.to_string(),
                created_by_username: created_by_username.to_string(),
            })
            .await?;
        info!(
            "[tenant: {tenant}]create_producer: Producer {name} has been created on station {}",
            station.name
        );
        Ok(producer)
    }

    /// A client connection dropped: its producers go inactive.
    pub async fn handle_disconnect(&self, connection_id: &str) -> Result<u64> {
        Ok(self
            .db
            .set_producers_active_by_connection(connection_id, false)
            .await?)
    }

    /// The same connection came back: its producers go active again.
    pub async fn handle_reconnect(&self, connection_id: &str) -> Result<u64> {
        Ok(self
            .db
            .set_producers_active_by_connection(connection_id, true)
            .await?)
    }

    /// Push a schema update onto the tenant-internal subject the station's
    /// producers subscribe to.
    pub async fn publish_schema_update(
        &self,
        tenant: &str,
        station_intern: &str,
        update: &SchemaUpdate,
    ) -> Result<()> {
        let payload = serde_json::to_vec(update).expect("schema update serializes");
        self.substrate
            .publish(
                tenant,
                &schema_updates_subject(station_intern),
                None,
                None,
                payload.into(),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Consumers
// =============================================================================

/// Parameters of a consumer-group create.
#[derive(Debug, Clone)]
pub struct CreateConsumerRequest {
    pub name: String,
    /// Empty means a group of one named after the consumer.
    pub consumers_group: String,
    pub connection_id: String,
    pub client_address: String,
    pub created_by_username: String,
    /// Non-positive means default (30 000 ms).
    pub max_ack_time_ms: i64,
    /// Clamped into `1..=10`; non-positive means the max.
    pub max_msg_deliveries: i32,
    pub start_consume_from_seq: i64,
    /// `-1` replays everything; positive replays that many tail messages.
    pub last_messages: i64,
}

impl Default for CreateConsumerRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            consumers_group: String::new(),
            connection_id: String::new(),
            client_address: String::new(),
            created_by_username: String::new(),
            max_ack_time_ms: 0,
            max_msg_deliveries: 0,
            start_consume_from_seq: 0,
            last_messages: 0,
        }
    }
}

/// Where a new group starts reading, from the four positioning rules
/// evaluated in order.
fn start_position(
    last_messages: i64,
    start_consume_from_seq: i64,
    last_seq: u64,
) -> (DeliverPolicy, Option<u64>) {
    if last_messages == 0 && start_consume_from_seq == 0 {
        (DeliverPolicy::New, None)
    } else if last_messages > 0 {
        let start = last_seq
            .saturating_sub(last_messages as u64)
            .saturating_add(1)
            .max(1);
        (DeliverPolicy::ByStartSequence, Some(start))
    } else if start_consume_from_seq == 1 || last_messages == -1 {
        (DeliverPolicy::All, None)
    } else if start_consume_from_seq > 1 {
        (DeliverPolicy::ByStartSequence, Some(start_consume_from_seq as u64))
    } else {
        (DeliverPolicy::All, None)
    }
}

/// The `(is_active, is_deleted)` status of a consumer group: active when
/// any member is, deleted only when every member is.
pub fn cg_status(members: &[CgMember]) -> (bool, bool) {
    let mut deleted = 0;
    for member in members {
        if member.is_active {
            return (true, false);
        }
        if member.is_deleted {
            deleted += 1;
        }
    }
    if !members.is_empty() && deleted == members.len() {
        (false, true)
    } else {
        (false, false)
    }
}

pub struct ConsumerSessions {
    db: Arc<dyn MetadataDb>,
    substrate: Arc<dyn Substrate>,
}

impl ConsumerSessions {
    pub fn new(db: Arc<dyn MetadataDb>, substrate: Arc<dyn Substrate>) -> Self {
        Self { db, substrate }
    }

    /// Materialize a consumer-group member. The first member of a group
    /// creates the durable; later members share it.
    pub async fn create(
        &self,
        tenant: &str,
        station: &Station,
        request: CreateConsumerRequest,
    ) -> Result<Consumer> {
        let name = request.name.to_lowercase();
        validate_name(&name, "Consumer")?;
        let group = if request.consumers_group.is_empty() {
            name.clone()
        } else {
            let group = request.consumers_group.to_lowercase();
            validate_name(&group, "Consumers group")?;
            group
        };

        let max_ack_time_ms = if request.max_ack_time_ms <= 0 {
            DEFAULT_MAX_ACK_TIME_MS
        } else {
            request.max_ack_time_ms
        };
        let max_msg_deliveries =
            if request.max_msg_deliveries <= 0 || request.max_msg_deliveries > MAX_MSG_DELIVERIES {
                MAX_MSG_DELIVERIES
            } else {
                request.max_msg_deliveries
            };

        let station_name = StationName::parse(&station.name)?;
        self.materialize(
            tenant,
            &station_name,
            &group,
            max_ack_time_ms,
            max_msg_deliveries,
            request.start_consume_from_seq,
            request.last_messages,
        )
        .await?;

        let consumer = self
            .db
            .insert_consumer(NewConsumer {
                station_id: station.id,
                name,
                consumers_group: group,
                connection_id: request.connection_id,
                client_address: request.client_address,
                created_by_username: request.created_by_username,
                max_ack_time_ms,
                max_msg_deliveries,
                start_consume_from_seq: request.start_consume_from_seq,
                last_messages: request.last_messages,
            })
            .await?;
        Ok(consumer)
    }

    /// Create (or re-create) the durable for a group with the given
    /// parameters.
    async fn materialize(
        &self,
        tenant: &str,
        station_name: &StationName,
        group: &str,
        max_ack_time_ms: i64,
        max_msg_deliveries: i32,
        start_consume_from_seq: i64,
        last_messages: i64,
    ) -> Result<()> {
        let (deliver_policy, opt_start_seq) = if last_messages > 0 {
            let info = self
                .substrate
                .stream_info(tenant, station_name.intern())
                .await?;
            start_position(last_messages, start_consume_from_seq, info.state.last_seq)
        } else {
            start_position(last_messages, start_consume_from_seq, 0)
        };

        let config = ConsumerConfig {
            durable_name: Some(replace_delimiters(group)),
            deliver_policy,
            opt_start_seq,
            ack_policy: AckPolicy::Explicit,
            ack_wait: std::time::Duration::from_millis(max_ack_time_ms as u64),
            max_deliver: max_msg_deliveries as i64,
            filter_subject: Some(station_final_subject(station_name.intern())),
            max_ack_pending: -1,
            ..Default::default()
        };
        self.substrate
            .create_consumer(tenant, station_name.intern(), &config)
            .await?;
        Ok(())
    }

    /// Remove a consumer group. Idempotent: an absent durable or an
    /// already-deleted group is a success.
    pub async fn destroy(&self, tenant: &str, station: &Station, group: &str) -> Result<()> {
        let station_name = StationName::parse(&station.name)?;
        let durable = replace_delimiters(&group.to_lowercase());
        match self
            .substrate
            .delete_consumer(tenant, station_name.intern(), &durable)
            .await
        {
            Ok(()) | Err(SubstrateError::ConsumerNotFound(_)) => {}
            Err(SubstrateError::StreamNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.db
            .delete_consumer_group(station.id, &group.to_lowercase())
            .await?;
        Ok(())
    }

    pub async fn group_members(&self, station_id: i64, group: &str) -> Result<Vec<CgMember>> {
        Ok(self.db.list_cg_members(station_id, group).await?)
    }

    /// Re-create every durable of a station's recorded groups against the
    /// substrate (resource mover).
    pub async fn restore_station_consumers(
        &self,
        tenant: &str,
        station: &Station,
    ) -> Result<usize> {
        let station_name = StationName::parse(&station.name)?;
        let groups = self.db.list_station_consumer_groups(station.id).await?;
        let mut restored = 0;
        for group in groups {
            let members = self.db.list_cg_members(station.id, &group).await?;
            // Members share delivery parameters by construction.
            let Some(first) = members.first() else { continue };
            self.materialize(
                tenant,
                &station_name,
                &group,
                first.max_ack_time_ms,
                first.max_msg_deliveries,
                0,
                -1,
            )
            .await?;
            restored += 1;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_position_rules_in_order() {
        // Rule 1: nothing requested, deliver new.
        assert_eq!(start_position(0, 0, 100), (DeliverPolicy::New, None));

        // Rule 2: last K messages wins over start_from_seq.
        assert_eq!(
            start_position(10, 5, 100),
            (DeliverPolicy::ByStartSequence, Some(91))
        );
        // Fewer messages in the stream than requested: clamp to 1.
        assert_eq!(
            start_position(10, 0, 4),
            (DeliverPolicy::ByStartSequence, Some(1))
        );

        // Rule 3: full replay.
        assert_eq!(start_position(-1, 0, 100), (DeliverPolicy::All, None));
        assert_eq!(start_position(0, 1, 100), (DeliverPolicy::All, None));

        // Rule 4: explicit start sequence.
        assert_eq!(
            start_position(0, 42, 100),
            (DeliverPolicy::ByStartSequence, Some(42))
        );
    }

    #[test]
    fn cg_status_rule() {
        let member = |active: bool, deleted: bool| CgMember {
            name: "c".into(),
            client_address: String::new(),
            is_active: active,
            is_deleted: deleted,
            max_ack_time_ms: 30_000,
            max_msg_deliveries: 10,
            created_by_username: String::new(),
        };

        // Any active member makes the group active.
        assert_eq!(
            cg_status(&[member(false, true), member(true, false)]),
            (true, false)
        );
        // All deleted makes the group deleted.
        assert_eq!(
            cg_status(&[member(false, true), member(false, true)]),
            (false, true)
        );
        // Mixed inactive: neither.
        assert_eq!(
            cg_status(&[member(false, false), member(false, true)]),
            (false, false)
        );
        assert_eq!(cg_status(&[]), (false, false));
    }

    #[test]
    fn schema_update_wire_shape() {
        let init = SchemaUpdate::Init {
            schema_name: "invoice".into(),
            version_number: 3,
        };
        let json = serde_json::to_string(&init).unwrap();
        assert!(json.contains("\"update_type\":\"init\""));
        let back: SchemaUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, init);

        let drop_json = serde_json::to_string(&SchemaUpdate::Drop).unwrap();
        assert!(drop_json.contains("\"drop\""));
    }
}
