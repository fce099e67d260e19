//! Centralized subjects, stream names, and configuration defaults.
//!
//! This module consolidates the wire-level names and magic numbers used
//! throughout the broker core. Having them in one place makes it easier to:
//!
//! - See the full internal wire surface at a glance
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Internal subjects**: request/reply and event subjects on the global
//!   account
//! - **Internal streams**: system streams created once per cluster
//! - **Station defaults**: fallback values applied during validation
//! - **Deadlines**: the fixed timeouts of the jsapi facade and pull loops

use std::time::Duration;

// =============================================================================
// Accounts
// =============================================================================

/// The reserved global account that owns every system stream.
///
/// Tenant accounts reach the global account's service subjects through the
/// export/import rules enumerated in [`crate::broker::tenants`].
pub const GLOBAL_ACCOUNT: &str = "$memphis";

// =============================================================================
// Internal subjects (global account unless noted)
// =============================================================================

/// Request/reply: responds with the set of currently connected connection ids.
pub const CONN_STATUS_SUBJECT: &str = "$memphis_connection_status";

/// Integration create/update events fanned out to every broker.
pub const INTEGRATIONS_UPDATES_SUBJECT: &str = "$memphis_integration_updates";

/// Empty-payload signal: operator configuration changed, re-read and reapply.
pub const CONFIG_RELOAD_SIGNAL_SUBJECT: &str = "$memphis_config_reload_signal";

/// Queue-group subject carrying notification events for dispatch.
pub const NOTIFICATIONS_SUBJECT: &str = "$memphis_notifications";

/// Queue-group subject carrying poison-message acks from consumer SDKs.
pub const PM_ACKS_SUBJECT: &str = "$memphis_pm_acks";

/// Queue-group subject carrying schema-validation failures from producer SDKs.
pub const SCHEMAVERSE_DLS_SUBJECT: &str = "$memphis_schemaverse_dls";

/// Prefix of the substrate advisory published when a consumer exceeds its
/// max-deliveries budget. Full form:
/// `$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES.<stream>.<consumer>`.
pub const MAX_DELIVERIES_ADVISORY_PREFIX: &str = "$JS.EVENT.ADVISORY.CONSUMER.MAX_DELIVERIES";

/// Subject producers of a station subscribe to for schema attach/detach
/// events. The suffix is the station's internal name.
pub fn schema_updates_subject(station_intern: &str) -> String {
    format!("$memphis_schema_updates_{station_intern}")
}

/// The subject native producers publish to and all native consumers filter on.
pub fn station_final_subject(station_intern: &str) -> String {
    format!("{station_intern}.final")
}

// =============================================================================
// Internal streams
// =============================================================================

/// System log stream (subjects `$memphis_syslogs.>`).
pub const SYSLOGS_STREAM: &str = "$memphis_syslogs";

/// Work-queue stream feeding the tiered-storage pipeline.
pub const TIERED_STORAGE_STREAM: &str = "$memphis_tiered_storage";

/// Durable consumer draining [`TIERED_STORAGE_STREAM`].
pub const TIERED_STORAGE_CONSUMER: &str = "$memphis_tiered_storage_consumer";

/// Work-queue stream capturing max-deliveries advisories.
pub const DLS_UNACKED_STREAM: &str = "$memphis_dls_unacked";

/// Durable consumer draining [`DLS_UNACKED_STREAM`].
pub const DLS_UNACKED_CONSUMER: &str = "$memphis_dls_unacked_consumer";

/// Ring-capped stream holding one throughput sample per broker per second.
pub const THROUGHPUT_STREAM: &str = "$memphis-throughput-v1";

/// The pre-v1 throughput stream; deleted on boot when detected.
pub const THROUGHPUT_LEGACY_STREAM: &str = "$memphis-throughput";

/// Per-tenant shared DLS stream, living inside the tenant account.
pub const DLS_STREAM: &str = "$memphis_dls";

/// Subject a broker publishes its own throughput sample to.
pub fn throughput_subject(broker_name: &str) -> String {
    format!("{THROUGHPUT_STREAM}.{broker_name}")
}

// =============================================================================
// Station defaults
// =============================================================================

/// Default retention when a create request leaves it unspecified: one week
/// of message age.
pub const DEFAULT_RETENTION_SECS: i64 = 604_800;

/// Producer-dedup window applied when the request leaves it unspecified.
pub const DEFAULT_IDEMPOTENCY_WINDOW_MS: i64 = 120_000;

/// Floor for the dedup window. Anything lower is clamped up.
pub const MIN_IDEMPOTENCY_WINDOW_MS: i64 = 100;

/// Default ack wait for consumer groups that do not specify one.
pub const DEFAULT_MAX_ACK_TIME_MS: i64 = 30_000;

/// Delivery-attempt budget bounds; outside values are clamped to the max.
pub const MAX_MSG_DELIVERIES: i32 = 10;

/// Upper bound on station replicas in a cluster.
pub const MAX_REPLICAS: i32 = 5;

// =============================================================================
// Windows & retention
// =============================================================================

/// Per-subject cap on the throughput stream. One sample lands per broker per
/// second, so this equals the rolling window (in seconds) the dashboard can
/// render without any explicit trimming.
pub const WS_UPDATES_INTERVAL_SEC: i64 = 30;

/// Dedup window of the tiered-storage work-queue stream.
pub const TIERED_STORAGE_DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Max age of the tiered-storage and dls-unacked work queues. Anything that
/// survives this long was never going to be processed.
pub const INTERNAL_WORK_QUEUE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Ack wait of the dls-unacked consumer. Generous because the handler does a
/// substrate read plus a DB upsert per advisory.
pub const DLS_UNACKED_ACK_WAIT: Duration = Duration::from_secs(80);

/// Cadence of the DLS retention sweeper.
pub const DLS_RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(120);

// =============================================================================
// Deadlines
// =============================================================================

/// Hard timeout of every jsapi request/reply round trip.
pub const JSAPI_TIMEOUT: Duration = Duration::from_secs(40);

/// Per-batch deadline of the tiered-storage pull loop.
pub const TIERED_STORAGE_PULL_DEADLINE: Duration = Duration::from_secs(5);

/// Batch size of the tiered-storage pull loop.
pub const TIERED_STORAGE_PULL_BATCH: usize = 1000;

/// Deadline of the throughput read-side pull.
pub const THROUGHPUT_PULL_DEADLINE: Duration = Duration::from_millis(300);

/// Cadence of the throughput sampler.
pub const THROUGHPUT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Reserved headers
// =============================================================================

/// Connection id stamped by native SDKs on every produced message.
pub const HDR_CONNECTION_ID: &str = "$memphis_connectionId";

/// Producer name stamped by native SDKs on every produced message.
pub const HDR_PRODUCED_BY: &str = "$memphis_producedBy";

/// DLS record id carried by resent poison messages.
pub const HDR_PM_ID: &str = "$memphis_pm_id";

/// Producer-name value marking a DLS resend. Messages carrying it are never
/// re-poisoned.
pub const DLS_PRODUCER_MARKER: &str = "$memphis_dls";

/// Prefix of every reserved header key.
pub const RESERVED_HDR_PREFIX: &str = "$memphis";
