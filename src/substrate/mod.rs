//! The replicated-log substrate contract.
//!
//! The broker core does not implement its own log engine; it assumes a
//! JetStream-equivalent substrate and talks to it through the two traits in
//! this module:
//!
//! - [`Bus`]: per-account core pub/sub (publish, subscribe, queue groups)
//!   plus server introspection (per-account byte counters, connection list)
//! - [`Substrate`]: the stream/consumer/message operations: ordered
//!   per-stream append, range read, message delete, durable consumer
//!   create/delete, filtered pull, stream purge
//!
//! # Available implementations
//!
//! - [`JsApiClient`](jsapi::JsApiClient): implements [`Substrate`] over any
//!   [`Bus`] by speaking the `$JS.API.…` request/reply protocol (production
//!   path; the bus is the embedded server's client API)
//! - [`MemoryBus`](memory::MemoryBus): a fully in-process bus with a
//!   JetStream-style engine behind it, used for embedded/standalone
//!   deployments and as the test substrate
//!
//! Every jsapi request suspends until its reply or a 40 s deadline; no
//! operation blocks indefinitely.

pub mod jsapi;
pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::headers::HeaderMap;

pub use jsapi::JsApiClient;
pub use memory::MemoryBus;

pub type SubstrateResult<T> = std::result::Result<T, SubstrateError>;

// =============================================================================
// Errors
// =============================================================================

/// Typed errors of the log substrate.
///
/// `StreamNotFound` is mapped to `NotFound` on reads and swallowed on
/// deletes by callers (delete is idempotent).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubstrateError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("stream name already in use: {0}")]
    StreamNameExist(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("no message found: stream {stream} seq {seq}")]
    MessageNotFound { stream: String, seq: u64 },

    #[error("cluster has no peers available")]
    ClusterNoPeers,

    #[error("account not found: {0}")]
    AccountNotFound(String),

    /// The jsapi round trip exceeded its hard deadline.
    #[error("jsapi request timeout for request type {kind:?} on {subject:?}")]
    Timeout { kind: String, subject: String },

    /// A typed API error the caller did not special-case.
    #[error("api error {err_code}: {description}")]
    Api {
        code: u16,
        err_code: u16,
        description: String,
    },

    #[error("bad substrate response: {0}")]
    Decode(String),

    #[error("substrate connection closed: {0}")]
    Closed(String),
}

impl SubstrateError {
    /// True when retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SubstrateError::ClusterNoPeers | SubstrateError::Timeout { .. }
        )
    }
}

// Error identifiers of the JetStream API this core special-cases.
pub(crate) const ERR_CODE_STREAM_NOT_FOUND: u16 = 10059;
pub(crate) const ERR_CODE_STREAM_NAME_EXIST: u16 = 10058;
pub(crate) const ERR_CODE_CONSUMER_NOT_FOUND: u16 = 10014;
pub(crate) const ERR_CODE_NO_MESSAGE_FOUND: u16 = 10037;
pub(crate) const ERR_CODE_CLUSTER_NO_PEERS: u16 = 10005;

// =============================================================================
// Stream configuration
// =============================================================================

/// How a stream discards messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Size/age limits only; consumers never delete messages.
    #[default]
    Limits,
    /// Work queue: a message is removed once acked by its consumer.
    WorkQueue,
}

/// Backing storage of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::File => write!(f, "file"),
            StorageKind::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(StorageKind::File),
            "memory" => Ok(StorageKind::Memory),
            other => Err(format!("storage type can be one of the following file/memory, got {other:?}")),
        }
    }
}

/// Full configuration of a substrate stream.
///
/// `-1` on the numeric limits means unlimited, matching the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default = "unlimited")]
    pub max_consumers: i64,
    #[serde(default = "unlimited")]
    pub max_msgs: i64,
    #[serde(default = "unlimited")]
    pub max_bytes: i64,
    /// Zero means no age limit.
    #[serde(with = "serde_nanos", default)]
    pub max_age: Duration,
    #[serde(default = "unlimited")]
    pub max_msgs_per_subject: i64,
    #[serde(default)]
    pub storage: StorageKind,
    #[serde(default = "one")]
    pub replicas: i32,
    /// Producer-dedup window. Zero disables deduplication.
    #[serde(rename = "duplicate_window", with = "serde_nanos", default)]
    pub duplicates: Duration,
    #[serde(default)]
    pub tiered_storage_enabled: bool,
}

fn unlimited() -> i64 {
    -1
}

fn one() -> i32 {
    1
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            retention: RetentionPolicy::Limits,
            max_consumers: -1,
            max_msgs: -1,
            max_bytes: -1,
            max_age: Duration::ZERO,
            max_msgs_per_subject: -1,
            storage: StorageKind::File,
            replicas: 1,
            duplicates: Duration::ZERO,
            tiered_storage_enabled: false,
        }
    }
}

/// Counters of a live stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
}

/// Leader and replica placement of a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClusterInfo {
    pub leader: String,
    #[serde(default)]
    pub replicas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub config: StreamConfig,
    pub state: StreamState,
    #[serde(default)]
    pub cluster: Option<StreamClusterInfo>,
}

// =============================================================================
// Consumer configuration
// =============================================================================

/// Where a newly created consumer starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// Everything retained in the stream.
    All,
    /// Only messages appended after consumer creation.
    #[default]
    New,
    /// From an explicit sequence (`opt_start_seq`).
    ByStartSequence,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    #[default]
    Explicit,
    None,
}

/// Full configuration of a durable (or ephemeral) consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Durable name; `None` creates an ephemeral consumer.
    #[serde(default)]
    pub durable_name: Option<String>,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default)]
    pub opt_start_seq: Option<u64>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(with = "serde_nanos", default)]
    pub ack_wait: Duration,
    #[serde(default = "unlimited")]
    pub max_deliver: i64,
    #[serde(default)]
    pub filter_subject: Option<String>,
    #[serde(default = "unlimited")]
    pub max_ack_pending: i64,
    #[serde(default = "one")]
    pub replicas: i32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            durable_name: None,
            deliver_policy: DeliverPolicy::New,
            opt_start_seq: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: -1,
            filter_subject: None,
            max_ack_pending: -1,
            replicas: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream_name: String,
    pub name: String,
    pub config: ConsumerConfig,
    /// Messages matching the filter the consumer has not been handed yet.
    pub num_pending: u64,
    /// Delivered but not yet acked.
    pub num_ack_pending: u64,
}

// =============================================================================
// Messages
// =============================================================================

/// A message read back from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMsg {
    pub subject: String,
    pub sequence: u64,
    /// Raw encoded header block; empty when the message carried none.
    pub headers: Bytes,
    pub data: Bytes,
    pub time: DateTime<Utc>,
}

/// A message delivered by a pull request, carrying the reply subject acking
/// it. Ack only after the associated work durably succeeded; unacked
/// messages redeliver after the consumer's ack wait.
#[derive(Debug, Clone, PartialEq)]
pub struct PulledMsg {
    pub msg: StoredMsg,
    pub reply_subject: String,
    pub deliveries: u64,
}

/// The advisory the substrate emits when a consumer exceeds its
/// max-deliveries budget for a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxDeliveriesAdvisory {
    pub stream: String,
    pub consumer: String,
    pub stream_seq: u64,
    pub deliveries: u64,
    /// Account (tenant) the stream lives in. Empty on pre-multi-tenant
    /// substrates; callers fall back to the global account.
    #[serde(default)]
    pub account: String,
}

// =============================================================================
// Bus
// =============================================================================

/// An inbound core message.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    /// Raw encoded header block; empty when none.
    pub headers: Bytes,
    pub payload: Bytes,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    canceler: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::UnboundedReceiver<BusMessage>,
        canceler: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            canceler: Some(Box::new(canceler)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Receive the next message; `None` once the bus side closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.canceler.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Per-account in/out byte counters of one broker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// account name → (bytes written into the server, bytes read out of it)
    pub accounts: HashMap<String, AccountIo>,
    /// Storage budget of this node's log engine, in bytes. Zero when the
    /// substrate does not report one.
    pub max_store: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountIo {
    pub in_bytes: u64,
    pub out_bytes: u64,
}

/// A live client connection as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection name; native SDKs prefix it with `<connection-id>::`.
    pub name: String,
    pub client_address: String,
}

impl ConnectionInfo {
    /// The connection id token, when present.
    pub fn connection_id(&self) -> Option<&str> {
        match self.name.split_once("::") {
            Some((id, _)) if !id.is_empty() => Some(id),
            None if !self.name.is_empty() => Some(&self.name),
            _ => None,
        }
    }
}

/// Core pub/sub plus server introspection, scoped per account.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Publish a message into an account's subject space.
    async fn publish(
        &self,
        account: &str,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: Bytes,
    ) -> SubstrateResult<()>;

    /// Subscribe within an account. Members of the same queue group share
    /// the subscription: each message goes to exactly one member.
    async fn subscribe(
        &self,
        account: &str,
        subject: &str,
        queue_group: Option<&str>,
    ) -> SubstrateResult<Subscription>;

    async fn server_stats(&self) -> SubstrateResult<ServerStats>;

    async fn connections(&self) -> SubstrateResult<Vec<ConnectionInfo>>;

    /// Whether the substrate runs with cluster peers (affects replica
    /// counts of internal streams).
    fn is_clustered(&self) -> bool;
}

// =============================================================================
// Substrate
// =============================================================================

/// Every operation the broker core needs from the replicated log, scoped
/// by tenant account.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    async fn create_stream(&self, tenant: &str, config: &StreamConfig) -> SubstrateResult<()>;
    async fn update_stream(&self, tenant: &str, config: &StreamConfig) -> SubstrateResult<()>;
    async fn delete_stream(&self, tenant: &str, stream: &str) -> SubstrateResult<()>;
    async fn stream_info(&self, tenant: &str, stream: &str) -> SubstrateResult<StreamInfo>;
    async fn list_streams(&self, tenant: &str) -> SubstrateResult<Vec<StreamInfo>>;
    async fn purge_stream(&self, tenant: &str, stream: &str) -> SubstrateResult<()>;

    /// Drop every stream and consumer the account owns.
    async fn purge_account(&self, tenant: &str) -> SubstrateResult<()>;

    async fn get_message(&self, tenant: &str, stream: &str, seq: u64)
        -> SubstrateResult<StoredMsg>;
    async fn delete_message(&self, tenant: &str, stream: &str, seq: u64) -> SubstrateResult<()>;

    async fn create_consumer(
        &self,
        tenant: &str,
        stream: &str,
        config: &ConsumerConfig,
    ) -> SubstrateResult<()>;
    async fn delete_consumer(&self, tenant: &str, stream: &str, name: &str)
        -> SubstrateResult<()>;
    async fn consumer_info(
        &self,
        tenant: &str,
        stream: &str,
        name: &str,
    ) -> SubstrateResult<ConsumerInfo>;

    /// Pull up to `batch` deliverable messages, waiting at most `deadline`.
    /// Returning fewer than `batch` is normal.
    async fn pull_next(
        &self,
        tenant: &str,
        stream: &str,
        durable: &str,
        batch: usize,
        deadline: Duration,
    ) -> SubstrateResult<Vec<PulledMsg>>;

    /// Ack a pulled message through its reply subject.
    async fn ack(&self, tenant: &str, reply_subject: &str) -> SubstrateResult<()>;

    /// Core-bus passthroughs, so components depend on one handle.
    async fn publish(
        &self,
        tenant: &str,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: Bytes,
    ) -> SubstrateResult<()>;

    async fn subscribe(
        &self,
        tenant: &str,
        subject: &str,
        queue_group: Option<&str>,
    ) -> SubstrateResult<Subscription>;

    async fn server_stats(&self) -> SubstrateResult<ServerStats>;
    async fn connections(&self) -> SubstrateResult<Vec<ConnectionInfo>>;
    fn is_clustered(&self) -> bool;
}

// =============================================================================
// Subject matching
// =============================================================================

/// Subject-pattern match with `*` (one token) and `>` (rest) wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// =============================================================================
// Duration <-> nanoseconds (wire representation)
// =============================================================================

pub(crate) mod serde_nanos {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_wildcards() {
        assert!(subject_matches("orders.>", "orders.final"));
        assert!(subject_matches("orders.>", "orders.a.b.c"));
        assert!(!subject_matches("orders.>", "orders"));
        assert!(subject_matches("orders.*", "orders.final"));
        assert!(!subject_matches("orders.*", "orders.a.b"));
        assert!(subject_matches("orders.final", "orders.final"));
        assert!(!subject_matches("orders.final", "orders.other"));
        assert!(subject_matches(">", "anything.at.all"));
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.d"));
    }

    #[test]
    fn stream_config_wire_round_trip() {
        let config = StreamConfig {
            name: "orders".into(),
            subjects: vec!["orders.>".into()],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(60),
            duplicates: Duration::from_millis(120_000),
            replicas: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"workqueue\""));
        assert!(json.contains("\"duplicate_window\""));
        let back: StreamConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn consumer_config_defaults() {
        let config: ConsumerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.deliver_policy, DeliverPolicy::New);
        assert_eq!(config.max_deliver, -1);
        assert_eq!(config.max_ack_pending, -1);
    }

    #[test]
    fn advisory_decodes_without_account() {
        let adv: MaxDeliveriesAdvisory = serde_json::from_str(
            r#"{"stream":"orders","consumer":"g1","stream_seq":2,"deliveries":10}"#,
        )
        .unwrap();
        assert_eq!(adv.account, "");
        assert_eq!(adv.stream_seq, 2);
    }

    #[test]
    fn connection_id_extraction() {
        let conn = ConnectionInfo {
            name: "conn-123::producer-a".into(),
            client_address: "10.0.0.1:4222".into(),
        };
        assert_eq!(conn.connection_id(), Some("conn-123"));

        let bare = ConnectionInfo {
            name: "plain-name".into(),
            client_address: String::new(),
        };
        assert_eq!(bare.connection_id(), Some("plain-name"));

        let empty = ConnectionInfo {
            name: "::x".into(),
            client_address: String::new(),
        };
        assert_eq!(empty.connection_id(), None);
    }

    #[test]
    fn retriable_errors() {
        assert!(SubstrateError::ClusterNoPeers.is_retriable());
        assert!(!SubstrateError::StreamNotFound("x".into()).is_retriable());
    }
}
