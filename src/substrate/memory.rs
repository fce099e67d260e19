//! In-process substrate.
//!
//! `MemoryBus` is a complete single-process implementation of the [`Bus`]
//! contract with a JetStream-style engine behind it: ordered streams with
//! limits/work-queue retention, per-subject ring caps, durable consumers
//! with ack-wait redelivery and max-deliveries advisories, and the
//! `$JS.API.…` request/reply surface the [`JsApiClient`](super::JsApiClient)
//! speaks.
//!
//! It backs embedded/standalone deployments where no external cluster is
//! available, and it is the substrate every test suite runs against. The
//! engine is deliberately lazy: limits and redelivery timers are evaluated
//! on the operations that observe them (publish, pull, info), so the bus
//! spawns no background tasks of its own and cooperates with paused-time
//! tests.
//!
//! # Account isolation
//!
//! Each account has its own subject space and stream set. A configurable
//! export list mirrors matching publishes into the global account, which is
//! how tenant-side advisories and service requests reach the system streams
//! that live there.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    subject_matches, AccountIo, Bus, BusMessage, ConnectionInfo, ConsumerConfig, DeliverPolicy,
    MaxDeliveriesAdvisory, RetentionPolicy, ServerStats, StreamClusterInfo, StreamConfig,
    StreamInfo, StreamState, Subscription, SubstrateResult, ERR_CODE_CONSUMER_NOT_FOUND,
    ERR_CODE_NO_MESSAGE_FOUND, ERR_CODE_STREAM_NAME_EXIST, ERR_CODE_STREAM_NOT_FOUND,
};
use crate::constants::{
    CONFIG_RELOAD_SIGNAL_SUBJECT, CONN_STATUS_SUBJECT, INTEGRATIONS_UPDATES_SUBJECT,
    MAX_DELIVERIES_ADVISORY_PREFIX, NOTIFICATIONS_SUBJECT, PM_ACKS_SUBJECT,
    SCHEMAVERSE_DLS_SUBJECT,
};
use crate::constants::GLOBAL_ACCOUNT;
use crate::headers::HeaderMap;

const DEFAULT_ACK_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

/// Subjects mirrored from tenant accounts into the global account by
/// default. Mirrors the service-export set of the account boundary.
fn default_exports() -> Vec<String> {
    vec![
        format!("{MAX_DELIVERIES_ADVISORY_PREFIX}.>"),
        NOTIFICATIONS_SUBJECT.to_string(),
        PM_ACKS_SUBJECT.to_string(),
        SCHEMAVERSE_DLS_SUBJECT.to_string(),
        INTEGRATIONS_UPDATES_SUBJECT.to_string(),
        CONN_STATUS_SUBJECT.to_string(),
        CONFIG_RELOAD_SIGNAL_SUBJECT.to_string(),
    ]
}

// =============================================================================
// Engine state
// =============================================================================

struct RawStored {
    subject: String,
    headers: Bytes,
    data: Bytes,
    time: DateTime<Utc>,
    /// Monotonic arrival instant, used for max-age enforcement.
    arrived: Instant,
}

struct PendingDelivery {
    deliveries: u64,
    redeliver_at: Instant,
}

struct JsConsumer {
    config: ConsumerConfig,
    /// Next stream sequence to hand out as a first delivery.
    cursor: u64,
    pending: BTreeMap<u64, PendingDelivery>,
    /// Sequences whose delivery budget is spent; the advisory fired once.
    exhausted: BTreeSet<u64>,
}

struct JsStream {
    config: StreamConfig,
    msgs: BTreeMap<u64, RawStored>,
    next_seq: u64,
    consumers: HashMap<String, JsConsumer>,
}

impl JsStream {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            msgs: BTreeMap::new(),
            next_seq: 1,
            consumers: HashMap::new(),
        }
    }

    fn first_seq(&self) -> u64 {
        self.msgs.keys().next().copied().unwrap_or(self.next_seq)
    }

    fn state(&self) -> StreamState {
        StreamState {
            msgs: self.msgs.len() as u64,
            bytes: self
                .msgs
                .values()
                .map(|m| (m.data.len() + m.headers.len()) as u64)
                .sum(),
            first_seq: self.first_seq(),
            last_seq: self.next_seq.saturating_sub(1),
        }
    }

    fn append(&mut self, subject: &str, headers: Bytes, data: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.msgs.insert(
            seq,
            RawStored {
                subject: subject.to_string(),
                headers,
                data,
                time: Utc::now(),
                arrived: Instant::now(),
            },
        );
        self.enforce_limits();
        seq
    }

    fn enforce_limits(&mut self) {
        if self.config.max_age > std::time::Duration::ZERO {
            let now = Instant::now();
            let max_age = self.config.max_age;
            self.msgs
                .retain(|_, m| now.duration_since(m.arrived) < max_age);
        }
        if self.config.max_msgs > 0 {
            while self.msgs.len() as i64 > self.config.max_msgs {
                let oldest = *self.msgs.keys().next().expect("non-empty");
                self.msgs.remove(&oldest);
            }
        }
        if self.config.max_msgs_per_subject > 0 {
            let cap = self.config.max_msgs_per_subject as usize;
            let mut per_subject: HashMap<String, Vec<u64>> = HashMap::new();
            for (seq, m) in &self.msgs {
                per_subject.entry(m.subject.clone()).or_default().push(*seq);
            }
            for seqs in per_subject.values() {
                if seqs.len() > cap {
                    for seq in &seqs[..seqs.len() - cap] {
                        self.msgs.remove(seq);
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct Account {
    subs: Vec<SubEntry>,
    streams: HashMap<String, JsStream>,
    io: AccountIo,
}

struct SubEntry {
    id: u64,
    pattern: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// One message to put on the wire after the engine lock is released.
struct Outgoing {
    account: String,
    subject: String,
    reply: Option<String>,
    headers: Bytes,
    payload: Bytes,
    /// Subject presented to receivers when it differs from the routing
    /// subject (pull deliveries route to the inbox but keep the message's
    /// original subject).
    shown_subject: Option<String>,
}

impl Outgoing {
    fn new(
        account: impl Into<String>,
        subject: impl Into<String>,
        reply: Option<String>,
        headers: Bytes,
        payload: Bytes,
    ) -> Self {
        Self {
            account: account.into(),
            subject: subject.into(),
            reply,
            headers,
            payload,
            shown_subject: None,
        }
    }
}

struct Inner {
    accounts: Mutex<HashMap<String, Account>>,
    exports: Vec<String>,
    clustered: AtomicBool,
    connections: Mutex<Vec<ConnectionInfo>>,
    sub_counter: AtomicU64,
    rotor: AtomicU64,
    max_store: AtomicU64,
}

/// The in-process bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_exports(default_exports())
    }

    /// Build with an explicit export set (subject patterns mirrored into
    /// the global account).
    pub fn with_exports(exports: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                accounts: Mutex::new(HashMap::new()),
                exports,
                clustered: AtomicBool::new(false),
                connections: Mutex::new(Vec::new()),
                sub_counter: AtomicU64::new(1),
                rotor: AtomicU64::new(0),
                max_store: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_clustered(&self, clustered: bool) {
        self.inner.clustered.store(clustered, Ordering::SeqCst);
    }

    pub fn set_max_store(&self, max_store: u64) {
        self.inner.max_store.store(max_store, Ordering::SeqCst);
    }

    /// Register a live client connection (test/embedded hook; a real server
    /// tracks these itself).
    pub fn register_connection(&self, name: impl Into<String>, client_address: impl Into<String>) {
        self.inner.connections.lock().unwrap().push(ConnectionInfo {
            name: name.into(),
            client_address: client_address.into(),
        });
    }

    pub fn remove_connection(&self, name: &str) {
        self.inner
            .connections
            .lock()
            .unwrap()
            .retain(|c| c.name != name);
    }

    /// Credit account traffic counters directly (test/embedded hook for
    /// throughput sampling; a real server meters its own sockets).
    pub fn record_io(&self, account: &str, in_bytes: u64, out_bytes: u64) {
        let mut accounts = self.inner.accounts.lock().unwrap();
        let acc = accounts.entry(account.to_string()).or_default();
        acc.io.in_bytes += in_bytes;
        acc.io.out_bytes += out_bytes;
    }

    // =========================================================================
    // Publish pipeline
    // =========================================================================

    fn do_publish(
        &self,
        account: &str,
        subject: &str,
        reply: Option<&str>,
        headers: Bytes,
        payload: Bytes,
    ) {
        let mut worklist = VecDeque::new();
        worklist.push_back(Outgoing::new(
            account,
            subject,
            reply.map(str::to_string),
            headers,
            payload,
        ));

        // Engine handlers and export mirroring enqueue follow-up publishes;
        // drain iteratively so nothing recurses into the lock.
        while let Some(out) = worklist.pop_front() {
            let deliveries = {
                let mut accounts = self.inner.accounts.lock().unwrap();
                self.route_locked(&mut accounts, out, &mut worklist)
            };
            for (tx, msg) in deliveries {
                // A closed receiver just means the subscriber went away.
                let _ = tx.send(msg);
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn route_locked(
        &self,
        accounts: &mut HashMap<String, Account>,
        out: Outgoing,
        worklist: &mut VecDeque<Outgoing>,
    ) -> Vec<(mpsc::UnboundedSender<BusMessage>, BusMessage)> {
        let mut deliveries = {
            let account = accounts.entry(out.account.clone()).or_default();
            account.io.in_bytes += (out.payload.len() + out.headers.len()) as u64;

            if let Some(rest) = out.subject.strip_prefix("$JS.API.") {
                let rest = rest.to_string();
                self.handle_api(account, &out, &rest, worklist);
                return Vec::new();
            }
            if out.subject.starts_with("$JS.ACK.") {
                handle_ack(account, &out.subject);
                return Vec::new();
            }

            let deliveries = self.deliver_locked(account, &out);
            // Stream capture within the publishing account.
            for stream in account.streams.values_mut() {
                if stream
                    .config
                    .subjects
                    .iter()
                    .any(|p| subject_matches(p, &out.subject))
                {
                    stream.append(&out.subject, out.headers.clone(), out.payload.clone());
                }
            }
            deliveries
        };

        // Export mirroring into the global account.
        if out.account != GLOBAL_ACCOUNT
            && self
                .inner
                .exports
                .iter()
                .any(|p| subject_matches(p, &out.subject))
        {
            let global = accounts.entry(GLOBAL_ACCOUNT.to_string()).or_default();
            deliveries.extend(self.deliver_locked(global, &out));
            for stream in global.streams.values_mut() {
                if stream
                    .config
                    .subjects
                    .iter()
                    .any(|p| subject_matches(p, &out.subject))
                {
                    stream.append(&out.subject, out.headers.clone(), out.payload.clone());
                }
            }
        }

        deliveries
    }

    fn deliver_locked(
        &self,
        account: &mut Account,
        out: &Outgoing,
    ) -> Vec<(mpsc::UnboundedSender<BusMessage>, BusMessage)> {
        let msg = BusMessage {
            subject: out
                .shown_subject
                .clone()
                .unwrap_or_else(|| out.subject.clone()),
            reply: out.reply.clone(),
            headers: out.headers.clone(),
            payload: out.payload.clone(),
        };

        let mut deliveries = Vec::new();
        let mut queue_groups: HashMap<&str, Vec<&SubEntry>> = HashMap::new();
        for entry in &account.subs {
            if !subject_matches(&entry.pattern, &out.subject) {
                continue;
            }
            match &entry.queue {
                Some(group) => queue_groups.entry(group.as_str()).or_default().push(entry),
                None => deliveries.push((entry.tx.clone(), msg.clone())),
            }
        }
        for members in queue_groups.values() {
            let pick = self.inner.rotor.fetch_add(1, Ordering::Relaxed) as usize % members.len();
            deliveries.push((members[pick].tx.clone(), msg.clone()));
        }
        account.io.out_bytes += deliveries.len() as u64 * (msg.payload.len() + msg.headers.len()) as u64;
        deliveries
    }

    // =========================================================================
    // $JS.API handlers
    // =========================================================================

    fn handle_api(
        &self,
        account: &mut Account,
        out: &Outgoing,
        rest: &str,
        worklist: &mut VecDeque<Outgoing>,
    ) {
        let reply = match &out.reply {
            Some(r) => r.clone(),
            None => return,
        };
        let account_name = out.account.clone();

        let response: serde_json::Value = if let Some(name) = rest.strip_prefix("STREAM.CREATE.") {
            api_stream_create(account, name, &out.payload)
        } else if let Some(name) = rest.strip_prefix("STREAM.UPDATE.") {
            api_stream_update(account, name, &out.payload)
        } else if let Some(name) = rest.strip_prefix("STREAM.MSG.GET.") {
            api_msg_get(account, name, &out.payload)
        } else if let Some(name) = rest.strip_prefix("STREAM.MSG.DELETE.") {
            api_msg_delete(account, name, &out.payload)
        } else if let Some(name) = rest.strip_prefix("STREAM.DELETE.") {
            api_stream_delete(account, name)
        } else if let Some(name) = rest.strip_prefix("STREAM.INFO.") {
            api_stream_info(account, name)
        } else if let Some(name) = rest.strip_prefix("STREAM.PURGE.") {
            api_stream_purge(account, name)
        } else if rest == "STREAM.LIST" {
            api_stream_list(account)
        } else if let Some(names) = rest.strip_prefix("CONSUMER.DURABLE.CREATE.") {
            api_consumer_create(account, names, &out.payload)
        } else if let Some(stream) = rest.strip_prefix("CONSUMER.CREATE.") {
            api_consumer_create_ephemeral(account, stream, &out.payload)
        } else if let Some(names) = rest.strip_prefix("CONSUMER.DELETE.") {
            api_consumer_delete(account, names)
        } else if let Some(names) = rest.strip_prefix("CONSUMER.INFO.") {
            api_consumer_info(account, names)
        } else if let Some(names) = rest.strip_prefix("CONSUMER.MSG.NEXT.") {
            // Pull requests answer with message deliveries, not one reply.
            api_pull_next(account, &account_name, names, &out.payload, &reply, worklist);
            return;
        } else if rest.starts_with("ACCOUNT.PURGE.") {
            account.streams.clear();
            json!({ "success": true })
        } else {
            api_error(400, 0, &format!("unknown api subject: {rest}"))
        };

        worklist.push_back(Outgoing::new(
            account_name,
            reply,
            None,
            Bytes::new(),
            Bytes::from(response.to_string()),
        ));
    }
}

fn api_error(code: u16, err_code: u16, description: &str) -> serde_json::Value {
    json!({ "error": { "code": code, "err_code": err_code, "description": description } })
}

fn stream_not_found(name: &str) -> serde_json::Value {
    api_error(404, ERR_CODE_STREAM_NOT_FOUND, &format!("stream not found: {name}"))
}

fn api_stream_create(account: &mut Account, name: &str, payload: &Bytes) -> serde_json::Value {
    let config: StreamConfig = match serde_json::from_slice(payload) {
        Ok(c) => c,
        Err(e) => return api_error(400, 0, &format!("invalid stream config: {e}")),
    };
    if config.name != name {
        return api_error(400, 0, "stream name in subject does not match config");
    }
    if account.streams.contains_key(name) {
        return api_error(
            400,
            ERR_CODE_STREAM_NAME_EXIST,
            &format!("stream name already in use: {name}"),
        );
    }
    account.streams.insert(name.to_string(), JsStream::new(config));
    json!({ "did_create": true })
}

fn api_stream_update(account: &mut Account, name: &str, payload: &Bytes) -> serde_json::Value {
    let config: StreamConfig = match serde_json::from_slice(payload) {
        Ok(c) => c,
        Err(e) => return api_error(400, 0, &format!("invalid stream config: {e}")),
    };
    match account.streams.get_mut(name) {
        Some(stream) => {
            stream.config = config;
            stream.enforce_limits();
            json!({ "success": true })
        }
        None => stream_not_found(name),
    }
}

fn api_stream_delete(account: &mut Account, name: &str) -> serde_json::Value {
    match account.streams.remove(name) {
        Some(_) => json!({ "success": true }),
        None => stream_not_found(name),
    }
}

fn api_stream_purge(account: &mut Account, name: &str) -> serde_json::Value {
    match account.streams.get_mut(name) {
        Some(stream) => {
            let purged = stream.msgs.len();
            stream.msgs.clear();
            json!({ "success": true, "purged": purged })
        }
        None => stream_not_found(name),
    }
}

fn api_stream_info(account: &mut Account, name: &str) -> serde_json::Value {
    match account.streams.get_mut(name) {
        Some(stream) => {
            stream.enforce_limits();
            let info = StreamInfo {
                config: stream.config.clone(),
                state: stream.state(),
                cluster: Some(StreamClusterInfo {
                    leader: "broker-0".to_string(),
                    replicas: Vec::new(),
                }),
            };
            serde_json::to_value(info).expect("stream info serializes")
        }
        None => stream_not_found(name),
    }
}

fn api_stream_list(account: &mut Account) -> serde_json::Value {
    let infos: Vec<StreamInfo> = account
        .streams
        .values_mut()
        .map(|stream| {
            stream.enforce_limits();
            StreamInfo {
                config: stream.config.clone(),
                state: stream.state(),
                cluster: None,
            }
        })
        .collect();
    json!({ "total": infos.len(), "offset": 0, "limit": 256, "streams": infos })
}

fn api_msg_get(account: &mut Account, stream: &str, payload: &Bytes) -> serde_json::Value {
    let seq = match serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("seq").and_then(|s| s.as_u64()))
    {
        Some(s) => s,
        None => return api_error(400, 0, "invalid message get request"),
    };
    let Some(js) = account.streams.get_mut(stream) else {
        return stream_not_found(stream);
    };
    js.enforce_limits();
    match js.msgs.get(&seq) {
        Some(m) => json!({
            "message": {
                "subject": m.subject,
                "seq": seq,
                "hdrs": if m.headers.is_empty() { None } else { Some(BASE64.encode(&m.headers)) },
                "data": Some(BASE64.encode(&m.data)),
                "time": m.time,
            }
        }),
        None => api_error(
            404,
            ERR_CODE_NO_MESSAGE_FOUND,
            &format!("no message found: {stream}@{seq}"),
        ),
    }
}

fn api_msg_delete(account: &mut Account, stream: &str, payload: &Bytes) -> serde_json::Value {
    let seq = match serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("seq").and_then(|s| s.as_u64()))
    {
        Some(s) => s,
        None => return api_error(400, 0, "invalid message delete request"),
    };
    let Some(js) = account.streams.get_mut(stream) else {
        return stream_not_found(stream);
    };
    match js.msgs.remove(&seq) {
        Some(_) => json!({ "success": true }),
        None => api_error(
            404,
            ERR_CODE_NO_MESSAGE_FOUND,
            &format!("no message found: {stream}@{seq}"),
        ),
    }
}

fn api_consumer_create(account: &mut Account, names: &str, payload: &Bytes) -> serde_json::Value {
    let Some((stream, durable)) = names.split_once('.') else {
        return api_error(400, 0, "invalid durable create subject");
    };
    let config = match parse_consumer_request(payload) {
        Ok(c) => c,
        Err(e) => return api_error(400, 0, &e),
    };
    if config.durable_name.as_deref() != Some(durable) {
        return api_error(400, 0, "durable name in subject does not match config");
    }
    create_consumer_in(account, stream, durable.to_string(), config)
}

fn api_consumer_create_ephemeral(
    account: &mut Account,
    stream: &str,
    payload: &Bytes,
) -> serde_json::Value {
    let config = match parse_consumer_request(payload) {
        Ok(c) => c,
        Err(e) => return api_error(400, 0, &e),
    };
    let name = format!("eph_{}", uuid::Uuid::new_v4().simple());
    create_consumer_in(account, stream, name, config)
}

fn parse_consumer_request(payload: &Bytes) -> Result<ConsumerConfig, String> {
    #[derive(serde::Deserialize)]
    struct Req {
        config: ConsumerConfig,
    }
    serde_json::from_slice::<Req>(payload)
        .map(|r| r.config)
        .map_err(|e| format!("invalid consumer config: {e}"))
}

fn create_consumer_in(
    account: &mut Account,
    stream: &str,
    name: String,
    config: ConsumerConfig,
) -> serde_json::Value {
    let Some(js) = account.streams.get_mut(stream) else {
        return stream_not_found(stream);
    };
    let cursor = match config.deliver_policy {
        DeliverPolicy::All => js.first_seq(),
        DeliverPolicy::New => js.next_seq,
        DeliverPolicy::ByStartSequence => config.opt_start_seq.unwrap_or(1).max(js.first_seq()),
    };
    // Idempotent for a durable recreated with the same config; a changed
    // config replaces the consumer, which is how ack-wait rebuilds land.
    js.consumers.insert(
        name.clone(),
        JsConsumer {
            config,
            cursor,
            pending: BTreeMap::new(),
            exhausted: BTreeSet::new(),
        },
    );
    json!({ "stream_name": stream, "name": name })
}

fn api_consumer_delete(account: &mut Account, names: &str) -> serde_json::Value {
    let Some((stream, consumer)) = names.split_once('.') else {
        return api_error(400, 0, "invalid consumer delete subject");
    };
    let Some(js) = account.streams.get_mut(stream) else {
        return stream_not_found(stream);
    };
    match js.consumers.remove(consumer) {
        Some(_) => json!({ "success": true }),
        None => api_error(
            404,
            ERR_CODE_CONSUMER_NOT_FOUND,
            &format!("consumer not found: {consumer}"),
        ),
    }
}

fn api_consumer_info(account: &mut Account, names: &str) -> serde_json::Value {
    let Some((stream, consumer)) = names.split_once('.') else {
        return api_error(400, 0, "invalid consumer info subject");
    };
    let Some(js) = account.streams.get_mut(stream) else {
        return stream_not_found(stream);
    };
    js.enforce_limits();
    let Some(c) = js.consumers.get(consumer) else {
        return api_error(
            404,
            ERR_CODE_CONSUMER_NOT_FOUND,
            &format!("consumer not found: {consumer}"),
        );
    };
    let num_pending = js
        .msgs
        .range(c.cursor..)
        .filter(|(seq, m)| {
            !c.exhausted.contains(seq)
                && c.config
                    .filter_subject
                    .as_deref()
                    .map_or(true, |f| subject_matches(f, &m.subject))
        })
        .count() as u64;
    let info = super::ConsumerInfo {
        stream_name: stream.to_string(),
        name: consumer.to_string(),
        config: c.config.clone(),
        num_pending,
        num_ack_pending: c.pending.len() as u64,
    };
    serde_json::to_value(info).expect("consumer info serializes")
}

/// Serve a pull request: redeliveries first, advisories for spent budgets,
/// then new messages, all pushed to the pull reply inbox.
fn api_pull_next(
    account: &mut Account,
    account_name: &str,
    names: &str,
    payload: &Bytes,
    inbox: &str,
    worklist: &mut VecDeque<Outgoing>,
) {
    let Some((stream_name, consumer_name)) = names.split_once('.') else {
        return;
    };
    let batch: usize = std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(1);
    let Some(js) = account.streams.get_mut(stream_name) else {
        return;
    };
    js.enforce_limits();
    // Split borrows: the consumer mutates while the log is read.
    let next_seq = js.next_seq;
    let msgs = &js.msgs;
    let Some(consumer) = js.consumers.get_mut(consumer_name) else {
        return;
    };

    let now = Instant::now();
    let ack_wait = if consumer.config.ack_wait.is_zero() {
        DEFAULT_ACK_WAIT
    } else {
        consumer.config.ack_wait
    };
    let max_deliver = consumer.config.max_deliver;

    let mut to_deliver: Vec<u64> = Vec::new();

    // Redeliveries and spent budgets.
    let due: Vec<u64> = consumer
        .pending
        .iter()
        .filter(|(_, p)| now >= p.redeliver_at)
        .map(|(seq, _)| *seq)
        .collect();
    for seq in due {
        let deliveries = consumer.pending[&seq].deliveries;
        if max_deliver > 0 && deliveries >= max_deliver as u64 {
            consumer.pending.remove(&seq);
            consumer.exhausted.insert(seq);
            let advisory = MaxDeliveriesAdvisory {
                stream: stream_name.to_string(),
                consumer: consumer_name.to_string(),
                stream_seq: seq,
                deliveries,
                account: account_name.to_string(),
            };
            worklist.push_back(Outgoing::new(
                account_name,
                format!("{MAX_DELIVERIES_ADVISORY_PREFIX}.{stream_name}.{consumer_name}"),
                None,
                Bytes::new(),
                Bytes::from(serde_json::to_vec(&advisory).expect("advisory serializes")),
            ));
        } else if to_deliver.len() < batch {
            to_deliver.push(seq);
        }
    }

    // First deliveries.
    let filter = consumer.config.filter_subject.clone();
    while to_deliver.len() < batch && consumer.cursor < next_seq {
        let seq = consumer.cursor;
        consumer.cursor += 1;
        if consumer.exhausted.contains(&seq) {
            continue;
        }
        let Some(m) = msgs.get(&seq) else { continue };
        if let Some(f) = &filter {
            if !subject_matches(f, &m.subject) {
                continue;
            }
        }
        to_deliver.push(seq);
    }

    for seq in to_deliver {
        let Some(m) = msgs.get(&seq) else { continue };
        let entry = consumer.pending.entry(seq).or_insert(PendingDelivery {
            deliveries: 0,
            redeliver_at: now,
        });
        entry.deliveries += 1;
        entry.redeliver_at = now + ack_wait;
        let remaining = next_seq.saturating_sub(seq + 1);
        let ack_subject = format!(
            "$JS.ACK.{stream_name}.{consumer_name}.{}.{seq}.{seq}.{}.{remaining}",
            entry.deliveries,
            m.time.timestamp_nanos_opt().unwrap_or_default(),
        );
        let mut out = Outgoing::new(
            account_name,
            inbox,
            Some(ack_subject),
            m.headers.clone(),
            m.data.clone(),
        );
        out.shown_subject = Some(m.subject.clone());
        worklist.push_back(out);
    }
}

fn handle_ack(account: &mut Account, ack_subject: &str) {
    let tokens: Vec<&str> = ack_subject.split('.').collect();
    if tokens.len() < 9 {
        return;
    }
    let (stream_name, consumer_name) = (tokens[2], tokens[3]);
    let Ok(seq) = tokens[5].parse::<u64>() else {
        return;
    };
    let Some(js) = account.streams.get_mut(stream_name) else {
        return;
    };
    if let Some(consumer) = js.consumers.get_mut(consumer_name) {
        consumer.pending.remove(&seq);
    }
    if js.config.retention == RetentionPolicy::WorkQueue {
        js.msgs.remove(&seq);
    }
}

// =============================================================================
// Bus impl
// =============================================================================

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(
        &self,
        account: &str,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: Bytes,
    ) -> SubstrateResult<()> {
        let header_bytes = headers.map(HeaderMap::encode).unwrap_or_default();
        self.do_publish(account, subject, reply, header_bytes, payload);
        Ok(())
    }

    async fn subscribe(
        &self,
        account: &str,
        subject: &str,
        queue_group: Option<&str>,
    ) -> SubstrateResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.sub_counter.fetch_add(1, Ordering::Relaxed);
        {
            let mut accounts = self.inner.accounts.lock().unwrap();
            accounts
                .entry(account.to_string())
                .or_default()
                .subs
                .push(SubEntry {
                    id,
                    pattern: subject.to_string(),
                    queue: queue_group.map(str::to_string),
                    tx,
                });
        }
        let inner = Arc::clone(&self.inner);
        let account = account.to_string();
        Ok(Subscription::new(subject, rx, move || {
            if let Some(acc) = inner.accounts.lock().unwrap().get_mut(&account) {
                acc.subs.retain(|s| s.id != id);
            }
        }))
    }

    async fn server_stats(&self) -> SubstrateResult<ServerStats> {
        let accounts = self.inner.accounts.lock().unwrap();
        Ok(ServerStats {
            accounts: accounts
                .iter()
                .map(|(name, acc)| (name.clone(), acc.io))
                .collect(),
            max_store: self.inner.max_store.load(Ordering::SeqCst),
        })
    }

    async fn connections(&self) -> SubstrateResult<Vec<ConnectionInfo>> {
        Ok(self.inner.connections.lock().unwrap().clone())
    }

    fn is_clustered(&self) -> bool {
        self.inner.clustered.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::{Bus as _, JsApiClient, Substrate};
    use std::time::Duration;

    fn client() -> JsApiClient<MemoryBus> {
        JsApiClient::new(Arc::new(MemoryBus::new())).with_timeout(Duration::from_secs(2))
    }

    fn stream_config(name: &str, subjects: &[&str]) -> StreamConfig {
        StreamConfig {
            name: name.into(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stream_create_and_info() {
        let js = client();
        js.create_stream("acme", &stream_config("orders", &["orders.>"]))
            .await
            .unwrap();

        let info = js.stream_info("acme", "orders").await.unwrap();
        assert_eq!(info.config.name, "orders");
        assert_eq!(info.state.msgs, 0);

        let err = js
            .create_stream("acme", &stream_config("orders", &["orders.>"]))
            .await
            .unwrap_err();
        assert!(matches!(err, super::super::SubstrateError::StreamNameExist(_)));
    }

    #[tokio::test]
    async fn publish_capture_and_get() {
        let js = client();
        js.create_stream("acme", &stream_config("orders", &["orders.>"]))
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("k", "v");
        js.publish(
            "acme",
            "orders.final",
            None,
            Some(&headers),
            Bytes::from_static(b"a"),
        )
        .await
        .unwrap();

        let msg = js.get_message("acme", "orders", 1).await.unwrap();
        assert_eq!(&msg.data[..], b"a");
        assert_eq!(msg.subject, "orders.final");
        assert!(!msg.headers.is_empty());

        let err = js.get_message("acme", "orders", 9).await.unwrap_err();
        assert!(matches!(
            err,
            super::super::SubstrateError::MessageNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn pull_in_order_and_ack() {
        let js = client();
        js.create_stream("acme", &stream_config("orders", &["orders.>"]))
            .await
            .unwrap();
        for body in [b"a" as &[u8], b"b", b"c"] {
            js.publish("acme", "orders.final", None, None, Bytes::copy_from_slice(body))
                .await
                .unwrap();
        }
        js.create_consumer(
            "acme",
            "orders",
            &ConsumerConfig {
                durable_name: Some("g1".into()),
                deliver_policy: DeliverPolicy::All,
                filter_subject: Some("orders.final".into()),
                max_deliver: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let msgs = js
            .pull_next("acme", "orders", "g1", 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(
            msgs.iter().map(|m| m.msg.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for m in &msgs {
            js.ack("acme", &m.reply_subject).await.unwrap();
        }

        let info = js.consumer_info("acme", "orders", "g1").await.unwrap();
        assert_eq!(info.num_ack_pending, 0);
        assert_eq!(info.num_pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_redelivers_then_fires_advisory() {
        let js = client();
        let bus = Arc::clone(js.bus());
        js.create_stream("acme", &stream_config("orders", &["orders.>"]))
            .await
            .unwrap();
        js.publish("acme", "orders.final", None, None, Bytes::from_static(b"x"))
            .await
            .unwrap();
        js.create_consumer(
            "acme",
            "orders",
            &ConsumerConfig {
                durable_name: Some("g1".into()),
                deliver_policy: DeliverPolicy::All,
                ack_wait: Duration::from_millis(50),
                max_deliver: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut advisories = bus
            .subscribe(
                GLOBAL_ACCOUNT,
                &format!("{MAX_DELIVERIES_ADVISORY_PREFIX}.>"),
                None,
            )
            .await
            .unwrap();

        let mut deliveries = 0;
        for _ in 0..5 {
            let msgs = js
                .pull_next("acme", "orders", "g1", 1, Duration::from_millis(10))
                .await
                .unwrap();
            deliveries += msgs.len();
            tokio::time::advance(Duration::from_millis(60)).await;
        }
        assert_eq!(deliveries, 3);

        let advisory = tokio::time::timeout(Duration::from_secs(1), advisories.recv())
            .await
            .unwrap()
            .unwrap();
        let parsed: MaxDeliveriesAdvisory = serde_json::from_slice(&advisory.payload).unwrap();
        assert_eq!(parsed.stream, "orders");
        assert_eq!(parsed.consumer, "g1");
        assert_eq!(parsed.stream_seq, 1);
        assert_eq!(parsed.account, "acme");

        // Budget spent: no further deliveries.
        let msgs = js
            .pull_next("acme", "orders", "g1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn work_queue_drains_on_ack() {
        let js = client();
        let mut config = stream_config("wq", &["wq.>"]);
        config.retention = RetentionPolicy::WorkQueue;
        js.create_stream("acme", &config).await.unwrap();
        js.publish("acme", "wq.task", None, None, Bytes::from_static(b"t"))
            .await
            .unwrap();
        js.create_consumer(
            "acme",
            "wq",
            &ConsumerConfig {
                durable_name: Some("w".into()),
                deliver_policy: DeliverPolicy::All,
                max_deliver: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let msgs = js
            .pull_next("acme", "wq", "w", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
        js.ack("acme", &msgs[0].reply_subject).await.unwrap();

        let info = js.stream_info("acme", "wq").await.unwrap();
        assert_eq!(info.state.msgs, 0);
    }

    #[tokio::test]
    async fn per_subject_ring_cap() {
        let js = client();
        let mut config = stream_config("ring", &["ring.>"]);
        config.max_msgs_per_subject = 3;
        js.create_stream("acme", &config).await.unwrap();

        for i in 0..10 {
            js.publish(
                "acme",
                "ring.broker-0",
                None,
                None,
                Bytes::from(format!("{i}")),
            )
            .await
            .unwrap();
        }
        let info = js.stream_info("acme", "ring").await.unwrap();
        assert_eq!(info.state.msgs, 3);
        // The survivors are the newest three.
        assert_eq!(info.state.first_seq, 8);
    }

    #[tokio::test]
    async fn queue_group_delivers_to_one_member() {
        let bus = Arc::new(MemoryBus::new());
        let mut a = bus.subscribe("acme", "jobs", Some("workers")).await.unwrap();
        let mut b = bus.subscribe("acme", "jobs", Some("workers")).await.unwrap();

        for _ in 0..6 {
            bus.publish("acme", "jobs", None, None, Bytes::from_static(b"j"))
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;

        let mut received = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(20), a.recv()).await
        {
            received += 1;
        }
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(20), b.recv()).await
        {
            received += 1;
        }
        assert_eq!(received, 6);
    }

    #[tokio::test]
    async fn exported_subject_reaches_global_account() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus
            .subscribe(GLOBAL_ACCOUNT, NOTIFICATIONS_SUBJECT, None)
            .await
            .unwrap();
        bus.publish(
            "acme",
            NOTIFICATIONS_SUBJECT,
            None,
            None,
            Bytes::from_static(b"{}"),
        )
        .await
        .unwrap();
        let msg = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.subject, NOTIFICATIONS_SUBJECT);
    }

    #[tokio::test]
    async fn account_purge_drops_streams() {
        let js = client();
        js.create_stream("acme", &stream_config("orders", &["orders.>"]))
            .await
            .unwrap();
        js.purge_account("acme").await.unwrap();
        let err = js.stream_info("acme", "orders").await.unwrap_err();
        assert!(matches!(
            err,
            super::super::SubstrateError::StreamNotFound(_)
        ));
    }
}
