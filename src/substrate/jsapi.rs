//! The jsapi facade.
//!
//! Every stream/consumer/message operation of the substrate is a JSON
//! request/reply over a `$JS.API.…` subject. This client owns the whole
//! dance so no other module ever touches it:
//!
//! 1. acquire the target tenant account
//! 2. subscribe a one-shot reply inbox
//! 3. publish the request
//! 4. wait for the reply with a 40 s hard deadline (`Timeout` on expiry)
//! 5. decode the typed response
//! 6. unsubscribe
//!
//! Pull requests are the one exception to one-shot replies: the server
//! streams up to `batch` messages to the inbox, each carrying its own
//! `$JS.ACK` reply subject, and the client collects until the batch is
//! full or its deadline passes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    Bus, BusMessage, ConnectionInfo, ConsumerConfig, ConsumerInfo, PulledMsg, ServerStats,
    StoredMsg, StreamConfig, StreamInfo, Subscription, Substrate, SubstrateError, SubstrateResult,
    ERR_CODE_CLUSTER_NO_PEERS, ERR_CODE_CONSUMER_NOT_FOUND, ERR_CODE_NO_MESSAGE_FOUND,
    ERR_CODE_STREAM_NAME_EXIST, ERR_CODE_STREAM_NOT_FOUND,
};
use crate::constants::JSAPI_TIMEOUT;
use crate::headers::HeaderMap;

// Request kinds, used only for timeout diagnostics.
const KIND_CREATE_STREAM: &str = "$memphis_create_stream";
const KIND_UPDATE_STREAM: &str = "$memphis_update_stream";
const KIND_DELETE_STREAM: &str = "$memphis_delete_stream";
const KIND_STREAM_INFO: &str = "$memphis_stream_info";
const KIND_STREAM_LIST: &str = "$memphis_stream_list";
const KIND_PURGE_STREAM: &str = "$memphis_purge_stream";
const KIND_GET_MSG: &str = "$memphis_get_msg";
const KIND_DELETE_MSG: &str = "$memphis_delete_msg";
const KIND_CREATE_CONSUMER: &str = "$memphis_create_consumer";
const KIND_DELETE_CONSUMER: &str = "$memphis_delete_consumer";
const KIND_CONSUMER_INFO: &str = "$memphis_consumer_info";
const KIND_PURGE_ACCOUNT: &str = "$memphis_purge_account";

/// Implements [`Substrate`] over any [`Bus`] by speaking the `$JS.API.…`
/// protocol.
pub struct JsApiClient<B: Bus> {
    bus: Arc<B>,
    timeout: Duration,
}

impl<B: Bus> JsApiClient<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self {
            bus,
            timeout: JSAPI_TIMEOUT,
        }
    }

    /// Override the request deadline. Tests use short deadlines; production
    /// keeps the 40 s default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    fn reply_inbox() -> String {
        format!("$memphis_jsapi_reply_{}", uuid::Uuid::new_v4().simple())
    }

    async fn round_trip(
        &self,
        tenant: &str,
        subject: &str,
        kind: &str,
        payload: Bytes,
    ) -> SubstrateResult<Bytes> {
        let inbox = Self::reply_inbox();
        let mut sub = self.bus.subscribe(tenant, &inbox, None).await?;
        self.bus
            .publish(tenant, subject, Some(&inbox), None, payload)
            .await?;

        let msg = tokio::time::timeout(self.timeout, sub.recv())
            .await
            .map_err(|_| SubstrateError::Timeout {
                kind: kind.to_string(),
                subject: subject.to_string(),
            })?
            .ok_or_else(|| SubstrateError::Closed(subject.to_string()))?;
        drop(sub);
        Ok(msg.payload)
    }

    /// Request/reply where only the error branch of the response matters.
    async fn request_ack(
        &self,
        tenant: &str,
        subject: &str,
        kind: &str,
        payload: Bytes,
    ) -> SubstrateResult<()> {
        let raw = self.round_trip(tenant, subject, kind, payload).await?;
        let resp: ErrorEnvelope = serde_json::from_slice(&raw)
            .map_err(|e| SubstrateError::Decode(format!("{subject}: {e}")))?;
        match resp.error {
            Some(err) => Err(err.into_typed()),
            None => Ok(()),
        }
    }

    /// Request/reply with a typed response body. The error branch is
    /// checked first so a typed API error never surfaces as a decode
    /// failure of the success shape.
    async fn request<T: DeserializeOwned>(
        &self,
        tenant: &str,
        subject: &str,
        kind: &str,
        payload: Bytes,
    ) -> SubstrateResult<T> {
        let raw = self.round_trip(tenant, subject, kind, payload).await?;
        let envelope: ErrorEnvelope = serde_json::from_slice(&raw)
            .map_err(|e| SubstrateError::Decode(format!("{subject}: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(err.into_typed());
        }
        serde_json::from_slice(&raw)
            .map_err(|e| SubstrateError::Decode(format!("{subject}: {e}")))
    }
}

// =============================================================================
// Wire types
// =============================================================================

/// The error branch every jsapi response may carry.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u16,
    #[serde(default)]
    pub description: String,
}

impl ApiError {
    fn into_typed(self) -> SubstrateError {
        match self.err_code {
            ERR_CODE_STREAM_NOT_FOUND => SubstrateError::StreamNotFound(self.description),
            ERR_CODE_STREAM_NAME_EXIST => SubstrateError::StreamNameExist(self.description),
            ERR_CODE_CONSUMER_NOT_FOUND => SubstrateError::ConsumerNotFound(self.description),
            ERR_CODE_NO_MESSAGE_FOUND => SubstrateError::MessageNotFound {
                stream: self.description,
                seq: 0,
            },
            ERR_CODE_CLUSTER_NO_PEERS => SubstrateError::ClusterNoPeers,
            _ => SubstrateError::Api {
                code: self.code,
                err_code: self.err_code,
                description: self.description,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamListPage {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

#[derive(Debug, Serialize)]
struct PagedRequest {
    offset: usize,
}

#[derive(Debug, Serialize)]
struct MsgGetRequest {
    seq: u64,
}

#[derive(Debug, Serialize)]
struct MsgDeleteRequest {
    seq: u64,
    no_erase: bool,
}

#[derive(Debug, Serialize)]
struct CreateConsumerRequest<'a> {
    stream_name: &'a str,
    config: &'a ConsumerConfig,
}

#[derive(Debug, Deserialize)]
struct MsgGetBody {
    message: WireStoredMsg,
}

#[derive(Debug, Deserialize)]
struct WireStoredMsg {
    subject: String,
    seq: u64,
    #[serde(default)]
    hdrs: Option<String>,
    #[serde(default)]
    data: Option<String>,
    time: DateTime<Utc>,
}

impl WireStoredMsg {
    fn into_stored(self, stream: &str) -> SubstrateResult<StoredMsg> {
        let decode = |field: Option<String>| -> SubstrateResult<Bytes> {
            match field {
                None => Ok(Bytes::new()),
                Some(b64) => BASE64
                    .decode(b64)
                    .map(Bytes::from)
                    .map_err(|e| SubstrateError::Decode(format!("{stream}: {e}"))),
            }
        };
        Ok(StoredMsg {
            subject: self.subject,
            sequence: self.seq,
            headers: decode(self.hdrs)?,
            data: decode(self.data)?,
            time: self.time,
        })
    }
}

// =============================================================================
// Ack-reply parsing
// =============================================================================

/// Parsed form of a `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.
/// <ts>.<pending>` reply subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AckReply {
    pub stream_seq: u64,
    pub deliveries: u64,
    pub timestamp_nanos: i64,
}

pub(crate) fn parse_ack_reply(reply: &str) -> Option<AckReply> {
    let tokens: Vec<&str> = reply.split('.').collect();
    if tokens.len() < 9 || tokens[0] != "$JS" || tokens[1] != "ACK" {
        return None;
    }
    Some(AckReply {
        deliveries: tokens[4].parse().ok()?,
        stream_seq: tokens[5].parse().ok()?,
        timestamp_nanos: tokens[7].parse().ok()?,
    })
}

// =============================================================================
// Substrate impl
// =============================================================================

#[async_trait]
impl<B: Bus> Substrate for JsApiClient<B> {
    async fn create_stream(&self, tenant: &str, config: &StreamConfig) -> SubstrateResult<()> {
        let subject = format!("$JS.API.STREAM.CREATE.{}", config.name);
        let payload = Bytes::from(serde_json::to_vec(config).expect("stream config serializes"));
        self.request_ack(tenant, &subject, KIND_CREATE_STREAM, payload)
            .await
    }

    async fn update_stream(&self, tenant: &str, config: &StreamConfig) -> SubstrateResult<()> {
        let subject = format!("$JS.API.STREAM.UPDATE.{}", config.name);
        let payload = Bytes::from(serde_json::to_vec(config).expect("stream config serializes"));
        self.request_ack(tenant, &subject, KIND_UPDATE_STREAM, payload)
            .await
    }

    async fn delete_stream(&self, tenant: &str, stream: &str) -> SubstrateResult<()> {
        let subject = format!("$JS.API.STREAM.DELETE.{stream}");
        self.request_ack(tenant, &subject, KIND_DELETE_STREAM, Bytes::new())
            .await
    }

    async fn stream_info(&self, tenant: &str, stream: &str) -> SubstrateResult<StreamInfo> {
        let subject = format!("$JS.API.STREAM.INFO.{stream}");
        self.request(tenant, &subject, KIND_STREAM_INFO, Bytes::new())
            .await
    }

    async fn list_streams(&self, tenant: &str) -> SubstrateResult<Vec<StreamInfo>> {
        let subject = "$JS.API.STREAM.LIST";
        let mut streams = Vec::new();
        loop {
            let req = PagedRequest {
                offset: streams.len(),
            };
            let payload = Bytes::from(serde_json::to_vec(&req).expect("paged request serializes"));
            let page: StreamListPage = self
                .request(tenant, subject, KIND_STREAM_LIST, payload)
                .await?;
            let received = page.streams.len();
            streams.extend(page.streams);
            if streams.len() >= page.total || received == 0 || page.limit == 0 {
                return Ok(streams);
            }
        }
    }

    async fn purge_stream(&self, tenant: &str, stream: &str) -> SubstrateResult<()> {
        let subject = format!("$JS.API.STREAM.PURGE.{stream}");
        self.request_ack(tenant, &subject, KIND_PURGE_STREAM, Bytes::new())
            .await
    }

    async fn purge_account(&self, tenant: &str) -> SubstrateResult<()> {
        let subject = format!("$JS.API.ACCOUNT.PURGE.{tenant}");
        self.request_ack(tenant, &subject, KIND_PURGE_ACCOUNT, Bytes::new())
            .await
    }

    async fn get_message(
        &self,
        tenant: &str,
        stream: &str,
        seq: u64,
    ) -> SubstrateResult<StoredMsg> {
        let subject = format!("$JS.API.STREAM.MSG.GET.{stream}");
        let payload =
            Bytes::from(serde_json::to_vec(&MsgGetRequest { seq }).expect("get request serializes"));
        let body: MsgGetBody = self
            .request(tenant, &subject, KIND_GET_MSG, payload)
            .await
            .map_err(|e| match e {
                SubstrateError::MessageNotFound { .. } => SubstrateError::MessageNotFound {
                    stream: stream.to_string(),
                    seq,
                },
                other => other,
            })?;
        body.message.into_stored(stream)
    }

    async fn delete_message(&self, tenant: &str, stream: &str, seq: u64) -> SubstrateResult<()> {
        let subject = format!("$JS.API.STREAM.MSG.DELETE.{stream}");
        let req = MsgDeleteRequest {
            seq,
            no_erase: true,
        };
        let payload = Bytes::from(serde_json::to_vec(&req).expect("delete request serializes"));
        self.request_ack(tenant, &subject, KIND_DELETE_MSG, payload)
            .await
    }

    async fn create_consumer(
        &self,
        tenant: &str,
        stream: &str,
        config: &ConsumerConfig,
    ) -> SubstrateResult<()> {
        let subject = match &config.durable_name {
            Some(durable) => format!("$JS.API.CONSUMER.DURABLE.CREATE.{stream}.{durable}"),
            None => format!("$JS.API.CONSUMER.CREATE.{stream}"),
        };
        let req = CreateConsumerRequest {
            stream_name: stream,
            config,
        };
        let payload = Bytes::from(serde_json::to_vec(&req).expect("consumer request serializes"));
        self.request_ack(tenant, &subject, KIND_CREATE_CONSUMER, payload)
            .await
    }

    async fn delete_consumer(
        &self,
        tenant: &str,
        stream: &str,
        name: &str,
    ) -> SubstrateResult<()> {
        let subject = format!("$JS.API.CONSUMER.DELETE.{stream}.{name}");
        self.request_ack(tenant, &subject, KIND_DELETE_CONSUMER, Bytes::new())
            .await
    }

    async fn consumer_info(
        &self,
        tenant: &str,
        stream: &str,
        name: &str,
    ) -> SubstrateResult<ConsumerInfo> {
        let subject = format!("$JS.API.CONSUMER.INFO.{stream}.{name}");
        self.request(tenant, &subject, KIND_CONSUMER_INFO, Bytes::new())
            .await
    }

    async fn pull_next(
        &self,
        tenant: &str,
        stream: &str,
        durable: &str,
        batch: usize,
        deadline: Duration,
    ) -> SubstrateResult<Vec<PulledMsg>> {
        let subject = format!("$JS.API.CONSUMER.MSG.NEXT.{stream}.{durable}");
        let inbox = Self::reply_inbox();
        let mut sub = self.bus.subscribe(tenant, &inbox, None).await?;
        self.bus
            .publish(
                tenant,
                &subject,
                Some(&inbox),
                None,
                Bytes::from(batch.to_string()),
            )
            .await?;

        let mut msgs = Vec::new();
        let expires = tokio::time::Instant::now() + deadline;
        while msgs.len() < batch {
            let remaining = expires.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let next = match tokio::time::timeout(remaining, sub.recv()).await {
                Ok(Some(msg)) => msg,
                Ok(None) | Err(_) => break,
            };
            if let Some(pulled) = pulled_from_bus_msg(next) {
                msgs.push(pulled);
            }
        }
        Ok(msgs)
    }

    async fn ack(&self, tenant: &str, reply_subject: &str) -> SubstrateResult<()> {
        self.bus
            .publish(tenant, reply_subject, None, None, Bytes::new())
            .await
    }

    async fn publish(
        &self,
        tenant: &str,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&HeaderMap>,
        payload: Bytes,
    ) -> SubstrateResult<()> {
        self.bus.publish(tenant, subject, reply, headers, payload).await
    }

    async fn subscribe(
        &self,
        tenant: &str,
        subject: &str,
        queue_group: Option<&str>,
    ) -> SubstrateResult<Subscription> {
        self.bus.subscribe(tenant, subject, queue_group).await
    }

    async fn server_stats(&self) -> SubstrateResult<ServerStats> {
        self.bus.server_stats().await
    }

    async fn connections(&self) -> SubstrateResult<Vec<ConnectionInfo>> {
        self.bus.connections().await
    }

    fn is_clustered(&self) -> bool {
        self.bus.is_clustered()
    }
}

/// Turn a pull-delivered bus message into a [`PulledMsg`]. Status-only
/// messages (404 no messages, 408 request timeout, 409 flow control) carry
/// no ack reply and are dropped here.
fn pulled_from_bus_msg(msg: BusMessage) -> Option<PulledMsg> {
    let reply = msg.reply?;
    let ack = parse_ack_reply(&reply)?;
    let time = Utc
        .timestamp_nanos(ack.timestamp_nanos);
    Some(PulledMsg {
        msg: StoredMsg {
            subject: msg.subject,
            sequence: ack.stream_seq,
            headers: msg.headers,
            data: msg.payload,
            time,
        },
        reply_subject: reply,
        deliveries: ack.deliveries,
    })
}
