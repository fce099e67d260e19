//! The tiered-storage offload pipeline.
//!
//! Every message on a tiered-storage-enabled station is republished by the
//! write path into the internal tiered-storage work queue. Two cooperating
//! tasks drain it:
//!
//! - the **ingest loop** pulls batches (up to 1000 messages, 5 s deadline),
//!   parses each frame, and hands it off over a channel; it never touches
//!   the buffer directly
//! - the **flush task** owns the buffer: it accumulates handed-off
//!   messages per tenant and station, and on every tick uploads each
//!   tenant's batches to that tenant's object store, acking work-queue
//!   messages only after the upload durably succeeded
//!
//! An upload failure loses nothing: the buffer is retained, the cycle
//! retries, and unacked messages redeliver under the consumer's
//! ack-wait/max-deliver policy. On the final failed delivery the advisory
//! lands in the dls-unacked stream, which is acceptable operational
//! visibility.
//!
//! When the operator changes `tiered_storage_time_sec`, the flush task
//! resets its ticker and rebuilds the durable consumer so its ack wait
//! tracks twice the window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::constants::{
    GLOBAL_ACCOUNT, TIERED_STORAGE_CONSUMER, TIERED_STORAGE_PULL_BATCH,
    TIERED_STORAGE_PULL_DEADLINE, TIERED_STORAGE_STREAM,
};
use crate::error::{Error, Result};
use crate::headers::{split_frame, HeaderMap};
use crate::substrate::{PulledMsg, Substrate};

use super::config::ConfigStore;
use super::object_store::TieredStoreProvider;
use super::streams::StreamManager;

/// Wire shape of a republished message on the tiered-storage stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredStorageMsg {
    pub station_name: String,
    #[serde(default)]
    pub tenant_name: String,
    /// Base64 of the raw frame: header block, blank line, payload.
    pub buf: String,
}

/// One buffered message awaiting flush.
#[derive(Debug, Clone)]
pub struct BufferedMsg {
    pub station: String,
    pub sequence: u64,
    pub headers: Bytes,
    pub data: Bytes,
    pub time: DateTime<Utc>,
    pub reply_subject: String,
}

/// The JSON entry shape inside an uploaded batch object.
#[derive(Debug, Serialize)]
struct BatchEntry<'a> {
    sequence: u64,
    time: DateTime<Utc>,
    headers: HashMap<&'a str, &'a str>,
    data: String,
}

type TenantBuffers = HashMap<String, HashMap<String, Vec<BufferedMsg>>>;

pub struct TieredStoragePipeline {
    substrate: Arc<dyn Substrate>,
    streams: Arc<StreamManager>,
    provider: Arc<dyn TieredStoreProvider>,
    config: ConfigStore,
    buffered: Mutex<TenantBuffers>,
    tx: mpsc::UnboundedSender<(String, BufferedMsg)>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<(String, BufferedMsg)>>>,
}

impl TieredStoragePipeline {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        streams: Arc<StreamManager>,
        provider: Arc<dyn TieredStoreProvider>,
        config: ConfigStore,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            substrate,
            streams,
            provider,
            config,
            buffered: Mutex::new(HashMap::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Park a parsed message in the flush buffer directly, bypassing the
    /// ingest channel. Used by embedders that run their own pull loop.
    pub fn buffer(&self, tenant: String, msg: BufferedMsg) {
        self.buffered
            .lock()
            .unwrap()
            .entry(tenant)
            .or_default()
            .entry(msg.station.clone())
            .or_default()
            .push(msg);
    }

    /// Buffered message count, across all tenants.
    pub fn buffered_count(&self) -> usize {
        self.buffered
            .lock()
            .unwrap()
            .values()
            .flat_map(|stations| stations.values())
            .map(Vec::len)
            .sum()
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Pull-and-parse loop. Runs until the stop signal flips.
    pub async fn run_ingest(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            if !self.streams.tiered_storage_ready() {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                    _ = stop.changed() => return,
                }
            }
            let pulled = tokio::select! {
                result = self.substrate.pull_next(
                    GLOBAL_ACCOUNT,
                    TIERED_STORAGE_STREAM,
                    TIERED_STORAGE_CONSUMER,
                    TIERED_STORAGE_PULL_BATCH,
                    TIERED_STORAGE_PULL_DEADLINE,
                ) => result,
                _ = stop.changed() => return,
            };
            let msgs = match pulled {
                Ok(msgs) => msgs,
                Err(e) => {
                    warn!("tiered_storage: pull failed: {e}");
                    continue;
                }
            };
            for msg in msgs {
                match parse_frame(&msg) {
                    Ok((tenant, buffered)) => {
                        // The flush task owns the buffer; hand off.
                        let _ = self.tx.send((tenant, buffered));
                    }
                    Err(e) => {
                        error!("tiered_storage: invalid message structure: {e}");
                        // Malformed frames can never succeed; drop them.
                        let _ = self.substrate.ack(GLOBAL_ACCOUNT, &msg.reply_subject).await;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Accumulate-and-flush loop with a reconfigurable ticker. Runs until
    /// the stop signal flips.
    pub async fn run_flush(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("run_flush started twice");
        let mut config_watch = self.config.subscribe();
        let mut window_sec = self.config.current().tiered_storage_time_sec;
        let mut ticker = tokio::time::interval(self.config.current().tiered_storage_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a fresh interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                Some((tenant, msg)) = rx.recv() => {
                    self.buffered
                        .lock()
                        .unwrap()
                        .entry(tenant)
                        .or_default()
                        .entry(msg.station.clone())
                        .or_default()
                        .push(msg);
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once().await {
                        error!("tiered_storage: failed upload messages to tier 2 storage: {e}");
                    }
                }
                changed = config_watch.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let config = config_watch.borrow_and_update().clone();
                    if config.tiered_storage_time_sec != window_sec {
                        window_sec = config.tiered_storage_time_sec;
                        ticker = tokio::time::interval(config.tiered_storage_interval());
                        ticker.set_missed_tick_behavior(
                            tokio::time::MissedTickBehavior::Delay,
                        );
                        ticker.tick().await;
                        if let Err(e) = self
                            .streams
                            .rebuild_tiered_storage_consumer(config.tiered_storage_ack_wait())
                            .await
                        {
                            warn!("tiered_storage: consumer rebuild failed: {e}");
                        } else {
                            info!(
                                window_sec,
                                "tiered_storage: flush window reconfigured"
                            );
                        }
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }

    /// One flush cycle: upload every tenant's buffered batches, then ack
    /// and clear. On any upload failure the whole buffer is retained for
    /// the next cycle and nothing is acked.
    pub async fn flush_once(&self) -> Result<usize> {
        let taken = std::mem::take(&mut *self.buffered.lock().unwrap());
        if taken.is_empty() {
            return Ok(0);
        }

        let mut upload_err = None;
        'uploads: for (tenant, stations) in &taken {
            let Some(store) = self.provider.store_for(tenant) else {
                // No long-term target configured: the buffer is dropped
                // after ack, like any other consumed work.
                continue;
            };
            for (station, msgs) in stations {
                if let Err(e) = upload_batch(store.as_ref(), tenant, station, msgs).await {
                    upload_err = Some(e);
                    break 'uploads;
                }
            }
        }

        if let Some(e) = upload_err {
            // Put everything back, in front of anything newly arrived, and
            // retry on the next cycle.
            let mut buffered = self.buffered.lock().unwrap();
            for (tenant, stations) in taken {
                let slot = buffered.entry(tenant).or_default();
                for (station, mut msgs) in stations {
                    let existing = slot.entry(station).or_default();
                    msgs.append(existing);
                    *existing = msgs;
                }
            }
            return Err(e);
        }

        let mut acked = 0;
        for stations in taken.values() {
            for msgs in stations.values() {
                for msg in msgs {
                    if let Err(e) = self
                        .substrate
                        .ack(GLOBAL_ACCOUNT, &msg.reply_subject)
                        .await
                    {
                        warn!("tiered_storage: ack failed: {e}");
                        continue;
                    }
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }
}

/// Decode one pulled work-queue message into its tenant and buffered form.
pub fn parse_frame(msg: &PulledMsg) -> Result<(String, BufferedMsg)> {
    let wire: TieredStorageMsg = serde_json::from_slice(&msg.msg.data)
        .map_err(|e| Error::Invalid(format!("message must carry a tiered-storage body: {e}")))?;
    let frame = BASE64
        .decode(&wire.buf)
        .map_err(|e| Error::Invalid(format!("bad frame encoding: {e}")))?;
    let (headers, data) = split_frame(&frame);
    let tenant = if wire.tenant_name.is_empty() {
        GLOBAL_ACCOUNT.to_string()
    } else {
        wire.tenant_name
    };
    Ok((
        tenant,
        BufferedMsg {
            station: wire.station_name,
            sequence: msg.msg.sequence,
            headers,
            data,
            time: msg.msg.time,
            reply_subject: msg.reply_subject.clone(),
        },
    ))
}

/// Upload one station's batch as a single ordered JSON object. The key
/// embeds the sequence range so object listings sort in stream order.
pub async fn upload_batch(
    store: &dyn ObjectStore,
    tenant: &str,
    station: &str,
    msgs: &[BufferedMsg],
) -> Result<StorePath> {
    let first = msgs.first().map(|m| m.sequence).unwrap_or(0);
    let last = msgs.last().map(|m| m.sequence).unwrap_or(0);
    let key = StorePath::from(format!(
        "{tenant}/{station}/{}_{first}-{last}.json",
        Utc::now().timestamp_millis()
    ));

    let mut entries = Vec::with_capacity(msgs.len());
    let mut decoded_headers = Vec::with_capacity(msgs.len());
    for msg in msgs {
        decoded_headers.push(HeaderMap::decode(&msg.headers).unwrap_or_default());
    }
    for (msg, headers) in msgs.iter().zip(&decoded_headers) {
        entries.push(BatchEntry {
            sequence: msg.sequence,
            time: msg.time,
            headers: headers.iter().collect(),
            data: BASE64.encode(&msg.data),
        });
    }
    let body = serde_json::to_vec(&entries).expect("batch serializes");

    store
        .put(&key, body.into())
        .await
        .map_err(|e| Error::Transient(format!("tier 2 upload failed: {e}")))?;
    Ok(key)
}
