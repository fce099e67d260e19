//! Per-broker throughput accounting.
//!
//! Once per second the sampler reads the server's per-account byte
//! counters, computes the deltas since the previous sample, and publishes
//! one record to `throughput-v1.<broker>`. The stream's per-subject limit
//! equals the dashboard window, so old samples fall off by themselves:
//! a ring buffer with no explicit trimming.
//!
//! The read side rebuilds the window for one tenant: it drains the stream
//! through a short-lived consumer, folds one series per broker, and
//! synthesizes a `"total"` series summed across brokers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::constants::{
    throughput_subject, GLOBAL_ACCOUNT, THROUGHPUT_PULL_DEADLINE, THROUGHPUT_SAMPLE_INTERVAL,
    THROUGHPUT_STREAM,
};
use crate::error::Result;
use crate::substrate::{AccountIo, AckPolicy, ConsumerConfig, DeliverPolicy, Substrate};

/// One published sample: this broker's per-account deltas for one second.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerThroughputSample {
    pub name: String,
    /// account → bytes read out of the broker during the sample window
    pub read: HashMap<String, i64>,
    /// account → bytes written into the broker during the sample window
    pub write: HashMap<String, i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputPoint {
    pub timestamp: DateTime<Utc>,
    pub bytes_per_sec: i64,
}

/// One broker's window of points, as the dashboard consumes it.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerThroughputSeries {
    pub name: String,
    pub read: Vec<ThroughputPoint>,
    pub write: Vec<ThroughputPoint>,
}

pub struct ThroughputAccountant {
    substrate: Arc<dyn Substrate>,
    broker_name: String,
    last: Mutex<HashMap<String, AccountIo>>,
}

impl ThroughputAccountant {
    pub fn new(substrate: Arc<dyn Substrate>, broker_name: impl Into<String>) -> Self {
        Self {
            substrate,
            broker_name: broker_name.into(),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the snapshot so the first sample reports deltas, not totals.
    pub async fn init(&self) -> Result<()> {
        let stats = self.substrate.server_stats().await?;
        *self.last.lock().unwrap() = stats.accounts;
        Ok(())
    }

    /// Take one sample and publish it.
    pub async fn sample_once(&self) -> Result<BrokerThroughputSample> {
        let stats = self.substrate.server_stats().await?;
        let mut sample = BrokerThroughputSample {
            name: self.broker_name.clone(),
            ..Default::default()
        };
        {
            let mut last = self.last.lock().unwrap();
            for (account, io) in &stats.accounts {
                let prev = last.get(account).copied().unwrap_or_default();
                sample.read.insert(
                    account.clone(),
                    io.out_bytes.saturating_sub(prev.out_bytes) as i64,
                );
                sample.write.insert(
                    account.clone(),
                    io.in_bytes.saturating_sub(prev.in_bytes) as i64,
                );
            }
            *last = stats.accounts;
        }

        let payload = serde_json::to_vec(&sample).expect("sample serializes");
        self.substrate
            .publish(
                GLOBAL_ACCOUNT,
                &throughput_subject(&self.broker_name),
                None,
                None,
                payload.into(),
            )
            .await?;
        Ok(sample)
    }

    /// The one-second sampling loop. Runs until the stop signal flips.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(THROUGHPUT_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sample_once().await {
                        warn!("throughput_sampler: {e}");
                    }
                }
                _ = stop.changed() => return,
            }
        }
    }

    /// Rebuild the current window for one tenant, one series per broker
    /// plus the synthetic total.
    pub async fn get_brokers_throughputs(
        &self,
        tenant: &str,
    ) -> Result<Vec<BrokerThroughputSeries>> {
        let info = self
            .substrate
            .stream_info(GLOBAL_ACCOUNT, THROUGHPUT_STREAM)
            .await?;
        let amount = info.state.msgs as usize;
        let start_seq = info.state.first_seq.max(1);

        let durable = format!(
            "$memphis_fetch_throughput_consumer_{}",
            uuid::Uuid::new_v4().simple()
        );
        self.substrate
            .create_consumer(
                GLOBAL_ACCOUNT,
                THROUGHPUT_STREAM,
                &ConsumerConfig {
                    durable_name: Some(durable.clone()),
                    deliver_policy: DeliverPolicy::ByStartSequence,
                    opt_start_seq: Some(start_seq),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await?;

        let mut msgs = self
            .substrate
            .pull_next(
                GLOBAL_ACCOUNT,
                THROUGHPUT_STREAM,
                &durable,
                amount,
                THROUGHPUT_PULL_DEADLINE,
            )
            .await?;
        for msg in &msgs {
            let _ = self.substrate.ack(GLOBAL_ACCOUNT, &msg.reply_subject).await;
        }
        if let Err(e) = self
            .substrate
            .delete_consumer(GLOBAL_ACCOUNT, THROUGHPUT_STREAM, &durable)
            .await
        {
            warn!("get_brokers_throughputs: consumer cleanup failed: {e}");
        }

        // Old to new.
        msgs.sort_by_key(|m| m.msg.time);

        let mut by_broker: HashMap<String, BrokerThroughputSeries> = HashMap::new();
        for msg in &msgs {
            let sample: BrokerThroughputSample = match serde_json::from_slice(&msg.msg.data) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("[tenant: {tenant}]get_brokers_throughputs: {e}");
                    continue;
                }
            };
            let series = by_broker
                .entry(sample.name.clone())
                .or_insert_with(|| BrokerThroughputSeries {
                    name: sample.name.clone(),
                    read: Vec::new(),
                    write: Vec::new(),
                });
            series.read.push(ThroughputPoint {
                timestamp: msg.msg.time,
                bytes_per_sec: sample.read.get(tenant).copied().unwrap_or(0),
            });
            series.write.push(ThroughputPoint {
                timestamp: msg.msg.time,
                bytes_per_sec: sample.write.get(tenant).copied().unwrap_or(0),
            });
        }

        let mut series: Vec<BrokerThroughputSeries> = by_broker.into_values().collect();
        series.sort_by(|a, b| a.name.cmp(&b.name));

        let mut total = BrokerThroughputSeries {
            name: "total".to_string(),
            read: Vec::new(),
            write: Vec::new(),
        };
        for broker in &series {
            for (i, point) in broker.read.iter().enumerate() {
                if i == total.read.len() {
                    total.read.push(*point);
                } else {
                    total.read[i].bytes_per_sec += point.bytes_per_sec;
                    total.read[i].timestamp = point.timestamp;
                }
            }
            for (i, point) in broker.write.iter().enumerate() {
                if i == total.write.len() {
                    total.write.push(*point);
                } else {
                    total.write[i].bytes_per_sec += point.bytes_per_sec;
                    total.write[i].timestamp = point.timestamp;
                }
            }
        }
        series.insert(0, total);
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_wire_shape() {
        let sample = BrokerThroughputSample {
            name: "broker-0".into(),
            read: HashMap::from([("acme".to_string(), 1024)]),
            write: HashMap::from([("acme".to_string(), 2048)]),
        };
        let json = serde_json::to_string(&sample).unwrap();
        let back: BrokerThroughputSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "broker-0");
        assert_eq!(back.read["acme"], 1024);
        assert_eq!(back.write["acme"], 2048);
    }
}
