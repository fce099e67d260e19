//! Operator configuration.
//!
//! A single strongly-typed view of the cluster configuration
//! ([`SystemConfig`]) is kept in sync with the metadata DB and with every
//! subsystem through [`ConfigStore`], a watch-based read pointer. Nothing
//! outside [`ConfigCoordinator`] mutates the store; subsystems either read
//! [`ConfigStore::current`] on demand or hold a [`ConfigStore::subscribe`]
//! receiver and react to changes.
//!
//! The reload signal on the wire is at-least-once; every reload handler is
//! idempotent against the latest persisted values.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::constants::{CONFIG_RELOAD_SIGNAL_SUBJECT, GLOBAL_ACCOUNT};
use crate::error::{Error, Result};
use crate::metadata::MetadataDb;
use crate::substrate::Substrate;

use super::streams::StreamManager;

/// Recognized configuration keys. Setting any other key is ignored with a
/// warning.
const KEY_DLS_RETENTION: &str = "dls_retention";
const KEY_LOGS_RETENTION: &str = "logs_retention";
const KEY_TIERED_STORAGE_TIME_SEC: &str = "tiered_storage_time_sec";
const KEY_BROKER_HOST: &str = "broker_host";
const KEY_UI_HOST: &str = "ui_host";
const KEY_REST_GW_HOST: &str = "rest_gw_host";
const KEY_MAX_MSG_SIZE_MB: &str = "max_msg_size_mb";
const KEY_ANALYTICS: &str = "analytics";
const KEY_DEPLOYMENT_ID: &str = "deployment_id";

/// The typed view of operator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// DLS record retention, in hours.
    pub dls_retention_hours: i64,
    /// System-log stream retention, in days.
    pub logs_retention_days: i64,
    /// Tiered-storage flush window, seconds; valid range `[5, 3600]`.
    pub tiered_storage_time_sec: i64,
    pub broker_host: String,
    pub ui_host: String,
    pub rest_gw_host: String,
    pub max_msg_size_mb: i64,
    pub analytics: bool,
    pub deployment_id: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            dls_retention_hours: 3,
            logs_retention_days: 30,
            tiered_storage_time_sec: 8,
            broker_host: String::new(),
            ui_host: String::new(),
            rest_gw_host: String::new(),
            max_msg_size_mb: 1,
            analytics: true,
            deployment_id: String::new(),
        }
    }
}

impl SystemConfig {
    pub fn dls_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dls_retention_hours)
    }

    pub fn logs_retention(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.logs_retention_days as u64 * 24 * 60 * 60)
    }

    pub fn tiered_storage_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tiered_storage_time_sec.max(1) as u64)
    }

    /// Ack wait of the tiered-storage consumer: twice the flush window, so
    /// a batch survives one full missed flush before redelivery.
    pub fn tiered_storage_ack_wait(&self) -> std::time::Duration {
        self.tiered_storage_interval() * 2
    }
}

/// Process-wide configuration view with an atomic read pointer and change
/// notifications. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<SystemConfig>>,
}

impl ConfigStore {
    pub fn new(initial: SystemConfig) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> SystemConfig {
        self.tx.borrow().clone()
    }

    /// Subscribe to configuration changes. The receiver is marked changed
    /// on every publish, even when the value is equal.
    pub fn subscribe(&self) -> watch::Receiver<SystemConfig> {
        self.tx.subscribe()
    }

    // Mutation is reserved to the coordinator.
    pub(crate) fn publish(&self, config: SystemConfig) {
        self.tx.send_replace(config);
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(SystemConfig::default())
    }
}

/// The mutable subset of [`SystemConfig`] an operator can edit.
#[derive(Debug, Clone)]
pub struct EditClusterConfigRequest {
    pub dls_retention_hours: i64,
    pub logs_retention_days: i64,
    pub tiered_storage_time_sec: i64,
    pub broker_host: String,
    pub ui_host: String,
    pub rest_gw_host: String,
    pub max_msg_size_mb: i64,
}

/// Owns persistence and fan-out of operator configuration.
pub struct ConfigCoordinator {
    db: Arc<dyn MetadataDb>,
    substrate: Arc<dyn Substrate>,
    store: ConfigStore,
    streams: Arc<StreamManager>,
}

impl ConfigCoordinator {
    pub fn new(
        db: Arc<dyn MetadataDb>,
        substrate: Arc<dyn Substrate>,
        store: ConfigStore,
        streams: Arc<StreamManager>,
    ) -> Self {
        Self {
            db,
            substrate,
            store,
            streams,
        }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Read every persisted key into the typed view and publish it.
    /// Unknown keys warn; missing keys keep their defaults and are
    /// persisted so the next broker to boot sees the same values.
    pub async fn load(&self) -> Result<SystemConfig> {
        let mut config = SystemConfig::default();
        let entries = self.db.get_all_configurations().await?;
        let mut seen = std::collections::HashSet::new();
        for entry in entries {
            if apply_entry(&mut config, &entry.key, &entry.value) {
                seen.insert(entry.key);
            }
        }
        for (key, value) in persisted_pairs(&config) {
            if !seen.contains(key) {
                self.db.upsert_configuration(key, &value).await?;
            }
        }
        self.store.publish(config.clone());
        Ok(config)
    }

    /// Validate and apply an operator edit: persist each changed key,
    /// update the shared view, apply side effects, and broadcast the
    /// reload signal.
    pub async fn edit(&self, request: EditClusterConfigRequest) -> Result<SystemConfig> {
        if !(5..=3600).contains(&request.tiered_storage_time_sec) {
            return Err(Error::Invalid(
                "Tiered storage time can't be less than 5 seconds or more than 60 minutes"
                    .to_string(),
            ));
        }
        if request.max_msg_size_mb < 1 {
            return Err(Error::Invalid(
                "Max message size can't be less than 1 MB".to_string(),
            ));
        }

        let current = self.store.current();
        let mut next = current.clone();
        next.dls_retention_hours = request.dls_retention_hours;
        next.logs_retention_days = request.logs_retention_days;
        next.tiered_storage_time_sec = request.tiered_storage_time_sec;
        next.broker_host = request.broker_host.to_lowercase();
        next.ui_host = request.ui_host.to_lowercase();
        next.rest_gw_host = request.rest_gw_host.to_lowercase();
        next.max_msg_size_mb = request.max_msg_size_mb;

        if next == current {
            return Ok(current);
        }

        for ((key, new_value), (_, old_value)) in persisted_pairs(&next)
            .into_iter()
            .zip(persisted_pairs(&current))
        {
            if new_value != old_value {
                self.db.upsert_configuration(key, &new_value).await?;
            }
        }

        if next.logs_retention_days != current.logs_retention_days {
            self.streams
                .update_syslogs_retention(next.logs_retention())
                .await?;
        }
        // tiered_storage_time_sec propagates through the store watch: the
        // pipeline resets its ticker and rebuilds its consumer. The DLS
        // retention sweeper picks its value up on the next cycle.

        self.store.publish(next.clone());
        self.broadcast_reload().await?;
        Ok(next)
    }

    /// Reload handler for the at-least-once reload signal: re-read the
    /// persisted values and republish. Idempotent.
    pub async fn reload(&self) -> Result<()> {
        let mut config = self.store.current();
        for entry in self.db.get_all_configurations().await? {
            apply_entry(&mut config, &entry.key, &entry.value);
        }
        self.store.publish(config);
        Ok(())
    }

    async fn broadcast_reload(&self) -> Result<()> {
        self.substrate
            .publish(
                GLOBAL_ACCOUNT,
                CONFIG_RELOAD_SIGNAL_SUBJECT,
                None,
                None,
                bytes::Bytes::new(),
            )
            .await?;
        Ok(())
    }
}

fn apply_entry(config: &mut SystemConfig, key: &str, value: &str) -> bool {
    fn parse_i64(key: &str, value: &str) -> Option<i64> {
        match value.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value, "ignoring non-numeric configuration value");
                None
            }
        }
    }

    match key {
        KEY_DLS_RETENTION => {
            if let Some(v) = parse_i64(key, value) {
                config.dls_retention_hours = v;
            }
        }
        KEY_LOGS_RETENTION => {
            if let Some(v) = parse_i64(key, value) {
                config.logs_retention_days = v;
            }
        }
        KEY_TIERED_STORAGE_TIME_SEC => {
            if let Some(v) = parse_i64(key, value) {
                config.tiered_storage_time_sec = v;
            }
        }
        KEY_BROKER_HOST => config.broker_host = value.to_string(),
        KEY_UI_HOST => config.ui_host = value.to_string(),
        KEY_REST_GW_HOST => config.rest_gw_host = value.to_string(),
        KEY_MAX_MSG_SIZE_MB => {
            if let Some(v) = parse_i64(key, value) {
                config.max_msg_size_mb = v;
            }
        }
        KEY_ANALYTICS => config.analytics = value == "true",
        KEY_DEPLOYMENT_ID => config.deployment_id = value.to_string(),
        other => {
            warn!(key = other, "ignoring unknown configuration key");
            return false;
        }
    }
    true
}

fn persisted_pairs(config: &SystemConfig) -> Vec<(&'static str, String)> {
    vec![
        (KEY_DLS_RETENTION, config.dls_retention_hours.to_string()),
        (KEY_LOGS_RETENTION, config.logs_retention_days.to_string()),
        (
            KEY_TIERED_STORAGE_TIME_SEC,
            config.tiered_storage_time_sec.to_string(),
        ),
        (KEY_BROKER_HOST, config.broker_host.clone()),
        (KEY_UI_HOST, config.ui_host.clone()),
        (KEY_REST_GW_HOST, config.rest_gw_host.clone()),
        (KEY_MAX_MSG_SIZE_MB, config.max_msg_size_mb.to_string()),
        (KEY_ANALYTICS, config.analytics.to_string()),
        (KEY_DEPLOYMENT_ID, config.deployment_id.clone()),
    ]
}
