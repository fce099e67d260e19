//! Background task orchestration.
//!
//! All long-running loops of the broker hang off one [`TaskRegistry`]:
//! named tasks bound to a shared stop signal, each selecting over
//! `{work, stop}` and returning on stop. [`start_background_tasks`] binds
//! every wire subscription first (a bind failure fails the whole call and
//! the process must not proceed), then spawns the loop table:
//!
//! | task | trigger |
//! |---|---|
//! | zombie-conn responder | request on the connection-status subject |
//! | integration updates | event subject |
//! | config reload | reload signal |
//! | notifications | queue group |
//! | poison-msg acks | queue group |
//! | schemaverse DLS | queue group |
//! | DLS retention sweep | every 2 min |
//! | dls-unacked consume | pull loop |
//! | tiered-storage ingest | pull loop |
//! | tiered-storage flush | reconfigurable ticker |
//! | throughput sampler | every 1 s |
//!
//! Once started, individual loop errors log and continue; nothing
//! propagates across tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    CONFIG_RELOAD_SIGNAL_SUBJECT, CONN_STATUS_SUBJECT, DLS_RETENTION_SWEEP_INTERVAL,
    DLS_UNACKED_CONSUMER, DLS_UNACKED_STREAM, GLOBAL_ACCOUNT, INTEGRATIONS_UPDATES_SUBJECT,
    NOTIFICATIONS_SUBJECT, PM_ACKS_SUBJECT, SCHEMAVERSE_DLS_SUBJECT,
};
use crate::error::{Error, Result};
use crate::metadata::MetadataDb;
use crate::substrate::{MaxDeliveriesAdvisory, Subscription, Substrate};

use super::config::ConfigCoordinator;
use super::dls::{DlsEngine, PmAckEvent, SchemaverseDlsEvent};
use super::integrations::{IntegrationUpdateEvent, IntegrationsCache, NotificationEvent, Notifier};
use super::streams::StreamManager;
use super::throughput::ThroughputAccountant;
use super::tiered_storage::TieredStoragePipeline;

const UNACKED_PULL_BATCH: usize = 100;
const UNACKED_PULL_DEADLINE: Duration = Duration::from_secs(5);

// =============================================================================
// Task registry
// =============================================================================

/// Named long-running tasks sharing one stop signal.
#[derive(Debug)]
pub struct TaskRegistry {
    stop_tx: watch::Sender<bool>,
    tasks: HashMap<&'static str, JoinHandle<()>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            tasks: HashMap::new(),
        }
    }

    /// A receiver that flips to `true` on shutdown. Loops that manage
    /// their own select take one of these.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Spawn a named task. The future races the stop signal; it does not
    /// need to watch for shutdown itself.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.stop_tx.subscribe();
        if let Some(old) = self.tasks.remove(name) {
            old.abort();
            debug!(task = name, "replaced running task");
        }
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => debug!(task = name, "task completed"),
                _ = stop.wait_for(|stopped| *stopped) => {
                    debug!(task = name, "task stopped");
                }
            }
        });
        self.tasks.insert(name, handle);
        info!(task = name, "spawned background task");
    }

    /// Spawn a fixed-interval loop.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                work().await;
            }
        });
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks.values().filter(|h| !h.is_finished()).count()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.get(name).is_some_and(|h| !h.is_finished())
    }

    /// Signal stop and wait for the tasks, aborting stragglers at the
    /// deadline.
    pub async fn shutdown(mut self, timeout: Duration) {
        info!(task_count = self.tasks.len(), "stopping background tasks");
        let _ = self.stop_tx.send(true);
        let deadline = tokio::time::Instant::now() + timeout;
        for (name, handle) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                handle.abort();
                warn!(task = name, "aborted task at shutdown deadline");
                continue;
            }
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "task panicked during shutdown"),
                Err(_) => warn!(task = name, "task ignored stop signal, aborted"),
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        for handle in self.tasks.values() {
            handle.abort();
        }
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Everything the background tasks need, wired at construction.
pub struct BackgroundDeps {
    pub substrate: Arc<dyn Substrate>,
    pub db: Arc<dyn MetadataDb>,
    pub streams: Arc<StreamManager>,
    pub dls: Arc<DlsEngine>,
    pub tiered: Arc<TieredStoragePipeline>,
    pub throughput: Arc<ThroughputAccountant>,
    pub coordinator: Arc<ConfigCoordinator>,
    pub integrations: IntegrationsCache,
    pub notifier: Notifier,
}

/// Bind every subscription and spawn the loop table. A subscription bind
/// failure fails the call; the caller must treat that as fatal.
pub async fn start_background_tasks(deps: BackgroundDeps) -> Result<TaskRegistry> {
    let subscribe = |subject: &'static str, queue: Option<&'static str>| {
        let substrate = Arc::clone(&deps.substrate);
        async move {
            substrate
                .subscribe(GLOBAL_ACCOUNT, subject, queue)
                .await
                .map_err(|e| Error::Fatal(format!("failed subscribing on {subject}: {e}")))
        }
    };

    // Bind everything before spawning anything: a half-wired broker is
    // worse than a dead one.
    let conn_status_sub = subscribe(CONN_STATUS_SUBJECT, None).await?;
    let integrations_sub = subscribe(INTEGRATIONS_UPDATES_SUBJECT, None).await?;
    let reload_sub = subscribe(CONFIG_RELOAD_SIGNAL_SUBJECT, None).await?;
    let notifications_sub =
        subscribe(NOTIFICATIONS_SUBJECT, Some("$memphis_notifications_group")).await?;
    let pm_acks_sub = subscribe(PM_ACKS_SUBJECT, Some("$memphis_pm_acks_group")).await?;
    let schemaverse_sub =
        subscribe(SCHEMAVERSE_DLS_SUBJECT, Some("$memphis_schemaverse_dls_group")).await?;

    deps.throughput.init().await?;

    let mut registry = TaskRegistry::new();

    registry.spawn("zombie_conn_check", {
        let substrate = Arc::clone(&deps.substrate);
        zombie_conn_loop(substrate, conn_status_sub)
    });

    registry.spawn("integration_updates", {
        let integrations = deps.integrations.clone();
        let db = Arc::clone(&deps.db);
        let coordinator = Arc::clone(&deps.coordinator);
        integration_updates_loop(integrations, db, coordinator, integrations_sub)
    });

    registry.spawn("config_reload", {
        let coordinator = Arc::clone(&deps.coordinator);
        async move {
            let mut sub = reload_sub;
            while sub.recv().await.is_some() {
                if let Err(e) = coordinator.reload().await {
                    warn!("config_reload: {e}");
                }
            }
        }
    });

    registry.spawn("notifications", {
        let notifier = deps.notifier.clone();
        async move {
            let mut sub = notifications_sub;
            while let Some(msg) = sub.recv().await {
                match serde_json::from_slice::<NotificationEvent>(&msg.payload) {
                    Ok(event) => {
                        if let Err(e) = notifier.dispatch(&event).await {
                            warn!("notifications: {e}");
                        }
                    }
                    Err(e) => warn!("notifications: bad event: {e}"),
                }
            }
        }
    });

    registry.spawn("pm_acks", {
        let dls = Arc::clone(&deps.dls);
        async move {
            let mut sub = pm_acks_sub;
            while let Some(msg) = sub.recv().await {
                match serde_json::from_slice::<PmAckEvent>(&msg.payload) {
                    Ok(event) => {
                        if let Err(e) = dls.handle_pm_ack(&event).await {
                            warn!("pm_acks: {e}");
                        }
                    }
                    Err(e) => warn!("pm_acks: bad event: {e}"),
                }
            }
        }
    });

    registry.spawn("schemaverse_dls", {
        let dls = Arc::clone(&deps.dls);
        async move {
            let mut sub = schemaverse_sub;
            while let Some(msg) = sub.recv().await {
                match serde_json::from_slice::<SchemaverseDlsEvent>(&msg.payload) {
                    Ok(event) => {
                        if let Err(e) = dls.process_schema_failure(&event).await {
                            warn!("schemaverse_dls: {e}");
                        }
                    }
                    Err(e) => warn!("schemaverse_dls: bad event: {e}"),
                }
            }
        }
    });

    registry.spawn_periodic("dls_retention_sweep", DLS_RETENTION_SWEEP_INTERVAL, {
        let dls = Arc::clone(&deps.dls);
        move || {
            let dls = Arc::clone(&dls);
            async move {
                match dls.sweep_retention().await {
                    Ok(0) => {}
                    Ok(n) => info!("dls_retention_sweep: removed {n} expired records"),
                    Err(e) => warn!("dls_retention_sweep: {e}"),
                }
            }
        }
    });

    registry.spawn("dls_unacked_consume", {
        let substrate = Arc::clone(&deps.substrate);
        let dls = Arc::clone(&deps.dls);
        unacked_consume_loop(substrate, dls)
    });

    registry.spawn("tiered_storage_ingest", {
        let tiered = Arc::clone(&deps.tiered);
        let stop = registry.stop_signal();
        async move { tiered.run_ingest(stop).await }
    });

    registry.spawn("tiered_storage_flush", {
        let tiered = Arc::clone(&deps.tiered);
        let stop = registry.stop_signal();
        async move { tiered.run_flush(stop).await }
    });

    registry.spawn("throughput_sampler", {
        let throughput = Arc::clone(&deps.throughput);
        let stop = registry.stop_signal();
        async move { throughput.run(stop).await }
    });

    Ok(registry)
}

/// Reply to connection-status requests with the set of live connection
/// ids, as a JSON map of id → "".
async fn zombie_conn_loop(substrate: Arc<dyn Substrate>, mut sub: Subscription) {
    while let Some(msg) = sub.recv().await {
        let Some(reply) = msg.reply else { continue };
        let connections = match substrate.connections().await {
            Ok(connections) => connections,
            Err(e) => {
                warn!("zombie_conn_check: {e}");
                continue;
            }
        };
        let ids: HashMap<&str, &str> = connections
            .iter()
            .filter_map(|c| c.connection_id())
            .map(|id| (id, ""))
            .collect();
        if ids.is_empty() {
            continue;
        }
        let payload = serde_json::to_vec(&ids).expect("id map serializes");
        if let Err(e) = substrate
            .publish(GLOBAL_ACCOUNT, &reply, None, None, payload.into())
            .await
        {
            warn!("zombie_conn_check: reply failed: {e}");
        }
    }
}

/// Keep the integrations cache in sync with wire updates. A Slack event
/// may also seed the UI host the first time one is configured.
async fn integration_updates_loop(
    integrations: IntegrationsCache,
    db: Arc<dyn MetadataDb>,
    coordinator: Arc<ConfigCoordinator>,
    mut sub: Subscription,
) {
    while let Some(msg) = sub.recv().await {
        let event: IntegrationUpdateEvent = match serde_json::from_slice(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("integration_updates: bad event: {e}");
                continue;
            }
        };
        if integrations.apply_update(&event).is_err() {
            continue;
        }
        if event.name.eq_ignore_ascii_case("slack") {
            if let Some(ui_url) = &event.ui_url {
                if !ui_url.is_empty() && coordinator.store().current().ui_host.is_empty() {
                    if let Err(e) = db.upsert_configuration("ui_host", ui_url).await {
                        warn!("integration_updates: ui_host persist failed: {e}");
                    } else if let Err(e) = coordinator.reload().await {
                        warn!("integration_updates: {e}");
                    }
                }
            }
        }
    }
}

/// Drain the dls-unacked work queue: each advisory is acked only after the
/// engine stored (or legitimately skipped) it.
async fn unacked_consume_loop(substrate: Arc<dyn Substrate>, dls: Arc<DlsEngine>) {
    loop {
        let pulled = match substrate
            .pull_next(
                GLOBAL_ACCOUNT,
                DLS_UNACKED_STREAM,
                DLS_UNACKED_CONSUMER,
                UNACKED_PULL_BATCH,
                UNACKED_PULL_DEADLINE,
            )
            .await
        {
            Ok(pulled) => pulled,
            Err(e) => {
                warn!("dls_unacked: pull failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        for msg in pulled {
            let advisory: MaxDeliveriesAdvisory = match serde_json::from_slice(&msg.msg.data) {
                Ok(advisory) => advisory,
                Err(e) => {
                    // A malformed advisory can never succeed; drop it.
                    warn!("dls_unacked: bad advisory: {e}");
                    ack(&substrate, &msg.reply_subject).await;
                    continue;
                }
            };
            match dls.process_advisory(&advisory).await {
                Ok(_) => ack(&substrate, &msg.reply_subject).await,
                // Leave unacked; the work queue redelivers.
                Err(e) => {
                    let tenant = if advisory.account.is_empty() {
                        GLOBAL_ACCOUNT
                    } else {
                        advisory.account.as_str()
                    };
                    warn!("[tenant: {tenant}]dls_unacked: {e}");
                }
            }
        }
    }
}

async fn ack(substrate: &Arc<dyn Substrate>, reply_subject: &str) {
    if let Err(e) = substrate
        .publish(GLOBAL_ACCOUNT, reply_subject, None, None, Bytes::new())
        .await
    {
        warn!("dls_unacked: ack failed: {e}");
    }
}
