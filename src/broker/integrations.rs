//! Integration cache and notification dispatch.
//!
//! Integration settings arrive as update events on the wire with untyped
//! key/property maps. They are parsed into the tagged [`Integration`] type
//! at the edge; unknown kinds are rejected there and nothing downstream
//! ever sees a raw map.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Alert categories a Slack integration can toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    PoisonMessage,
    SchemaValidationFail,
    DisconnectionEvents,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::PoisonMessage => "poison_message_alert",
            AlertType::SchemaValidationFail => "schema_validation_fail_alert",
            AlertType::DisconnectionEvents => "disconnection_events_alert",
        }
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "poison_message_alert" => Ok(AlertType::PoisonMessage),
            "schema_validation_fail_alert" => Ok(AlertType::SchemaValidationFail),
            "disconnection_events_alert" => Ok(AlertType::DisconnectionEvents),
            other => Err(format!("unknown alert type {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackIntegration {
    pub auth_token: String,
    pub channel_id: String,
    pub poison_message_alert: bool,
    pub schema_validation_fail_alert: bool,
    pub disconnection_events_alert: bool,
}

impl SlackIntegration {
    pub fn alert_enabled(&self, alert: AlertType) -> bool {
        match alert {
            AlertType::PoisonMessage => self.poison_message_alert,
            AlertType::SchemaValidationFail => self.schema_validation_fail_alert,
            AlertType::DisconnectionEvents => self.disconnection_events_alert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Integration {
    pub access_key: String,
    pub secret_key: String,
    pub bucket_name: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services.
    pub url: Option<String>,
}

/// A configured integration, tagged per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integration {
    Slack(SlackIntegration),
    S3(S3Integration),
}

impl Integration {
    pub fn kind(&self) -> &'static str {
        match self {
            Integration::Slack(_) => "slack",
            Integration::S3(_) => "s3",
        }
    }
}

/// The wire shape of an integration create/update event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationUpdateEvent {
    pub name: String,
    #[serde(default)]
    pub keys: HashMap<String, String>,
    #[serde(default)]
    pub properties: HashMap<String, bool>,
    #[serde(default)]
    pub ui_url: Option<String>,
    #[serde(default)]
    pub tenant_name: String,
}

impl Integration {
    /// Parse an update event into its typed form. Unknown kinds are
    /// rejected here, at the edge.
    pub fn from_event(event: &IntegrationUpdateEvent) -> Result<Self> {
        let key = |name: &str| event.keys.get(name).cloned().unwrap_or_default();
        match event.name.to_lowercase().as_str() {
            "slack" => Ok(Integration::Slack(SlackIntegration {
                auth_token: key("auth_token"),
                channel_id: key("channel_id"),
                poison_message_alert: event
                    .properties
                    .get(AlertType::PoisonMessage.as_str())
                    .copied()
                    .unwrap_or(false),
                schema_validation_fail_alert: event
                    .properties
                    .get(AlertType::SchemaValidationFail.as_str())
                    .copied()
                    .unwrap_or(false),
                disconnection_events_alert: event
                    .properties
                    .get(AlertType::DisconnectionEvents.as_str())
                    .copied()
                    .unwrap_or(false),
            })),
            "s3" => Ok(Integration::S3(S3Integration {
                access_key: key("access_key"),
                secret_key: key("secret_key"),
                bucket_name: key("bucket_name"),
                region: key("region"),
                url: event.keys.get("url").filter(|u| !u.is_empty()).cloned(),
            })),
            other => Err(Error::Invalid(format!("{other} unknown integration"))),
        }
    }
}

/// Per-tenant cache of parsed integrations, updated from wire events.
#[derive(Clone, Default)]
pub struct IntegrationsCache {
    // (tenant, kind) → integration
    map: Arc<DashMap<(String, &'static str), Integration>>,
}

impl IntegrationsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a wire update. Unknown kinds warn and leave the cache
    /// untouched.
    pub fn apply_update(&self, event: &IntegrationUpdateEvent) -> Result<()> {
        let integration = Integration::from_event(event).map_err(|e| {
            warn!("integration_update: {e}");
            e
        })?;
        let kind = integration.kind();
        self.map
            .insert((event.tenant_name.clone(), kind), integration);
        Ok(())
    }

    pub fn remove(&self, tenant: &str, kind: &'static str) {
        self.map.remove(&(tenant.to_string(), kind));
    }

    pub fn slack(&self, tenant: &str) -> Option<SlackIntegration> {
        match self.map.get(&(tenant.to_string(), "slack")) {
            Some(entry) => match entry.value() {
                Integration::Slack(slack) => Some(slack.clone()),
                _ => None,
            },
            None => None,
        }
    }

    pub fn s3(&self, tenant: &str) -> Option<S3Integration> {
        match self.map.get(&(tenant.to_string(), "s3")) {
            Some(entry) => match entry.value() {
                Integration::S3(s3) => Some(s3.clone()),
                _ => None,
            },
            None => None,
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// The wire shape of a notification event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub title: String,
    pub msg: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub alert_type: String,
    #[serde(default)]
    pub tenant_name: String,
}

/// Delivery seam for notifications. The concrete channel (Slack webhook,
/// etc.) lives behind this trait in the integration surface.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn send(&self, tenant: &str, channel_id: &str, title: &str, msg: &str) -> Result<()>;
}

/// Default sink: structured log only. Deployments without a chat
/// integration still get an operator-visible record.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, tenant: &str, _channel_id: &str, title: &str, msg: &str) -> Result<()> {
        info!("[tenant: {tenant}]notification: {title}: {msg}");
        Ok(())
    }
}

/// Routes notifications to the tenant's enabled channels.
#[derive(Clone)]
pub struct Notifier {
    cache: IntegrationsCache,
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub fn new(cache: IntegrationsCache, sink: Arc<dyn NotificationSink>) -> Self {
        Self { cache, sink }
    }

    /// Send a notification if the tenant has the matching alert enabled.
    /// Callers treat failures as non-fatal.
    pub async fn notify(
        &self,
        tenant: &str,
        alert: AlertType,
        title: &str,
        msg: &str,
    ) -> Result<()> {
        let Some(slack) = self.cache.slack(tenant) else {
            return Ok(());
        };
        if !slack.alert_enabled(alert) {
            return Ok(());
        }
        self.sink.send(tenant, &slack.channel_id, title, msg).await
    }

    /// Dispatch a wire notification event (queue-group consumer path).
    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<()> {
        let alert: AlertType = event
            .alert_type
            .parse()
            .map_err(Error::Invalid)?;
        let msg = match &event.code {
            Some(code) if !code.is_empty() => format!("{}\n```{}```", event.msg, code),
            _ => event.msg.clone(),
        };
        self.notify(&event.tenant_name, alert, &event.title, &msg)
            .await
    }
}
