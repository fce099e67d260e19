//! The broker core.
//!
//! Each subsystem is an independent module depending only on the substrate
//! contract ([`crate::substrate`]), the metadata store
//! ([`crate::metadata`]), and the shared [`config::ConfigStore`], wired
//! together at construction, never through a god object.
//!
//! Dependency order, leaves first: substrate → [`streams`]/[`station`] →
//! [`sessions`] → [`dls`] + [`tiered_storage`] + [`throughput`] →
//! [`background`] → [`config`] (which can affect all of the above).

pub mod background;
pub mod config;
pub mod dls;
pub mod integrations;
pub mod object_store;
pub mod sessions;
pub mod station;
pub mod streams;
pub mod tenants;
pub mod throughput;
pub mod tiered_storage;

pub use background::{start_background_tasks, BackgroundDeps, TaskRegistry};
pub use config::{ConfigCoordinator, ConfigStore, EditClusterConfigRequest, SystemConfig};
pub use dls::DlsEngine;
pub use integrations::{Integration, IntegrationsCache, NotificationSink, Notifier};
pub use sessions::{ConsumerSessions, ProducerSessions, SchemaUpdate};
pub use station::{StationName, StationRegistry};
pub use streams::StreamManager;
pub use tenants::TenantManager;
pub use throughput::ThroughputAccountant;
pub use tiered_storage::TieredStoragePipeline;
