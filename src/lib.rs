//! # stationd
//!
//! A station-oriented, real-time message-broker core layered over a
//! JetStream-style replicated log. This crate is pure Rust all the way
//! down; meaning memory safety, safe concurrency, low resource usage, and
//! speed.
//!
//! # What lives here
//!
//! - **Station lifecycle**: a catalog of stations (named, retention-bound
//!   message streams) backed by a relational metadata store, with the
//!   substrate streams derived from it
//! - **Ingestion & retention**: stream configs derived per station
//!   (age/count/byte retention, storage kind, replicas, producer-dedup
//!   window)
//! - **Dead-letter store**: poison messages (max-deliveries exceeded) and
//!   schema-validation failures, coalesced per (station, sequence) with
//!   resend/ack/journey operations and a retention sweeper
//! - **Tiered storage**: background offload of recent messages to a
//!   per-tenant object store, acked only after durable upload
//! - **Throughput accounting**: per-broker, per-account samples on a
//!   ring-capped stream that the dashboard reads back
//! - **Background orchestration**: every loop is a named task bound to a
//!   shared stop signal
//!
//! Everything is tenant-scoped; each tenant maps to a substrate account
//! and a reserved global account holds the system streams.
//!
//! # What does NOT live here
//!
//! The replicated-log engine itself ([`substrate`] is a contract, with an
//! in-process implementation for embedded use), the HTTP/UI surface, user
//! management, and schema validation semantics are external
//! collaborators.
//!
//! # Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stationd::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> stationd::error::Result<()> {
//!     let bus = Arc::new(MemoryBus::new());
//!     let substrate: Arc<dyn Substrate> = Arc::new(JsApiClient::new(bus));
//!     let db: Arc<dyn MetadataDb> = Arc::new(MemoryMetadataDb::new());
//!
//!     let config = ConfigStore::default();
//!     let streams = Arc::new(StreamManager::new(Arc::clone(&substrate), config.clone()));
//!     streams.create_internal_resources().await?;
//!
//!     let producers = Arc::new(ProducerSessions::new(Arc::clone(&db), Arc::clone(&substrate)));
//!     let registry = StationRegistry::new(db, streams, producers);
//!     registry
//!         .create(
//!             "acme",
//!             CreateStationRequest {
//!                 name: "orders".into(),
//!                 ..Default::default()
//!             },
//!         )
//!         .await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod constants;
pub mod error;
pub mod headers;
pub mod metadata;
pub mod retry;
pub mod substrate;
pub mod telemetry;
pub mod validation;

pub mod prelude {
    //! The types most deployments wire together.

    pub use crate::broker::config::{
        ConfigCoordinator, ConfigStore, EditClusterConfigRequest, SystemConfig,
    };
    pub use crate::broker::dls::DlsEngine;
    pub use crate::broker::integrations::{IntegrationsCache, Notifier};
    pub use crate::broker::sessions::{
        ConsumerSessions, CreateConsumerRequest, ProducerSessions,
    };
    pub use crate::broker::station::{CreateStationRequest, StationName, StationRegistry};
    pub use crate::broker::streams::StreamManager;
    pub use crate::broker::tenants::TenantManager;
    pub use crate::broker::throughput::ThroughputAccountant;
    pub use crate::broker::tiered_storage::TieredStoragePipeline;
    pub use crate::broker::{start_background_tasks, BackgroundDeps, TaskRegistry};
    pub use crate::error::{Error, Result};
    pub use crate::headers::HeaderMap;
    pub use crate::metadata::{MemoryMetadataDb, MetadataDb, PostgresMetadataDb};
    pub use crate::substrate::{Bus, JsApiClient, MemoryBus, Substrate};
}
