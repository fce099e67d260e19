//! The tenant / account boundary.
//!
//! Each tenant maps 1:1 to a substrate account; everything the core does
//! is scoped by tenant. System streams live in the reserved global account
//! and are reachable from tenant accounts through a fixed set of service
//! exports (listed here) with matching imports on every tenant account.
//!
//! Tenants are created on first use and destroyed only explicitly;
//! destruction purges every substrate stream the account owns before the
//! metadata rows go.

use std::sync::Arc;

use rand::Rng;
use tracing::info;

use crate::constants::{
    CONN_STATUS_SUBJECT, INTEGRATIONS_UPDATES_SUBJECT, MAX_DELIVERIES_ADVISORY_PREFIX,
    NOTIFICATIONS_SUBJECT, PM_ACKS_SUBJECT, SCHEMAVERSE_DLS_SUBJECT,
};
use crate::error::{Error, Result};
use crate::metadata::{MetadataDb, Tenant};
use crate::substrate::Substrate;

const CREDENTIAL_LENGTH: usize = 12;
const CREDENTIAL_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$";

/// Service subjects the global account exports to tenant accounts.
pub fn exported_service_subjects() -> Vec<String> {
    let mut subjects: Vec<String> = [
        "$memphis_station_creations",
        "$memphis_station_destructions",
        "$memphis_producer_creations",
        "$memphis_producer_destructions",
        "$memphis_consumer_creations",
        "$memphis_consumer_destructions",
        "$memphis_schema_attachments",
        "$memphis_schema_detachments",
        "$memphis_schema_creations",
        "$memphis_ws_subs.>",
        INTEGRATIONS_UPDATES_SUBJECT,
        NOTIFICATIONS_SUBJECT,
        SCHEMAVERSE_DLS_SUBJECT,
        PM_ACKS_SUBJECT,
        CONN_STATUS_SUBJECT,
    ]
    .into_iter()
    .map(str::to_string)
    .collect();
    subjects.push(format!("{MAX_DELIVERIES_ADVISORY_PREFIX}.>"));
    subjects
}

/// Stream subjects the global account exports (UI fan-out path).
pub fn exported_stream_subjects() -> Vec<String> {
    vec!["$memphis_ws_pubs.>".to_string()]
}

pub struct TenantManager {
    db: Arc<dyn MetadataDb>,
    substrate: Arc<dyn Substrate>,
}

impl TenantManager {
    pub fn new(db: Arc<dyn MetadataDb>, substrate: Arc<dyn Substrate>) -> Self {
        Self { db, substrate }
    }

    /// Create the tenant row on first use; subsequent calls return the
    /// existing row. Names are lowercase-unique.
    pub async fn ensure(&self, name: &str) -> Result<Tenant> {
        let name = name.to_lowercase();
        if name.is_empty() {
            return Err(Error::Invalid("Tenant name can not be empty".to_string()));
        }
        let credential = generate_internal_credential();
        Ok(self.db.upsert_tenant(&name, &credential).await?)
    }

    pub async fn get(&self, name: &str) -> Result<Tenant> {
        self.db
            .get_tenant(&name.to_lowercase())
            .await?
            .ok_or_else(|| Error::NotFound(format!("Tenant {name} does not exist")))
    }

    pub async fn list(&self) -> Result<Vec<Tenant>> {
        Ok(self.db.list_tenants().await?)
    }

    /// Destroy a tenant: purge every stream its account owns, then remove
    /// its metadata rows.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let name = name.to_lowercase();
        if name == crate::constants::GLOBAL_ACCOUNT {
            return Err(Error::Invalid(
                "The global account can not be removed".to_string(),
            ));
        }
        self.db
            .get_tenant(&name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Tenant {name} does not exist")))?;
        self.substrate.purge_account(&name).await?;
        self.db.delete_tenant(&name).await?;
        info!("[tenant: {name}]remove_tenant: tenant has been removed");
        Ok(())
    }
}

/// Generate the tenant's internal service credential. At-rest protection
/// is the metadata deployment's concern.
fn generate_internal_credential() -> String {
    let mut rng = rand::thread_rng();
    (0..CREDENTIAL_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..CREDENTIAL_CHARSET.len());
            CREDENTIAL_CHARSET[idx] as char
        })
        .collect()
}
