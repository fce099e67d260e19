//! Object-store construction for tiered storage.
//!
//! Builds `object_store` handles from a tenant's S3 integration and caches
//! them per tenant. The in-memory and local-filesystem backends are used by
//! tests and single-node deployments through [`StaticStoreProvider`].

use std::sync::Arc;

use dashmap::DashMap;
use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use tracing::info;

use crate::error::{Error, Result};

use super::integrations::{IntegrationsCache, S3Integration};

/// Build an S3 store from integration settings.
pub fn build_s3_store(integration: &S3Integration) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&integration.bucket_name)
        .with_region(&integration.region);

    if let Some(endpoint) = &integration.url {
        builder = builder.with_endpoint(endpoint).with_allow_http(true);
    }
    if !integration.access_key.is_empty() && !integration.secret_key.is_empty() {
        builder = builder
            .with_access_key_id(&integration.access_key)
            .with_secret_access_key(&integration.secret_key);
    }

    let store = builder
        .build()
        .map_err(|e| Error::Invalid(format!("Failed to create S3 object store: {e}")))?;
    info!(
        bucket = %integration.bucket_name,
        region = %integration.region,
        "Using S3 object store"
    );
    Ok(Arc::new(store))
}

/// Resolves the long-term store of a tenant. Tenants without a configured
/// target resolve to `None` and their batches are skipped (but still
/// acked).
pub trait TieredStoreProvider: Send + Sync + 'static {
    fn store_for(&self, tenant: &str) -> Option<Arc<dyn ObjectStore>>;
}

/// Production provider: builds stores from the integrations cache and
/// keeps them until the integration settings change.
pub struct IntegrationStoreProvider {
    cache: IntegrationsCache,
    built: DashMap<String, (S3Integration, Arc<dyn ObjectStore>)>,
}

impl IntegrationStoreProvider {
    pub fn new(cache: IntegrationsCache) -> Self {
        Self {
            cache,
            built: DashMap::new(),
        }
    }
}

impl TieredStoreProvider for IntegrationStoreProvider {
    fn store_for(&self, tenant: &str) -> Option<Arc<dyn ObjectStore>> {
        let integration = self.cache.s3(tenant)?;
        if let Some(entry) = self.built.get(tenant) {
            let (cached_config, store) = entry.value();
            if *cached_config == integration {
                return Some(Arc::clone(store));
            }
        }
        let store = build_s3_store(&integration).ok()?;
        self.built
            .insert(tenant.to_string(), (integration, Arc::clone(&store)));
        Some(store)
    }
}

/// Fixed tenant → store mapping for tests and embedded deployments.
#[derive(Default)]
pub struct StaticStoreProvider {
    stores: DashMap<String, Arc<dyn ObjectStore>>,
}

impl StaticStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: impl Into<String>, store: Arc<dyn ObjectStore>) {
        self.stores.insert(tenant.into(), store);
    }
}

impl TieredStoreProvider for StaticStoreProvider {
    fn store_for(&self, tenant: &str) -> Option<Arc<dyn ObjectStore>> {
        self.stores.get(tenant).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn builds_s3_store_from_integration() {
        let integration = S3Integration {
            access_key: "ak".into(),
            secret_key: "sk".into(),
            bucket_name: "tier2".into(),
            region: "us-east-1".into(),
            url: Some("http://localhost:9000".into()),
        };
        assert!(build_s3_store(&integration).is_ok());
    }

    #[test]
    fn builds_s3_store_without_credentials() {
        // Credentials may come from the environment or an instance role.
        let integration = S3Integration {
            access_key: String::new(),
            secret_key: String::new(),
            bucket_name: "tier2".into(),
            region: "eu-west-1".into(),
            url: None,
        };
        assert!(build_s3_store(&integration).is_ok());
    }

    #[test]
    fn static_provider_resolves_per_tenant() {
        let provider = StaticStoreProvider::new();
        provider.insert("acme", Arc::new(InMemory::new()));
        assert!(provider.store_for("acme").is_some());
        assert!(provider.store_for("globex").is_none());
    }

    #[test]
    fn integration_provider_requires_configured_tenant() {
        let provider = IntegrationStoreProvider::new(IntegrationsCache::new());
        assert!(provider.store_for("acme").is_none());
    }
}
