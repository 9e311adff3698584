use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use common::{
    error::AppError,
    storage::types::tenant_config::{TenantConfig, TwinVariantKind},
};

use crate::twin::{EngineDeps, EngineTimeouts, EnterpriseTwin, PersonalTwin, Twin};

/// Key under which tenantless sessions resolve their twin.
const DEFAULT_TENANT_KEY: &str = "default";

/// Maps tenant identifiers to twin instances.
///
/// Twins are built lazily from the tenant's stored config and cached for
/// the process lifetime; config changes take effect on restart.
pub struct TwinRegistry {
    deps: EngineDeps,
    timeouts: EngineTimeouts,
    cache: RwLock<HashMap<String, Arc<dyn Twin>>>,
}

impl TwinRegistry {
    pub fn new(deps: EngineDeps, timeouts: EngineTimeouts) -> Self {
        Self {
            deps,
            timeouts,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the twin for a tenant. Unknown tenants get the personal
    /// variant with default knobs.
    pub async fn twin_for(&self, tenant_id: Option<&str>) -> Result<Arc<dyn Twin>, AppError> {
        let key = tenant_id.unwrap_or(DEFAULT_TENANT_KEY).to_string();

        if let Some(twin) = self.cache.read().await.get(&key) {
            return Ok(Arc::clone(twin));
        }

        let config = TenantConfig::get_or_default(tenant_id, &self.deps.db).await?;
        let twin: Arc<dyn Twin> = match config.variant {
            TwinVariantKind::Personal => Arc::new(PersonalTwin::new(
                self.deps.clone(),
                config,
                self.timeouts,
            )),
            TwinVariantKind::Enterprise => Arc::new(EnterpriseTwin::new(
                self.deps.clone(),
                config,
                self.timeouts,
            )),
        };

        info!(tenant = %key, variant = twin.variant(), "twin instantiated");
        let mut cache = self.cache.write().await;
        let entry = cache.entry(key).or_insert(twin);
        Ok(Arc::clone(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::db::SurrealDbClient;
    use common::utils::embedding::EmbeddingClient;
    use common::utils::llm::ScriptedModel;
    use memory_pipeline::{MemoryPipeline, PipelineConfig};
    use uuid::Uuid;

    async fn setup_registry() -> (TwinRegistry, Arc<SurrealDbClient>) {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        db.ensure_initialized(16).await.expect("init");
        let embedder = Arc::new(EmbeddingClient::hashed(16).expect("embedder"));
        let pipeline =
            MemoryPipeline::start(Arc::clone(&db), Arc::clone(&embedder), PipelineConfig::default());
        let deps = EngineDeps {
            db: Arc::clone(&db),
            lm: Arc::new(ScriptedModel::new(vec![])),
            embedder,
            pipeline,
        };
        (
            TwinRegistry::new(deps, EngineTimeouts::default()),
            db,
        )
    }

    #[tokio::test]
    async fn unknown_tenant_resolves_to_personal() {
        let (registry, _db) = setup_registry().await;
        let twin = registry.twin_for(None).await.expect("twin");
        assert_eq!(twin.variant(), "personal");
    }

    #[tokio::test]
    async fn enterprise_config_resolves_to_enterprise_variant() {
        let (registry, db) = setup_registry().await;

        let mut config = TenantConfig::defaults_for("acme");
        config.variant = TwinVariantKind::Enterprise;
        db.store_item(config).await.expect("store config");

        let twin = registry.twin_for(Some("acme")).await.expect("twin");
        assert_eq!(twin.variant(), "enterprise");
    }

    #[tokio::test]
    async fn twins_are_cached_per_tenant() {
        let (registry, _db) = setup_registry().await;
        let first = registry.twin_for(Some("acme")).await.expect("twin");
        let second = registry.twin_for(Some("acme")).await.expect("twin");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
