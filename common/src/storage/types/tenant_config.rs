use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Which cognitive engine variant a tenant gets.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TwinVariantKind {
    Personal,
    Enterprise,
}

/// When the engine proactively pulls hot temporal context before streaming.
#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HotContextMode {
    Always,
    /// Only when the session buffer has not published a batch recently.
    Stale,
    Never,
}

stored_object!(TenantConfig, "tenant_config", {
    variant: TwinVariantKind,
    /// Persona/voice block placed at the top of the system prompt.
    persona: String,
    /// Tenant-operator instructions appended after the persona.
    instructions: String,
    process_top_k: usize,
    episodic_top_k: usize,
    document_threshold: f32,
    session_min_score: f32,
    hot_context: HotContextMode
});

impl TenantConfig {
    pub fn defaults_for(tenant_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: tenant_id.to_string(),
            created_at: now,
            updated_at: now,
            variant: TwinVariantKind::Personal,
            persona: "You are a thoughtful assistant with durable memory of past \
                      conversations."
                .to_string(),
            instructions: String::new(),
            process_top_k: 5,
            episodic_top_k: 8,
            document_threshold: 0.6,
            session_min_score: 0.5,
            hot_context: HotContextMode::Stale,
        }
    }

    /// Tenant knobs, falling back to the personal defaults for unknown (or
    /// absent) tenants.
    pub async fn get_or_default(
        tenant_id: Option<&str>,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let Some(tenant_id) = tenant_id else {
            return Ok(Self::defaults_for("default"));
        };
        match db.get_item::<Self>(tenant_id).await? {
            Some(config) => Ok(config),
            None => Ok(Self::defaults_for(tenant_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn unknown_tenant_falls_back_to_personal_defaults() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let config = TenantConfig::get_or_default(Some("nobody"), &db)
            .await
            .expect("get config");
        assert_eq!(config.variant, TwinVariantKind::Personal);
        assert_eq!(config.hot_context, HotContextMode::Stale);
    }

    #[tokio::test]
    async fn stored_tenant_config_wins() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let mut config = TenantConfig::defaults_for("acme");
        config.variant = TwinVariantKind::Enterprise;
        config.document_threshold = 0.7;
        db.store_item(config).await.expect("store config");

        let loaded = TenantConfig::get_or_default(Some("acme"), &db)
            .await
            .expect("get config");
        assert_eq!(loaded.variant, TwinVariantKind::Enterprise);
        assert!((loaded.document_threshold - 0.7).abs() < f32::EPSILON);
    }
}
