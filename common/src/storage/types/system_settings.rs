use crate::storage::types::exchange::deserialize_flexible_id;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::StoredObject};

/// Default system prompt used when a tenant carries no persona of its own.
pub const DEFAULT_PERSONA: &str = "You are a thoughtful assistant with durable memory of past \
conversations. Ground your answers in the supplied context and say so when you \
do not know.";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SystemSettings {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub chat_model: String,
    pub synthesis_model: String,
    pub embedding_model: String,
    pub embedding_dimensions: u32,
    pub default_persona: String,
}

impl StoredObject for SystemSettings {
    fn table_name() -> &'static str {
        "system_settings"
    }

    fn get_id(&self) -> &str {
        &self.id
    }
}

impl SystemSettings {
    pub async fn get_current(db: &SurrealDbClient) -> Result<Self, AppError> {
        let settings: Option<Self> = db.get_item("current").await?;
        settings.ok_or(AppError::NotFound("System settings not found".into()))
    }

    pub async fn update(db: &SurrealDbClient, changes: Self) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .query("UPDATE type::thing('system_settings', 'current') MERGE $changes RETURN AFTER")
            .bind(("changes", changes))
            .await?
            .take(0)?;

        updated.ok_or(AppError::Validation(
            "Something went wrong updating the settings".into(),
        ))
    }

    /// Seed the singleton row on first start. Idempotent.
    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<(), AppError> {
        if db.get_item::<Self>("current").await?.is_some() {
            return Ok(());
        }

        let defaults = Self {
            id: "current".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            synthesis_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-large".to_string(),
            embedding_dimensions: 1024,
            default_persona: DEFAULT_PERSONA.to_string(),
        };
        db.store_item(defaults).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn settings_initialize_once() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        SystemSettings::ensure_initialized(&db).await.expect("init");
        let settings = SystemSettings::get_current(&db).await.expect("get");
        assert_eq!(settings.id, "current");
        assert_eq!(settings.embedding_dimensions, 1024);

        // Idempotent: a second init keeps the row.
        SystemSettings::ensure_initialized(&db)
            .await
            .expect("second init");
        let again = SystemSettings::get_current(&db).await.expect("get again");
        assert_eq!(settings.chat_model, again.chat_model);
    }

    #[tokio::test]
    async fn update_merges_changes() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        SystemSettings::ensure_initialized(&db).await.expect("init");
        let mut settings = SystemSettings::get_current(&db).await.expect("get");
        settings.chat_model = "gpt-4o".to_string();
        SystemSettings::update(&db, settings).await.expect("update");

        let updated = SystemSettings::get_current(&db).await.expect("get");
        assert_eq!(updated.chat_model, "gpt-4o");
    }
}
