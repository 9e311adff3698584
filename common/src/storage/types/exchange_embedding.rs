use surrealdb::RecordId;

use crate::storage::types::exchange::Exchange;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ExchangeEmbedding, "exchange_embedding", {
    /// Record link to the owning exchange
    exchange_id: RecordId,
    /// Denormalized session id for buffer reconciliation
    session_id: String,
    /// Denormalized owner ids, duplicated here so scope filtering happens
    /// before the vector operator runs
    user_id: Option<String>,
    tenant_id: Option<String>,
    embedding: Vec<f32>
});

impl ExchangeEmbedding {
    /// `exchange_id` is the **key** part of the exchange id, not
    /// "exchange:<key>". The embedding row reuses it so the mapping stays 1:1.
    pub fn new(
        exchange_id: &str,
        session_id: String,
        user_id: Option<String>,
        tenant_id: Option<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: exchange_id.to_owned(),
            created_at: now,
            updated_at: now,
            exchange_id: RecordId::from_table_key(Exchange::table_name(), exchange_id),
            session_id,
            user_id,
            tenant_id,
            embedding,
        }
    }

    pub async fn get_by_exchange_id(
        exchange_id: &RecordId,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let query = format!(
            "SELECT * FROM {} WHERE exchange_id = $exchange_id LIMIT 1",
            Self::table_name()
        );

        let mut result = db
            .client
            .query(query)
            .bind(("exchange_id", exchange_id.clone()))
            .await
            .map_err(AppError::Database)?;

        let embeddings: Vec<Self> = result.take(0).map_err(AppError::Database)?;

        Ok(embeddings.into_iter().next())
    }
}
