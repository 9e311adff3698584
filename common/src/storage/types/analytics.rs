use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Analytics, "analytics", {
    total_sessions: u64,
    total_turns: u64,
    total_tool_invocations: u64
});

impl Analytics {
    /// Seed the singleton row. Idempotent.
    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<(), AppError> {
        if db.get_item::<Self>("current").await?.is_some() {
            return Ok(());
        }
        let now = Utc::now();
        db.store_item(Self {
            id: "current".to_string(),
            created_at: now,
            updated_at: now,
            total_sessions: 0,
            total_turns: 0,
            total_tool_invocations: 0,
        })
        .await?;
        Ok(())
    }

    pub async fn record_session(db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('analytics', 'current') \
                 SET total_sessions += 1, updated_at = time::now()",
            )
            .await?;
        Ok(())
    }

    pub async fn record_turn(db: &SurrealDbClient, tool_invocations: usize) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('analytics', 'current') \
                 SET total_turns += 1, total_tool_invocations += $tools, updated_at = time::now()",
            )
            .bind(("tools", tool_invocations as i64))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn counters_accumulate() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        Analytics::ensure_initialized(&db).await.expect("init");
        Analytics::record_session(&db).await.expect("session");
        Analytics::record_turn(&db, 2).await.expect("turn");
        Analytics::record_turn(&db, 0).await.expect("turn");

        let analytics: Analytics = db.get_item("current").await.expect("get").expect("exists");
        assert_eq!(analytics.total_sessions, 1);
        assert_eq!(analytics.total_turns, 2);
        assert_eq!(analytics.total_tool_invocations, 2);
    }
}
