use crate::{error::AppError, scope::MemoryScope, storage::db::SurrealDbClient, stored_object};

stored_object!(SessionRecord, "session", {
    user_id: Option<String>,
    tenant_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    connected_at: Option<DateTime<Utc>>,
    /// Source of exchange sequence stamps. Only ever incremented.
    sequence_counter: i64
});

impl SessionRecord {
    /// Create or refresh the session row when a connection verifies its scope.
    pub async fn ensure(
        session_id: &str,
        scope: &MemoryScope,
        db: &SurrealDbClient,
    ) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .query(
                "UPSERT type::thing('session', $id) SET \
                    user_id = $user_id, \
                    tenant_id = $tenant_id, \
                    connected_at = IF connected_at != NONE THEN connected_at ELSE time::now() END, \
                    sequence_counter = IF sequence_counter != NONE THEN sequence_counter ELSE 0 END, \
                    created_at = IF created_at != NONE THEN created_at ELSE time::now() END, \
                    updated_at = time::now() \
                 RETURN AFTER",
            )
            .bind(("id", session_id.to_owned()))
            .bind(("user_id", scope.user_id.clone()))
            .bind(("tenant_id", scope.tenant_id.clone()))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::Internal("session upsert returned nothing".into()))
    }

    /// Atomically claim the next sequence index for a session.
    ///
    /// The counter lives on the session row, so stamps equal commit order
    /// regardless of which worker asks.
    pub async fn next_sequence(session_id: &str, db: &SurrealDbClient) -> Result<i64, AppError> {
        let updated: Option<Self> = db
            .client
            .query(
                "UPSERT type::thing('session', $id) SET \
                    sequence_counter = IF sequence_counter != NONE THEN sequence_counter + 1 ELSE 1 END, \
                    created_at = IF created_at != NONE THEN created_at ELSE time::now() END, \
                    updated_at = time::now() \
                 RETURN AFTER",
            )
            .bind(("id", session_id.to_owned()))
            .await?
            .take(0)?;

        updated
            .map(|session| session.sequence_counter)
            .ok_or_else(|| AppError::Internal("sequence upsert returned nothing".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[tokio::test]
    async fn next_sequence_is_strictly_increasing() {
        let db = setup_db().await;

        let mut last = 0;
        for _ in 0..5 {
            let next = SessionRecord::next_sequence("sess-1", &db)
                .await
                .expect("next sequence");
            assert!(next > last, "expected {next} > {last}");
            last = next;
        }
    }

    #[tokio::test]
    async fn counters_are_independent_per_session() {
        let db = setup_db().await;

        SessionRecord::next_sequence("sess-a", &db).await.expect("a1");
        SessionRecord::next_sequence("sess-a", &db).await.expect("a2");
        let b = SessionRecord::next_sequence("sess-b", &db)
            .await
            .expect("b1");
        assert_eq!(b, 1);
    }

    #[tokio::test]
    async fn ensure_keeps_the_counter_across_reconnects() {
        let db = setup_db().await;
        let scope = MemoryScope::for_user("u1");

        SessionRecord::ensure("sess-1", &scope, &db).await.expect("ensure");
        SessionRecord::next_sequence("sess-1", &db).await.expect("seq");
        SessionRecord::next_sequence("sess-1", &db).await.expect("seq");

        let session = SessionRecord::ensure("sess-1", &scope, &db)
            .await
            .expect("re-ensure");
        assert_eq!(session.sequence_counter, 2);
        assert_eq!(session.user_id.as_deref(), Some("u1"));
        assert!(session.connected_at.is_some());
    }
}
