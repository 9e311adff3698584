#![allow(clippy::module_name_repetitions)]
use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::{
    error::AppError, scope::MemoryScope, storage::db::SurrealDbClient,
    storage::types::exchange_embedding::ExchangeEmbedding,
    storage::types::session::SessionRecord, stored_object,
};

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeSource {
    Chat,
    ImportAnthropic,
    ImportOpenai,
    Other,
}

/// Per-exchange boolean markers derived from the turn content.
#[derive(Deserialize, Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ExchangeFlags {
    pub has_code: bool,
    pub has_error: bool,
    pub action_required: bool,
    /// Set when the turn was cut short (deadline, disconnect, stream error)
    /// and only partial assistant content was captured.
    pub partial: bool,
}

stored_object!(Exchange, "exchange", {
    session_id: String,
    user_id: Option<String>,
    tenant_id: Option<String>,
    /// Strictly increasing within a session; equals commit order.
    sequence_index: i64,
    human_content: String,
    assistant_content: String,
    source: ExchangeSource,
    intent_type: Option<String>,
    complexity: Option<String>,
    technical_depth: u8,
    emotional_valence: Option<String>,
    urgency: Option<String>,
    conversation_mode: Option<String>,
    flags: ExchangeFlags,
    tags: HashMap<String, String>,
    /// -1 means noise / unassigned.
    cluster_id: i64,
    cluster_confidence: f32,
    access_count: u32,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_accessed: Option<DateTime<Utc>>
});

/// An exchange hydrated together with a retrieval score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeSearchResult {
    pub exchange: Exchange,
    pub score: f32,
}

impl Exchange {
    /// Content-addressed id: ingesting the same turn twice is a no-op beyond
    /// the first commit.
    pub fn content_hash_id(session_id: &str, human: &str, assistant: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0]);
        hasher.update(human.as_bytes());
        hasher.update([0]);
        hasher.update(assistant.as_bytes());
        let digest = hasher.finalize();
        let hex = format!("{digest:x}");
        hex[..32].to_string()
    }

    pub fn new(
        session_id: String,
        user_id: Option<String>,
        tenant_id: Option<String>,
        human_content: String,
        assistant_content: String,
        source: ExchangeSource,
    ) -> Self {
        let now = Utc::now();
        let id = Self::content_hash_id(&session_id, &human_content, &assistant_content);
        Self {
            id,
            created_at: now,
            updated_at: now,
            session_id,
            user_id,
            tenant_id,
            sequence_index: -1,
            human_content,
            assistant_content,
            source,
            intent_type: None,
            complexity: None,
            technical_depth: 0,
            emotional_valence: None,
            urgency: None,
            conversation_mode: None,
            flags: ExchangeFlags::default(),
            tags: HashMap::new(),
            cluster_id: -1,
            cluster_confidence: 0.0,
            access_count: 0,
            last_accessed: None,
        }
    }

    /// Durably commit an exchange plus its optional embedding.
    ///
    /// Stamps `sequence_index` from the session counter when the caller has
    /// not already assigned one. Re-committing an id is a no-op and returns
    /// the existing id.
    pub async fn record(
        mut exchange: Exchange,
        embedding: Option<Vec<f32>>,
        db: &SurrealDbClient,
    ) -> Result<String, AppError> {
        if exchange.user_id.is_none() && exchange.tenant_id.is_none() {
            return Err(AppError::Validation(
                "exchange requires a user_id or a tenant_id".into(),
            ));
        }

        if let Some(existing) = db.get_item::<Exchange>(&exchange.id).await? {
            return Ok(existing.id);
        }

        if exchange.sequence_index < 0 {
            exchange.sequence_index =
                SessionRecord::next_sequence(&exchange.session_id, db).await?;
        }

        let exchange_id = exchange.id.clone();
        let emb_row = embedding.map(|vector| {
            ExchangeEmbedding::new(
                &exchange_id,
                exchange.session_id.clone(),
                exchange.user_id.clone(),
                exchange.tenant_id.clone(),
                vector,
            )
        });

        // Exchange row and embedding row commit together or not at all.
        let mut query = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(format!(
                "CREATE type::thing('{table}', $exchange_id) CONTENT $exchange;",
                table = Self::table_name(),
            ))
            .bind(("exchange_id", exchange_id.clone()))
            .bind(("exchange", exchange));

        if let Some(emb) = emb_row {
            query = query
                .query(format!(
                    "CREATE type::thing('{table}', $emb_id) CONTENT $emb;",
                    table = ExchangeEmbedding::table_name(),
                ))
                .bind(("emb_id", emb.id.clone()))
                .bind(("emb", emb));
        }

        let response = query
            .query("COMMIT TRANSACTION;")
            .await
            .map_err(AppError::Database)?;
        response.check().map_err(AppError::Database)?;

        Ok(exchange_id)
    }

    /// Most-recent-first exchanges within scope, optionally bounded in time.
    pub async fn recent(
        scope: &MemoryScope,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Exchange>, AppError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = format!(
            "SELECT * FROM {table} WHERE {scope}",
            table = Self::table_name(),
            scope = scope_clause(),
        );
        if since.is_some() {
            sql.push_str(" AND created_at >= $since");
        }
        if until.is_some() {
            sql.push_str(" AND created_at <= $until");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT $limit");

        let mut query = db
            .client
            .query(sql)
            .bind(("scope_user", scope.user_id.clone()))
            .bind(("scope_tenant", scope.tenant_id.clone()))
            .bind(("limit", limit as i64));
        if let Some(from) = since {
            query = query.bind(("since", surrealdb::sql::Datetime::from(from)));
        }
        if let Some(to) = until {
            query = query.bind(("until", surrealdb::sql::Datetime::from(to)));
        }

        let mut response = query.await.map_err(AppError::Database)?;
        let rows: Vec<Exchange> = response.take(0).map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Exchanges within an explicit time window, most-recent-first.
    pub async fn by_time_range(
        scope: &MemoryScope,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<Exchange>, AppError> {
        Self::recent(scope, Some(from), Some(to), limit, db).await
    }

    /// Hydrate a set of exchange ids. Rows outside the scope are dropped.
    pub async fn by_ids(
        scope: &MemoryScope,
        ids: &[String],
        db: &SurrealDbClient,
    ) -> Result<Vec<Exchange>, AppError> {
        if scope.is_empty() || ids.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();

        let sql = format!(
            "SELECT * FROM {table} WHERE id IN $things AND {scope}",
            table = Self::table_name(),
            scope = scope_clause(),
        );

        let mut response = db
            .client
            .query(sql)
            .bind(("things", things))
            .bind(("scope_user", scope.user_id.clone()))
            .bind(("scope_tenant", scope.tenant_id.clone()))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<Exchange> = response.take(0).map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Scoped dense search over the embedding table.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        scope: &MemoryScope,
        db: &SurrealDbClient,
    ) -> Result<Vec<ExchangeSearchResult>, AppError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        #[allow(clippy::missing_docs_in_private_items)]
        #[derive(Deserialize)]
        struct Row {
            exchange_id: Exchange,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                exchange_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {emb_table}
            WHERE {scope}
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH exchange_id;
            "#,
            emb_table = ExchangeEmbedding::table_name(),
            scope = scope_clause(),
            take = take
        );

        let mut response = db
            .client
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("scope_user", scope.user_id.clone()))
            .bind(("scope_tenant", scope.tenant_id.clone()))
            .await
            .map_err(|e| AppError::Internal(format!("Surreal query failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|r| ExchangeSearchResult {
                exchange: r.exchange_id,
                score: r.score,
            })
            .collect())
    }

    /// Scoped BM25 search over both sides of the exchange, optionally
    /// narrowed to a time window.
    pub async fn fts_search(
        take: usize,
        terms: &str,
        scope: &MemoryScope,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        db: &SurrealDbClient,
    ) -> Result<Vec<ExchangeSearchResult>, AppError> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let mut filter = format!(
            "(human_content @0@ $terms OR assistant_content @1@ $terms) AND {}",
            scope_clause()
        );
        if from.is_some() {
            filter.push_str(" AND created_at >= $from");
        }
        if to.is_some() {
            filter.push_str(" AND created_at <= $to");
        }

        let sql = format!(
            r#"
            SELECT
                id,
                (IF search::score(0) != NONE THEN search::score(0) ELSE 0 END) +
                (IF search::score(1) != NONE THEN search::score(1) ELSE 0 END) AS score
            FROM {table}
            WHERE {filter}
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            table = Self::table_name(),
        );

        #[allow(clippy::missing_docs_in_private_items)]
        #[derive(Deserialize)]
        struct ScoreRow {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            score: Option<f32>,
        }

        let mut query = db
            .client
            .query(&sql)
            .bind(("terms", terms.to_owned()))
            .bind(("scope_user", scope.user_id.clone()))
            .bind(("scope_tenant", scope.tenant_id.clone()))
            .bind(("limit", take as i64));
        if let Some(from) = from {
            query = query.bind(("from", surrealdb::sql::Datetime::from(from)));
        }
        if let Some(to) = to {
            query = query.bind(("to", surrealdb::sql::Datetime::from(to)));
        }

        let mut response = query.await.map_err(AppError::Database)?;
        let score_rows: Vec<ScoreRow> = response.take(0).map_err(AppError::Database)?;

        if score_rows.is_empty() {
            return Ok(Vec::new());
        }

        // Hydrate full rows, then stitch the scores back on in rank order.
        let ids: Vec<String> = score_rows.iter().map(|row| row.id.clone()).collect();
        let hydrated = Self::by_ids(scope, &ids, db).await?;
        let mut by_id: std::collections::HashMap<String, Exchange> = hydrated
            .into_iter()
            .map(|exchange| (exchange.id.clone(), exchange))
            .collect();

        let mut results = Vec::with_capacity(score_rows.len());
        for row in score_rows {
            if let Some(exchange) = by_id.remove(&row.id) {
                results.push(ExchangeSearchResult {
                    exchange,
                    score: row.score.unwrap_or_default(),
                });
            }
        }

        Ok(results)
    }

    /// Bump access bookkeeping on retrieval hits. The only mutation an
    /// exchange sees after commit.
    pub async fn touch(ids: &[String], db: &SurrealDbClient) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((Self::table_name(), id.as_str())))
            .collect();
        db.client
            .query(format!(
                "UPDATE {table} SET access_count += 1, last_accessed = time::now() WHERE id IN $things",
                table = Self::table_name()
            ))
            .bind(("things", things))
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

/// Scope predicate shared by every exchange query. Both binds are always
/// present; absent sides compare against NONE and fall away.
fn scope_clause() -> &'static str {
    "(($scope_user != NONE AND user_id = $scope_user) OR ($scope_tenant != NONE AND tenant_id = $scope_tenant))"
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");
        db.ensure_initialized(3).await.expect("init schema");
        db
    }

    fn sample_exchange(session: &str, user: &str, human: &str, assistant: &str) -> Exchange {
        Exchange::new(
            session.to_string(),
            Some(user.to_string()),
            None,
            human.to_string(),
            assistant.to_string(),
            ExchangeSource::Chat,
        )
    }

    #[test]
    fn content_hash_is_deterministic_and_distinct() {
        let a = Exchange::content_hash_id("s1", "hello", "world");
        let b = Exchange::content_hash_id("s1", "hello", "world");
        let c = Exchange::content_hash_id("s2", "hello", "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn record_requires_an_owner() {
        let db = setup_db().await;
        let exchange = Exchange::new(
            "s1".into(),
            None,
            None,
            "hi".into(),
            "hello".into(),
            ExchangeSource::Chat,
        );
        let result = Exchange::record(exchange, None, &db).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn record_is_idempotent_per_content_hash() {
        let db = setup_db().await;
        let exchange = sample_exchange("s1", "u1", "my favorite color is indigo", "noted");

        let first = Exchange::record(exchange.clone(), Some(vec![0.1, 0.2, 0.3]), &db)
            .await
            .expect("first record");
        let second = Exchange::record(exchange, Some(vec![0.1, 0.2, 0.3]), &db)
            .await
            .expect("second record");
        assert_eq!(first, second);

        let all: Vec<Exchange> = db.get_all_stored_items().await.expect("select all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn record_stamps_increasing_sequence_indexes() {
        let db = setup_db().await;

        let mut indexes = Vec::new();
        for i in 0..4 {
            let exchange = sample_exchange("s1", "u1", &format!("question {i}"), "answer");
            let id = Exchange::record(exchange, None, &db).await.expect("record");
            let stored: Exchange = db.get_item(&id).await.expect("get").expect("exists");
            indexes.push(stored.sequence_index);
        }

        for pair in indexes.windows(2) {
            assert!(pair[1] > pair[0], "sequence must strictly increase: {indexes:?}");
        }
    }

    #[tokio::test]
    async fn recent_is_scoped_and_most_recent_first() {
        let db = setup_db().await;

        for i in 0..3 {
            let mut exchange = sample_exchange("s1", "u1", &format!("mine {i}"), "ok");
            exchange.created_at = Utc::now() + chrono::Duration::seconds(i);
            Exchange::record(exchange, None, &db).await.expect("record");
        }
        let foreign = sample_exchange("s2", "u2", "other users message", "ok");
        Exchange::record(foreign, None, &db).await.expect("record");

        let scope = MemoryScope::for_user("u1");
        let rows = Exchange::recent(&scope, None, None, 10, &db)
            .await
            .expect("recent");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|e| e.user_id.as_deref() == Some("u1")));
        assert!(rows[0].created_at >= rows[1].created_at);
        assert!(rows[1].created_at >= rows[2].created_at);
    }

    #[tokio::test]
    async fn empty_scope_returns_empty_without_querying() {
        let db = setup_db().await;
        let exchange = sample_exchange("s1", "u1", "secret", "stored");
        Exchange::record(exchange, Some(vec![1.0, 0.0, 0.0]), &db)
            .await
            .expect("record");

        let scope = MemoryScope::default();
        assert!(Exchange::recent(&scope, None, None, 10, &db)
            .await
            .expect("recent")
            .is_empty());
        assert!(
            Exchange::vector_search(5, vec![1.0, 0.0, 0.0], &scope, &db)
                .await
                .expect("vector")
                .is_empty()
        );
        assert!(
            Exchange::fts_search(5, "secret", &scope, None, None, &db)
                .await
                .expect("fts")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn vector_search_respects_scope() {
        let db = setup_db().await;

        let mine = sample_exchange("s1", "u1", "rust async runtimes", "tokio");
        Exchange::record(mine.clone(), Some(vec![1.0, 0.0, 0.0]), &db)
            .await
            .expect("record mine");
        let theirs = sample_exchange("s2", "u2", "rust async runtimes too", "tokio");
        Exchange::record(theirs, Some(vec![1.0, 0.0, 0.0]), &db)
            .await
            .expect("record theirs");

        let results =
            Exchange::vector_search(5, vec![1.0, 0.0, 0.0], &MemoryScope::for_user("u1"), &db)
                .await
                .expect("search");

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].exchange.id, mine.id);
        assert!(results[0].score > 0.99);
    }

    #[tokio::test]
    async fn fts_search_matches_both_sides_of_the_exchange() {
        let db = setup_db().await;

        let by_human = sample_exchange("s1", "u1", "tell me about vitamins", "sure");
        let by_assistant = sample_exchange("s1", "u1", "and?", "vitamins are organic compounds");
        Exchange::record(by_human.clone(), None, &db)
            .await
            .expect("record one");
        Exchange::record(by_assistant.clone(), None, &db)
            .await
            .expect("record two");
        db.rebuild_indexes().await.expect("rebuild");

        let results = Exchange::fts_search(
            10,
            "vitamins",
            &MemoryScope::for_user("u1"),
            None,
            None,
            &db,
        )
        .await
        .expect("fts");

        let ids: Vec<&str> = results.iter().map(|r| r.exchange.id.as_str()).collect();
        assert!(ids.contains(&by_human.id.as_str()));
        assert!(ids.contains(&by_assistant.id.as_str()));
    }

    #[tokio::test]
    async fn touch_bumps_access_count() {
        let db = setup_db().await;
        let exchange = sample_exchange("s1", "u1", "touch me", "ok");
        let id = Exchange::record(exchange, None, &db).await.expect("record");

        Exchange::touch(&[id.clone()], &db).await.expect("touch");
        Exchange::touch(&[id.clone()], &db).await.expect("touch");

        let stored: Exchange = db.get_item(&id).await.expect("get").expect("exists");
        assert_eq!(stored.access_count, 2);
        assert!(stored.last_accessed.is_some());
    }

    #[tokio::test]
    async fn tenant_scope_sees_tenant_rows() {
        let db = setup_db().await;
        let mut exchange = sample_exchange("s1", "u1", "division handbook question", "answered");
        exchange.tenant_id = Some("acme".into());
        Exchange::record(exchange.clone(), None, &db)
            .await
            .expect("record");

        let rows = Exchange::recent(&MemoryScope::for_tenant("acme"), None, None, 10, &db)
            .await
            .expect("recent");
        assert_eq!(rows.len(), 1);

        let rows = Exchange::recent(&MemoryScope::for_tenant("globex"), None, None, 10, &db)
            .await
            .expect("recent");
        assert!(rows.is_empty());
    }
}
