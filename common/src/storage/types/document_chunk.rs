#![allow(clippy::module_name_repetitions)]
use sha2::{Digest, Sha256};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(DocumentChunk, "document_chunk", {
    tenant_id: String,
    department_id: Option<String>,
    content: String,
    section_title: String,
    source_file: String,
    file_hash: String,
    chunk_index: i64,
    token_count: i64,
    keywords: Vec<String>,
    category: String,
    subcategory: Option<String>,
    query_types: Vec<String>,
    verbs: Vec<String>,
    entities: Vec<String>,
    actors: Vec<String>,
    conditions: Vec<String>,
    /// 1-10 semantic weights assigned by the offline tagger.
    importance: u8,
    specificity: u8,
    complexity: u8,
    is_procedure: bool,
    is_policy: bool,
    is_form: bool,
    process_name: Option<String>,
    process_step: Option<i64>,
    sibling_ids: Vec<String>,
    prerequisite_ids: Vec<String>,
    see_also_ids: Vec<String>,
    follows_ids: Vec<String>,
    department_access: Vec<String>,
    /// Tombstone flag. Chunks are never deleted in place.
    active: bool,
    embedding: Option<Vec<f32>>,
    embedding_model: String
});

/// Candidate row with its raw cosine score, before threshold and ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentHit {
    pub chunk: DocumentChunk,
    pub score: f32,
}

impl DocumentChunk {
    /// Idempotency key: `(tenant_id, file_hash, chunk_index)` addresses the
    /// row, so re-ingesting the same source chunk upserts in place.
    pub fn idempotency_id(tenant_id: &str, file_hash: &str, chunk_index: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.as_bytes());
        hasher.update([0]);
        hasher.update(file_hash.as_bytes());
        hasher.update([0]);
        hasher.update(chunk_index.to_be_bytes());
        let digest = hasher.finalize();
        let hex = format!("{digest:x}");
        hex[..32].to_string()
    }

    /// Upsert a chunk under its idempotency key.
    ///
    /// Every row must carry a department: either `department_id` or a
    /// non-empty `department_access` list.
    pub async fn upsert(mut chunk: DocumentChunk, db: &SurrealDbClient) -> Result<String, AppError> {
        if chunk.department_id.is_none() && chunk.department_access.is_empty() {
            return Err(AppError::Validation(
                "document chunk requires a department_id or department_access".into(),
            ));
        }

        chunk.id = Self::idempotency_id(&chunk.tenant_id, &chunk.file_hash, chunk.chunk_index);
        chunk.updated_at = Utc::now();
        let id = chunk.id.clone();

        db.client
            .query(format!(
                "UPSERT type::thing('{table}', $id) CONTENT $chunk;",
                table = Self::table_name()
            ))
            .bind(("id", id.clone()))
            .bind(("chunk", chunk))
            .await
            .map_err(AppError::Database)?
            .check()
            .map_err(AppError::Database)?;

        Ok(id)
    }

    /// Tombstone every chunk of a source file. `active = false`, no deletes.
    pub async fn deactivate_file(
        tenant_id: &str,
        file_hash: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(format!(
                "UPDATE {table} SET active = false, updated_at = time::now() \
                 WHERE tenant_id = $tenant_id AND file_hash = $file_hash",
                table = Self::table_name()
            ))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("file_hash", file_hash.to_owned()))
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Pre-filtered candidates scored by cosine similarity.
    ///
    /// The array-overlap predicates run before the vector math; threshold,
    /// boosting and final ordering are the retrieval pipeline's job.
    pub async fn vector_candidates(
        query_embedding: Vec<f32>,
        tenant_id: &str,
        allowed_departments: &[String],
        intent: Option<&str>,
        entities: &[String],
        verbs: &[String],
        candidate_limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<DocumentHit>, AppError> {
        if allowed_departments.is_empty() {
            return Ok(Vec::new());
        }

        #[allow(clippy::missing_docs_in_private_items)]
        #[derive(Deserialize)]
        struct ScoredRow {
            #[serde(deserialize_with = "deserialize_flexible_id")]
            id: String,
            score: Option<f32>,
        }

        let score_sql = format!(
            r#"
            SELECT id, vector::similarity::cosine(embedding, $embedding) AS score
            FROM {table}
            WHERE active = true
              AND tenant_id = $tenant_id
              AND (department_id IN $departments OR department_access CONTAINSANY $departments)
              AND ($intent = NONE OR query_types CONTAINS $intent)
              AND (array::len($entities) = 0 OR entities CONTAINSANY $entities)
              AND (array::len($verbs) = 0 OR verbs CONTAINSANY $verbs)
              AND embedding != NONE
            ORDER BY score DESC
            LIMIT $limit;
            "#,
            table = Self::table_name()
        );

        let mut response = db
            .client
            .query(score_sql)
            .bind(("embedding", query_embedding))
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("departments", allowed_departments.to_vec()))
            .bind(("intent", intent.map(str::to_owned)))
            .bind(("entities", entities.to_vec()))
            .bind(("verbs", verbs.to_vec()))
            .bind(("limit", candidate_limit as i64))
            .await
            .map_err(AppError::Database)?;

        let score_rows: Vec<ScoredRow> = response.take(0).map_err(AppError::Database)?;
        if score_rows.is_empty() {
            return Ok(Vec::new());
        }

        let things: Vec<Thing> = score_rows
            .iter()
            .map(|row| Thing::from((Self::table_name(), row.id.as_str())))
            .collect();
        let mut hydrate = db
            .client
            .query(format!(
                "SELECT * FROM {table} WHERE id IN $things",
                table = Self::table_name()
            ))
            .bind(("things", things))
            .await
            .map_err(AppError::Database)?;
        let chunks: Vec<DocumentChunk> = hydrate.take(0).map_err(AppError::Database)?;

        let mut by_id: std::collections::HashMap<String, DocumentChunk> = chunks
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        let mut hits = Vec::with_capacity(score_rows.len());
        for row in score_rows {
            if let Some(chunk) = by_id.remove(&row.id) {
                hits.push(DocumentHit {
                    chunk,
                    score: row.score.unwrap_or_default(),
                });
            }
        }
        Ok(hits)
    }

    /// Keyword-only candidates for when no query embedding is available.
    /// Scored client-side by tag overlap, so the raw rows come back unscored.
    pub async fn keyword_candidates(
        tenant_id: &str,
        allowed_departments: &[String],
        intent: Option<&str>,
        entities: &[String],
        verbs: &[String],
        candidate_limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<DocumentChunk>, AppError> {
        if allowed_departments.is_empty() {
            return Ok(Vec::new());
        }
        if entities.is_empty() && verbs.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT *
            FROM {table}
            WHERE active = true
              AND tenant_id = $tenant_id
              AND (department_id IN $departments OR department_access CONTAINSANY $departments)
              AND ($intent = NONE OR query_types CONTAINS $intent)
              AND (entities CONTAINSANY $entities OR verbs CONTAINSANY $verbs)
            LIMIT $limit;
            "#,
            table = Self::table_name()
        );

        let mut response = db
            .client
            .query(sql)
            .bind(("tenant_id", tenant_id.to_owned()))
            .bind(("departments", allowed_departments.to_vec()))
            .bind(("intent", intent.map(str::to_owned)))
            .bind(("entities", entities.to_vec()))
            .bind(("verbs", verbs.to_vec()))
            .bind(("limit", candidate_limit as i64))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<DocumentChunk> = response.take(0).map_err(AppError::Database)?;
        Ok(rows)
    }

    /// The chunk plus everything its `prerequisite_ids` and `see_also_ids`
    /// point at, active rows only. Stable output order: the chunk itself,
    /// prerequisites, then see-also, each sorted by id.
    pub async fn expand_context(
        chunk_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<DocumentChunk>, AppError> {
        let Some(chunk) = db.get_item::<DocumentChunk>(chunk_id).await? else {
            return Err(AppError::NotFound(format!(
                "document chunk {chunk_id} not found"
            )));
        };

        let mut related_ids: Vec<String> = Vec::new();
        let mut prereqs = chunk.prerequisite_ids.clone();
        prereqs.sort();
        let mut see_also = chunk.see_also_ids.clone();
        see_also.sort();
        related_ids.extend(prereqs);
        related_ids.extend(see_also);
        related_ids.dedup();

        let mut result = vec![chunk];
        for id in related_ids {
            if result.iter().any(|c| c.id == id) {
                continue;
            }
            if let Some(related) = db.get_item::<DocumentChunk>(&id).await? {
                if related.active {
                    result.push(related);
                }
            }
        }

        Ok(result)
    }
}
