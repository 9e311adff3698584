use crate::error::AppError;

use super::types::{analytics::Analytics, system_settings::SystemSettings, StoredObject};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define schema, analyzers and indexes, and seed singleton rows.
    ///
    /// `embedding_dimension` must match the configured embedding backend; the
    /// HNSW indexes are redefined whenever it changes.
    pub async fn ensure_initialized(&self, embedding_dimension: usize) -> Result<(), AppError> {
        self.define_indexes(embedding_dimension).await?;

        Analytics::ensure_initialized(self).await?;
        SystemSettings::ensure_initialized(self).await?;

        Ok(())
    }

    pub async fn define_indexes(&self, embedding_dimension: usize) -> Result<(), Error> {
        self.client
            .query(format!(
                "DEFINE INDEX OVERWRITE idx_embedding_exchange ON exchange_embedding FIELDS embedding HNSW DIMENSION {embedding_dimension};
                 DEFINE INDEX OVERWRITE idx_embedding_document ON document_chunk FIELDS embedding HNSW DIMENSION {embedding_dimension};"
            ))
            .await?
            .check()?;

        self.client
            .query(
                "DEFINE ANALYZER IF NOT EXISTS app_fts_analyzer TOKENIZERS class, punct FILTERS lowercase, ascii;
                 DEFINE INDEX IF NOT EXISTS exchange_fts_human_idx ON exchange FIELDS human_content SEARCH ANALYZER app_fts_analyzer BM25;
                 DEFINE INDEX IF NOT EXISTS exchange_fts_assistant_idx ON exchange FIELDS assistant_content SEARCH ANALYZER app_fts_analyzer BM25;",
            )
            .await?
            .check()?;

        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_exchange_session ON exchange FIELDS session_id, sequence_index;
                 DEFINE INDEX IF NOT EXISTS idx_exchange_user ON exchange FIELDS user_id;
                 DEFINE INDEX IF NOT EXISTS idx_exchange_tenant ON exchange FIELDS tenant_id;
                 DEFINE INDEX IF NOT EXISTS idx_exchange_created ON exchange FIELDS created_at;
                 DEFINE INDEX IF NOT EXISTS idx_document_tenant ON document_chunk FIELDS tenant_id;
                 DEFINE INDEX IF NOT EXISTS idx_principal_token ON principal FIELDS token UNIQUE;",
            )
            .await?
            .check()?;

        Ok(())
    }

    /// Force index maintenance after bulk inserts. FTS indexes in particular
    /// need a rebuild before `search::score` reflects fresh rows.
    pub async fn rebuild_indexes(&self) -> Result<(), Error> {
        self.client
            .query(
                "REBUILD INDEX IF EXISTS exchange_fts_human_idx ON exchange;
                 REBUILD INDEX IF EXISTS exchange_fts_assistant_idx ON exchange;
                 REBUILD INDEX IF EXISTS idx_embedding_exchange ON exchange_embedding;
                 REBUILD INDEX IF EXISTS idx_embedding_document ON document_chunk;",
            )
            .await?;
        Ok(())
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}

#[cfg(test)]
mod tests {
    use crate::stored_object;

    use super::*;
    use uuid::Uuid;

    stored_object!(Dummy, "dummy", {
        name: String
    });

    #[tokio::test]
    async fn test_initialization_and_crud() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string(); // ensures isolation per test run
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized(8)
            .await
            .expect("Failed to initialize schema");

        let dummy = Dummy {
            id: "abc".to_string(),
            name: "first".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let stored = db.store_item(dummy.clone()).await.expect("Failed to store");
        assert!(stored.is_some());

        let fetched = db
            .get_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to fetch");
        assert_eq!(fetched, Some(dummy.clone()));

        let all = db
            .get_all_stored_items::<Dummy>()
            .await
            .expect("Failed to fetch all");
        assert!(all.contains(&dummy));

        let deleted = db
            .delete_item::<Dummy>(&dummy.id)
            .await
            .expect("Failed to delete");
        assert_eq!(deleted, Some(dummy));

        let fetch_post = db
            .get_item::<Dummy>("abc")
            .await
            .expect("Failed fetch post delete");
        assert!(fetch_post.is_none());
    }

    #[tokio::test]
    async fn test_initialization_is_idempotent() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized(8).await.expect("first init");
        db.ensure_initialized(8).await.expect("second init");
    }

    #[tokio::test]
    async fn test_redefine_with_new_dimension() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.define_indexes(8).await.expect("define with dim 8");
        db.define_indexes(16).await.expect("redefine with dim 16");
    }
}
