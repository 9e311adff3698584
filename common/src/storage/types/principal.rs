use uuid::Uuid;

use crate::{error::AppError, scope::MemoryScope, storage::db::SurrealDbClient, stored_object};

stored_object!(Principal, "principal", {
    /// Opaque credential presented on `verify`. Unique across principals.
    token: String,
    user_id: Option<String>,
    tenant_id: Option<String>,
    departments: Vec<String>,
    role: Option<String>
});

impl Principal {
    pub fn new(
        token: String,
        user_id: Option<String>,
        tenant_id: Option<String>,
        departments: Vec<String>,
        role: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            token,
            user_id,
            tenant_id,
            departments,
            role,
        }
    }

    pub async fn find_by_token(
        token: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .client
            .query(format!(
                "SELECT * FROM {} WHERE token = $tok LIMIT 1",
                Self::table_name()
            ))
            .bind(("tok", token.to_owned()))
            .await?;
        let rows: Vec<Self> = response.take(0)?;
        Ok(rows.into_iter().next())
    }

    pub fn scope(&self) -> MemoryScope {
        MemoryScope {
            user_id: self.user_id.clone(),
            tenant_id: self.tenant_id.clone(),
            departments: self.departments.clone(),
            role: self.role.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_lookup_round_trips_the_scope() {
        let database = Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", &database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let principal = Principal::new(
            "tok-123".into(),
            Some("u1".into()),
            Some("acme".into()),
            vec!["sales".into()],
            Some("member".into()),
        );
        db.store_item(principal).await.expect("store");

        let found = Principal::find_by_token("tok-123", &db)
            .await
            .expect("lookup")
            .expect("present");
        let scope = found.scope();
        assert_eq!(scope.user_id.as_deref(), Some("u1"));
        assert_eq!(scope.tenant_id.as_deref(), Some("acme"));
        assert_eq!(scope.departments, vec!["sales".to_string()]);

        let missing = Principal::find_by_token("nope", &db).await.expect("lookup");
        assert!(missing.is_none());
    }
}
