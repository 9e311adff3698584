use std::sync::Arc;

use async_trait::async_trait;

use common::{
    error::AppError,
    scope::MemoryScope,
    storage::{db::SurrealDbClient, types::principal::Principal},
};

/// Resolves an opaque credential into a memory scope.
///
/// Fail-secure by construction: an unknown credential resolves to the empty
/// scope (authenticated-anonymous), never to an error the caller might be
/// tempted to ignore. How the credential was minted is outside this system.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<MemoryScope, AppError>;
}

/// Production resolver: the credential is a token addressing a principal
/// row.
pub struct PrincipalResolver {
    db: Arc<SurrealDbClient>,
}

impl PrincipalResolver {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialResolver for PrincipalResolver {
    async fn resolve(&self, credential: &str) -> Result<MemoryScope, AppError> {
        let principal = Principal::find_by_token(credential, &self.db).await?;
        Ok(principal.map(|p| p.scope()).unwrap_or_default())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use static_resolver::StaticResolver;

#[cfg(any(test, feature = "test-utils"))]
mod static_resolver {
    use std::collections::HashMap;

    use super::{async_trait, AppError, CredentialResolver, MemoryScope};

    /// Test resolver with a fixed credential table.
    #[derive(Default)]
    pub struct StaticResolver {
        scopes: HashMap<String, MemoryScope>,
    }

    impl StaticResolver {
        pub fn with(mut self, credential: &str, scope: MemoryScope) -> Self {
            self.scopes.insert(credential.to_string(), scope);
            self
        }
    }

    #[async_trait]
    impl CredentialResolver for StaticResolver {
        async fn resolve(&self, credential: &str) -> Result<MemoryScope, AppError> {
            Ok(self.scopes.get(credential).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn principal_resolver_round_trips_scope() {
        let database = Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );

        let principal = Principal::new(
            "tok-9".into(),
            Some("u1".into()),
            None,
            vec!["sales".into()],
            None,
        );
        db.store_item(principal).await.expect("store");

        let resolver = PrincipalResolver::new(Arc::clone(&db));
        let scope = resolver.resolve("tok-9").await.expect("resolve");
        assert_eq!(scope.user_id.as_deref(), Some("u1"));

        // Unknown credentials land in the anonymous scope, not an error.
        let anonymous = resolver.resolve("unknown").await.expect("resolve");
        assert!(anonymous.is_empty());
    }

    #[tokio::test]
    async fn static_resolver_serves_fixed_scopes() {
        let resolver =
            StaticResolver::default().with("good", MemoryScope::for_user("u1"));
        assert_eq!(
            resolver.resolve("good").await.expect("resolve").user_id.as_deref(),
            Some("u1")
        );
        assert!(resolver.resolve("bad").await.expect("resolve").is_empty());
    }
}
