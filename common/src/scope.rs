use serde::{Deserialize, Serialize};

/// The `(user_id, tenant_id, allowed_departments)` triple that gates every
/// retrieval and store call. No scope, no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryScope {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub departments: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl MemoryScope {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    pub fn with_departments(mut self, departments: Vec<String>) -> Self {
        self.departments = departments;
        self
    }

    /// An empty scope carries neither a user nor a tenant. Every scoped store
    /// call must return empty for it rather than erroring.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.tenant_id.is_none()
    }

    /// Whether a row stamped with the given owner ids is visible in this scope.
    pub fn permits(&self, user_id: Option<&str>, tenant_id: Option<&str>) -> bool {
        if self.is_empty() {
            return false;
        }
        let user_match = match (self.user_id.as_deref(), user_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        };
        let tenant_match = match (self.tenant_id.as_deref(), tenant_id) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => false,
        };
        user_match || tenant_match
    }
}
