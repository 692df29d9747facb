//! Namespaces: the tenant boundary
//!
//! A namespace owns its workflow executions. Namespaces are created once and
//! soft-deleted; the registry keeps the row so closed executions can still be
//! resolved until retention removes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{EngineError, EngineResult};
use crate::types::NamespaceId;

/// Namespace lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceStatus {
    /// Accepting new executions
    Active,
    /// Existing executions run out; new starts are rejected
    Deprecated,
    /// Soft-deleted
    Deleted,
}

/// Tenant boundary record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    /// Unique identifier
    pub id: NamespaceId,
    /// Unique name
    pub name: String,
    /// Days closed executions are kept before retention removes them
    pub retention_days: u32,
    /// History archival requested (collaborator concern; recorded only)
    pub history_archival_enabled: bool,
    /// Visibility archival requested (collaborator concern; recorded only)
    pub visibility_archival_enabled: bool,
    /// Lifecycle state
    pub status: NamespaceStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

/// In-memory namespace registry
pub struct NamespaceRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

struct RegistryInner {
    namespaces: HashMap<NamespaceId, Namespace>,
    by_name: HashMap<String, NamespaceId>,
}

impl NamespaceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                namespaces: HashMap::new(),
                by_name: HashMap::new(),
            })),
        }
    }

    /// Register a new namespace; names are unique
    pub async fn create(&self, name: &str, retention_days: u32) -> EngineResult<Namespace> {
        if name.is_empty() {
            return Err(EngineError::InvalidArgument(
                "namespace name must not be empty".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;
        if inner.by_name.contains_key(name) {
            return Err(EngineError::AlreadyExists(format!("namespace {}", name)));
        }
        let now = Utc::now();
        let namespace = Namespace {
            id: NamespaceId::new(),
            name: name.to_string(),
            retention_days,
            history_archival_enabled: false,
            visibility_archival_enabled: false,
            status: NamespaceStatus::Active,
            created_at: now,
            updated_at: now,
        };
        inner.by_name.insert(name.to_string(), namespace.id);
        inner.namespaces.insert(namespace.id, namespace.clone());
        Ok(namespace)
    }

    /// Look up by ID
    pub async fn get(&self, id: &NamespaceId) -> EngineResult<Namespace> {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("namespace {}", id)))
    }

    /// Look up by name
    pub async fn get_by_name(&self, name: &str) -> EngineResult<Namespace> {
        let inner = self.inner.read().await;
        let id = inner
            .by_name
            .get(name)
            .ok_or_else(|| EngineError::NotFound(format!("namespace {}", name)))?;
        inner
            .namespaces
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("namespace {}", name)))
    }

    /// Look up by ID and require it to accept new work
    pub async fn require_active(&self, id: &NamespaceId) -> EngineResult<Namespace> {
        let namespace = self.get(id).await?;
        match namespace.status {
            NamespaceStatus::Active => Ok(namespace),
            status => Err(EngineError::FailedPrecondition(format!(
                "namespace {} is {:?}",
                namespace.name, status
            ))),
        }
    }

    /// Stop accepting new executions
    pub async fn deprecate(&self, id: &NamespaceId) -> EngineResult<Namespace> {
        self.set_status(id, NamespaceStatus::Deprecated).await
    }

    /// Soft-delete; the row remains resolvable
    pub async fn delete(&self, id: &NamespaceId) -> EngineResult<Namespace> {
        self.set_status(id, NamespaceStatus::Deleted).await
    }

    async fn set_status(
        &self,
        id: &NamespaceId,
        status: NamespaceStatus,
    ) -> EngineResult<Namespace> {
        let mut inner = self.inner.write().await;
        let namespace = inner
            .namespaces
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("namespace {}", id)))?;
        namespace.status = status;
        namespace.updated_at = Utc::now();
        Ok(namespace.clone())
    }

    /// All registered namespaces
    pub async fn list(&self) -> Vec<Namespace> {
        let inner = self.inner.read().await;
        inner.namespaces.values().cloned().collect()
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_lookup() {
        let registry = NamespaceRegistry::new();
        let ns = registry.create("default", 30).await.expect("create failed");
        assert_eq!(ns.status, NamespaceStatus::Active);
        let by_name = registry.get_by_name("default").await.expect("lookup failed");
        assert_eq!(by_name.id, ns.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = NamespaceRegistry::new();
        registry.create("default", 30).await.expect("create failed");
        let err = registry.create("default", 30).await.expect_err("must reject");
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let registry = NamespaceRegistry::new();
        let ns = registry.create("tenant-a", 7).await.expect("create failed");
        registry.delete(&ns.id).await.expect("delete failed");
        let row = registry.get(&ns.id).await.expect("row must remain");
        assert_eq!(row.status, NamespaceStatus::Deleted);
        assert!(registry.require_active(&ns.id).await.is_err());
    }
}
