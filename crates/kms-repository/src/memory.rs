//! In-memory repository used by unit tests and by `kms-core` examples that
//! don't want a database. Enforces the same tenant-scoping and optimistic
//! concurrency semantics as [`crate::sqlite::SqliteRepository`] so tests
//! written against it also hold against the real backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{BoxFuture, Repository, TxScope};
use crate::error::RepositoryError;
use crate::record::{Entity, Record};

#[derive(Default)]
pub struct InMemoryRepository<T> {
    rows: RwLock<HashMap<(String, String), Record<T>>>,
    /// Held for the duration of an outermost `with_tx` scope so two
    /// concurrent transactional writers can't interleave their individual
    /// create/update calls. Plain (non-`with_tx`) calls still bypass it,
    /// same as they bypass any real backend's transaction.
    write_txn: AsyncMutex<()>,
}

impl<T: Entity> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self { rows: RwLock::new(HashMap::new()), write_txn: AsyncMutex::new(()) }
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for InMemoryRepository<T> {
    async fn create(&self, tenant_id: &str, id: &str, value: &T) -> Result<Record<T>, RepositoryError> {
        let mut rows = self.rows.write().expect("lock poisoned");
        let key = (tenant_id.to_string(), id.to_string());
        if rows.contains_key(&key) {
            return Err(RepositoryError::AlreadyExists {
                entity: T::table_name(),
                id: id.to_string(),
            });
        }
        let now = Utc::now();
        let record = Record {
            tenant_id: tenant_id.to_string(),
            id: id.to_string(),
            value: value.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        rows.insert(key, record.clone());
        Ok(record)
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Record<T>, RepositoryError> {
        let rows = self.rows.read().expect("lock poisoned");
        rows.get(&(tenant_id.to_string(), id.to_string()))
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound {
                entity: T::table_name(),
                id: id.to_string(),
            })
    }

    async fn update(
        &self,
        tenant_id: &str,
        id: &str,
        expected_version: i64,
        value: &T,
    ) -> Result<Record<T>, RepositoryError> {
        let mut rows = self.rows.write().expect("lock poisoned");
        let key = (tenant_id.to_string(), id.to_string());
        let existing = rows.get(&key).ok_or_else(|| RepositoryError::NotFound {
            entity: T::table_name(),
            id: id.to_string(),
        })?;
        if existing.version != expected_version {
            return Err(RepositoryError::InvalidArgument(format!(
                "stale version for {id}: expected {expected_version}, found {}",
                existing.version
            )));
        }
        let updated = Record {
            value: value.clone(),
            version: existing.version + 1,
            updated_at: Utc::now(),
            ..existing.clone()
        };
        rows.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), RepositoryError> {
        let mut rows = self.rows.write().expect("lock poisoned");
        rows.remove(&(tenant_id.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| RepositoryError::NotFound {
                entity: T::table_name(),
                id: id.to_string(),
            })
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Record<T>>, RepositoryError> {
        let rows = self.rows.read().expect("lock poisoned");
        let mut out: Vec<Record<T>> = rows
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn with_tx<'a>(
        &'a self,
        scope: &'a TxScope,
        body: Box<dyn FnOnce() -> BoxFuture<'a, Result<(), RepositoryError>> + Send + 'a>,
    ) -> Result<(), RepositoryError> {
        let outermost = scope.enter();
        let _guard = if outermost { Some(self.write_txn.lock().await) } else { None };
        let result = body().await;
        scope.exit();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Serialize, Deserialize)]
    struct Widget {
        label: String,
    }

    impl Entity for Widget {
        fn entity_id(&self) -> String {
            self.label.clone()
        }
        fn table_name() -> &'static str {
            "widgets"
        }
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let repo = InMemoryRepository::<Widget>::new();
        repo.create("tenant-a", "w1", &Widget { label: "a".into() })
            .await
            .unwrap();
        assert!(repo.get("tenant-b", "w1").await.is_err());
        assert!(repo.get("tenant-a", "w1").await.is_ok());
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let repo = InMemoryRepository::<Widget>::new();
        repo.create("t", "w1", &Widget { label: "a".into() }).await.unwrap();
        assert!(repo
            .update("t", "w1", 99, &Widget { label: "b".into() })
            .await
            .is_err());
        assert!(repo
            .update("t", "w1", 1, &Widget { label: "b".into() })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let repo = InMemoryRepository::<Widget>::new();
        repo.create("t", "w1", &Widget { label: "a".into() }).await.unwrap();
        assert!(repo.create("t", "w1", &Widget { label: "b".into() }).await.is_err());
    }

    #[tokio::test]
    async fn with_tx_runs_sequential_writes_as_one_unit() {
        let repo = InMemoryRepository::<Widget>::new();
        repo.create("t", "w1", &Widget { label: "a".into() }).await.unwrap();

        let scope = TxScope::new();
        repo.with_tx(&scope, Box::new(|| -> BoxFuture<'_, Result<(), RepositoryError>> {
            Box::pin(async {
                repo.update("t", "w1", 1, &Widget { label: "b".into() }).await?;
                repo.update("t", "w1", 2, &Widget { label: "c".into() }).await?;
                Ok(())
            })
        }))
        .await
        .unwrap();

        assert_eq!(repo.get("t", "w1").await.unwrap().value.label, "c");
        assert_eq!(scope.depth(), 0);
    }
}
