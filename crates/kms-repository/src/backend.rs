//! The repository trait (C3): tenant-scoped CRUD plus a transactional
//! scope for operations that must commit or roll back together (for
//! example rotating a key: demoting the active row and reactivating it
//! are two writes to the same record that should never be observed half
//! done).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::record::{Entity, Record};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reentrancy guard for [`Repository::with_tx`]. A nested `with_tx` call
/// made from inside an outer scope's body shares this counter rather than
/// opening a second scope, so backends that do hold a real lock or
/// connection for the duration only acquire it once per outermost call.
#[derive(Default)]
pub struct TxScope {
    depth: AtomicU32,
}

impl TxScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this call is the outermost `with_tx` in the current nest.
    pub fn enter(&self) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst) == 0
    }

    pub fn exit(&self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }
}

#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// Insert a brand-new record. Fails with `AlreadyExists` if `(tenant_id,
    /// id)` is already occupied.
    async fn create(&self, tenant_id: &str, id: &str, value: &T) -> Result<Record<T>, RepositoryError>;

    /// Fetch a record scoped to the given tenant. Records never leak across
    /// tenant boundaries even if the `id` collides.
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Record<T>, RepositoryError>;

    /// Replace a record's value, enforcing optimistic concurrency: the
    /// caller must supply the version it last observed.
    async fn update(
        &self,
        tenant_id: &str,
        id: &str,
        expected_version: i64,
        value: &T,
    ) -> Result<Record<T>, RepositoryError>;

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), RepositoryError>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<Record<T>>, RepositoryError>;

    /// Run `body` as a single transactional scope: no other `with_tx`-
    /// wrapped sequence observes a partial write from this one while it's
    /// in flight. The default implementation only sequences `body` under
    /// the reentrancy guard; backends that hold a real lock or connection
    /// for the scope's duration (see [`crate::memory::InMemoryRepository`])
    /// override this to add actual mutual exclusion. `scope` is supplied by
    /// the caller so a nested `with_tx` (for example a helper method that
    /// itself wraps its own writes) is a no-op extra layer rather than a
    /// second scope.
    async fn with_tx<'a>(
        &'a self,
        scope: &'a TxScope,
        body: Box<dyn FnOnce() -> BoxFuture<'a, Result<(), RepositoryError>> + Send + 'a>,
    ) -> Result<(), RepositoryError> {
        scope.enter();
        let result = body().await;
        scope.exit();
        result
    }
}
