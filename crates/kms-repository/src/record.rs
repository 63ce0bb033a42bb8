//! Generic persisted record: every table the repository manages stores a
//! JSON blob keyed by `(tenant_id, id)` plus an optimistic-concurrency
//! version column, mirroring how the keystore already treats its entities
//! as opaque serialized metadata.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

/// Implemented by any type the repository persists. `Id` is realm-scoped:
/// two tenants may reuse the same id without colliding.
pub trait Entity: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn entity_id(&self) -> String;
    fn table_name() -> &'static str;
}

#[derive(Debug, Clone)]
pub struct Record<T> {
    pub tenant_id: String,
    pub id: String,
    pub value: T,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
