//! SQLite-backed repository: the embedded storage mode. A single
//! `kms_records` table hosts every entity kind, partitioned by
//! `table_name`, `tenant_id`, `id` — this keeps migrations to one
//! schema regardless of how many entity types the rest of the crate adds.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use crate::backend::Repository;
use crate::error::RepositoryError;
use crate::record::{Entity, Record};

pub struct SqliteRepository<T> {
    pool: SqlitePool,
    _entity: PhantomData<T>,
}

impl<T: Entity> SqliteRepository<T> {
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| RepositoryError::Internal(format!("connect failed: {e}")))?;
        let repo = Self { pool, _entity: PhantomData };
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn in_memory() -> Result<Self, RepositoryError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), RepositoryError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepositoryError::Internal(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for SqliteRepository<T> {
    async fn create(&self, tenant_id: &str, id: &str, value: &T) -> Result<Record<T>, RepositoryError> {
        let data = serde_json::to_string(value)
            .map_err(|e| RepositoryError::InvalidArgument(format!("serialize failed: {e}")))?;
        let now = Utc::now();

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM kms_records WHERE table_name = ? AND tenant_id = ? AND id = ?",
        )
        .bind(T::table_name())
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if existing.is_some() {
            return Err(RepositoryError::AlreadyExists {
                entity: T::table_name(),
                id: id.to_string(),
            });
        }

        sqlx::query(
            "INSERT INTO kms_records (table_name, tenant_id, id, data, version, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(T::table_name())
        .bind(tenant_id)
        .bind(id)
        .bind(&data)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Record {
            tenant_id: tenant_id.to_string(),
            id: id.to_string(),
            value: value.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Record<T>, RepositoryError> {
        let row = sqlx::query(
            "SELECT data, version, created_at, updated_at FROM kms_records \
             WHERE table_name = ? AND tenant_id = ? AND id = ?",
        )
        .bind(T::table_name())
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| RepositoryError::NotFound {
            entity: T::table_name(),
            id: id.to_string(),
        })?;

        row_to_record(tenant_id, id, row)
    }

    async fn update(
        &self,
        tenant_id: &str,
        id: &str,
        expected_version: i64,
        value: &T,
    ) -> Result<Record<T>, RepositoryError> {
        let data = serde_json::to_string(value)
            .map_err(|e| RepositoryError::InvalidArgument(format!("serialize failed: {e}")))?;
        let now = Utc::now();

        let result = sqlx::query(
            "UPDATE kms_records SET data = ?, version = version + 1, updated_at = ? \
             WHERE table_name = ? AND tenant_id = ? AND id = ? AND version = ?",
        )
        .bind(&data)
        .bind(now)
        .bind(T::table_name())
        .bind(tenant_id)
        .bind(id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the row is gone, or someone else updated it first.
            return match self.get(tenant_id, id).await {
                Ok(_) => Err(RepositoryError::InvalidArgument(format!(
                    "stale version for {id}: expected {expected_version}"
                ))),
                Err(e) => Err(e),
            };
        }

        self.get(tenant_id, id).await
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM kms_records WHERE table_name = ? AND tenant_id = ? AND id = ?")
            .bind(T::table_name())
            .bind(tenant_id)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: T::table_name(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Record<T>>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, data, version, created_at, updated_at FROM kms_records \
             WHERE table_name = ? AND tenant_id = ? ORDER BY created_at ASC",
        )
        .bind(T::table_name())
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(RepositoryError::from)?;
                row_to_record(tenant_id, &id, row)
            })
            .collect()
    }
}

fn row_to_record<T: Entity>(tenant_id: &str, id: &str, row: sqlx::sqlite::SqliteRow) -> Result<Record<T>, RepositoryError> {
    let data: String = row.try_get("data").map_err(RepositoryError::from)?;
    let version: i64 = row.try_get("version").map_err(RepositoryError::from)?;
    let created_at = row.try_get("created_at").map_err(RepositoryError::from)?;
    let updated_at = row.try_get("updated_at").map_err(RepositoryError::from)?;
    let value: T = serde_json::from_str(&data)
        .map_err(|e| RepositoryError::Internal(format!("deserialize failed for {id}: {e}")))?;

    Ok(Record {
        tenant_id: tenant_id.to_string(),
        id: id.to_string(),
        value,
        version,
        created_at,
        updated_at,
    })
}
