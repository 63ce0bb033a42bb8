//! Networked storage mode. Schema-compatible with [`crate::sqlite`]; kept
//! as a thin separate module because `sqlx`'s query macros bind to one
//! database driver per call site and the two pools are not interchangeable
//! at the type level.

use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use crate::backend::Repository;
use crate::error::RepositoryError;
use crate::record::{Entity, Record};

pub struct PostgresRepository<T> {
    pool: PgPool,
    _entity: PhantomData<T>,
}

impl<T: Entity> PostgresRepository<T> {
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| RepositoryError::Internal(format!("connect failed: {e}")))?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kms_records ( \
                table_name TEXT NOT NULL, \
                tenant_id TEXT NOT NULL, \
                id TEXT NOT NULL, \
                data TEXT NOT NULL, \
                version BIGINT NOT NULL DEFAULT 1, \
                created_at TIMESTAMPTZ NOT NULL, \
                updated_at TIMESTAMPTZ NOT NULL, \
                PRIMARY KEY (table_name, tenant_id, id) \
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| RepositoryError::Internal(format!("schema init failed: {e}")))?;

        Ok(Self { pool, _entity: PhantomData })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for PostgresRepository<T> {
    async fn create(&self, tenant_id: &str, id: &str, value: &T) -> Result<Record<T>, RepositoryError> {
        let data = serde_json::to_string(value)
            .map_err(|e| RepositoryError::InvalidArgument(format!("serialize failed: {e}")))?;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO kms_records (table_name, tenant_id, id, data, version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 1, $5, $5) \
             ON CONFLICT (table_name, tenant_id, id) DO NOTHING",
        )
        .bind(T::table_name())
        .bind(tenant_id)
        .bind(id)
        .bind(&data)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::AlreadyExists {
                entity: T::table_name(),
                id: id.to_string(),
            });
        }

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
             WHERE table_name = $1 AND tenant_id = $2 AND id = $3",
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
            "UPDATE kms_records SET data = $1, version = version + 1, updated_at = $2 \
             WHERE table_name = $3 AND tenant_id = $4 AND id = $5 AND version = $6",
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
        let result = sqlx::query("DELETE FROM kms_records WHERE table_name = $1 AND tenant_id = $2 AND id = $3")
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
             WHERE table_name = $1 AND tenant_id = $2 ORDER BY created_at ASC",
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

fn row_to_record<T: Entity>(tenant_id: &str, id: &str, row: sqlx::postgres::PgRow) -> Result<Record<T>, RepositoryError> {
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
