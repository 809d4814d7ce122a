//! Postgres-backed document store.
//!
//! Relies on two unique constraints owned by the external schema:
//! `(document_id, version)` and `(document_id, dedup_key)` on
//! `document_versions`, plus the `document_metadata` primary key on
//! `document_id`. Version collisions between concurrent workers surface as
//! rejected inserts that the persistence engine retries with a fresh number.
//! The version row and its metadata upsert share one transaction, so a
//! snapshot is either fully durable or absent.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DocumentMetadata, DocumentVersion};
use crate::types::AppResult;

use super::DocumentStore;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn commit_snapshot(
        &self,
        document_id: Uuid,
        version: i64,
        data: &[u8],
        commit_message: Option<&str>,
        dedup_key: &str,
        slug: Option<&str>,
        title: Option<&str>,
        owner_id: Option<Uuid>,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO document_versions (document_id, version, data, commit_message, dedup_key, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(document_id)
        .bind(version)
        .bind(data)
        .bind(commit_message)
        .bind(dedup_key)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        match slug {
            // First creation: insert metadata; if the row already exists
            // (duplicate delivery of a first-creation job), refresh only the
            // mutable fields. EXCLUDED.slug is deliberately not referenced.
            Some(slug) => {
                sqlx::query(
                    r#"
                    INSERT INTO document_metadata (document_id, slug, title, owner_id, updated_at)
                    VALUES ($1, $2, $3, $4, NOW())
                    ON CONFLICT (document_id) DO UPDATE
                    SET title = COALESCE(EXCLUDED.title, document_metadata.title),
                        updated_at = NOW()
                    "#,
                )
                .bind(document_id)
                .bind(slug)
                .bind(title)
                .bind(owner_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE document_metadata
                    SET title = COALESCE($2, title), updated_at = NOW()
                    WHERE document_id = $1
                    "#,
                )
                .bind(document_id)
                .bind(title)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn find_version_by_dedup(
        &self,
        document_id: Uuid,
        dedup_key: &str,
    ) -> AppResult<Option<i64>> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM document_versions WHERE document_id = $1 AND dedup_key = $2",
        )
        .bind(document_id)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version)
    }

    async fn max_version(&self, document_id: Uuid) -> AppResult<i64> {
        let max: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM document_versions WHERE document_id = $1",
        )
        .bind(document_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(max)
    }

    async fn get_metadata(&self, document_id: Uuid) -> AppResult<Option<DocumentMetadata>> {
        let metadata = sqlx::query_as::<_, DocumentMetadata>(
            r#"
            SELECT document_id, slug, title, owner_id, updated_at
            FROM document_metadata
            WHERE document_id = $1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(metadata)
    }

    async fn list_versions(&self, document_id: Uuid) -> AppResult<Vec<DocumentVersion>> {
        let versions = sqlx::query_as::<_, DocumentVersion>(
            r#"
            SELECT document_id, version, data, commit_message, dedup_key, created_at
            FROM document_versions
            WHERE document_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(versions)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
