//! Storage collaborator boundary.
//!
//! The concrete schema and its migrations are owned outside this crate; the
//! pipeline only needs the operations below. `DocumentStore` is an injected
//! interface so tests substitute the in-memory fake for Postgres.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{DocumentMetadata, DocumentVersion};
use crate::types::AppResult;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub async fn create_pool(config: &DatabaseConfig) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect(&config.url)
        .await?;
    Ok(pool)
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist one snapshot: the version row and the metadata upsert commit
    /// or roll back together. A job is durable only once this returns true,
    /// so a failure can never leave a version row behind without its
    /// metadata, and a retried job can never dead-letter after a partial
    /// write.
    ///
    /// Returns false when a unique constraint rejected the version insert,
    /// either because the version number was taken by a concurrent writer or
    /// because the dedup key already exists for this document; nothing is
    /// written in that case. The caller disambiguates via
    /// `find_version_by_dedup`.
    ///
    /// `slug` and `owner_id` are only honored when the metadata row does not
    /// exist yet; the slug of an existing document is never rewritten.
    #[allow(clippy::too_many_arguments)]
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
    ) -> AppResult<bool>;

    /// Version previously persisted for this exact snapshot, if any.
    async fn find_version_by_dedup(
        &self,
        document_id: Uuid,
        dedup_key: &str,
    ) -> AppResult<Option<i64>>;

    /// Highest persisted version for the document, 0 if none.
    async fn max_version(&self, document_id: Uuid) -> AppResult<i64>;

    async fn get_metadata(&self, document_id: Uuid) -> AppResult<Option<DocumentMetadata>>;

    /// All versions for a document, ordered by version. The authoritative
    /// answer to "what is durably saved", independent of any notification.
    async fn list_versions(&self, document_id: Uuid) -> AppResult<Vec<DocumentVersion>>;

    /// Backend connectivity probe for health reporting.
    async fn ping(&self) -> AppResult<()>;
}
