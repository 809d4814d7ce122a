//! In-memory document store.
//!
//! Mirrors the Postgres unique-constraint behavior so the persistence
//! engine's race-and-retry loop can be exercised without a database. The
//! failure-injection hooks drive the retry and readiness tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::{DocumentMetadata, DocumentVersion};
use crate::types::{AppError, AppResult};

use super::DocumentStore;

#[derive(Default)]
struct Inner {
    versions: HashMap<Uuid, Vec<DocumentVersion>>,
    metadata: HashMap<Uuid, DocumentMetadata>,
    fail_commits_remaining: u32,
    fail_metadata_writes: bool,
    unreachable: bool,
    write_latency: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` commit attempts fail with a transient storage error.
    pub fn fail_next_commits(&self, n: u32) {
        self.lock().fail_commits_remaining = n;
    }

    /// Make every metadata write fail. Like a failing statement inside the
    /// Postgres transaction, this rolls back the version row too.
    pub fn fail_metadata_writes(&self, fail: bool) {
        self.lock().fail_metadata_writes = fail;
    }

    /// Simulate the backend going away, for readiness tests.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Add artificial latency to inserts, for shutdown-drain tests.
    pub fn set_write_latency(&self, latency: Option<Duration>) {
        self.lock().write_latency = latency;
    }

    fn check_reachable(inner: &Inner) -> AppResult<()> {
        if inner.unreachable {
            return Err(AppError::Unavailable("storage unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
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
        let latency = self.lock().write_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        // Held for the whole commit: the version row and metadata change
        // land together or not at all, like the Postgres transaction.
        let mut inner = self.lock();
        Self::check_reachable(&inner)?;
        if inner.fail_commits_remaining > 0 {
            inner.fail_commits_remaining -= 1;
            return Err(AppError::Unavailable("injected storage failure".into()));
        }

        // unique (document_id, version) and (document_id, dedup_key)
        let taken = inner
            .versions
            .get(&document_id)
            .is_some_and(|rows| {
                rows.iter()
                    .any(|row| row.version == version || row.dedup_key == dedup_key)
            });
        if taken {
            return Ok(false);
        }

        if inner.fail_metadata_writes {
            return Err(AppError::Unavailable(
                "injected metadata write failure".into(),
            ));
        }

        inner.versions.entry(document_id).or_default().push(DocumentVersion {
            document_id,
            version,
            data: data.to_vec(),
            commit_message: commit_message.map(str::to_string),
            dedup_key: dedup_key.to_string(),
            created_at: Utc::now(),
        });

        match inner.metadata.get_mut(&document_id) {
            Some(existing) => {
                // slug is write-once; only mutable fields change here
                if let Some(title) = title {
                    existing.title = Some(title.to_string());
                }
                existing.updated_at = Utc::now();
            }
            None => {
                // Non-creation save of a document that was never created:
                // Postgres would update zero rows, so mirror that as a no-op.
                if let Some(slug) = slug {
                    inner.metadata.insert(
                        document_id,
                        DocumentMetadata {
                            document_id,
                            slug: slug.to_string(),
                            title: title.map(str::to_string),
                            owner_id,
                            updated_at: Utc::now(),
                        },
                    );
                }
            }
        }
        Ok(true)
    }

    async fn find_version_by_dedup(
        &self,
        document_id: Uuid,
        dedup_key: &str,
    ) -> AppResult<Option<i64>> {
        let inner = self.lock();
        Self::check_reachable(&inner)?;
        Ok(inner
            .versions
            .get(&document_id)
            .and_then(|rows| rows.iter().find(|row| row.dedup_key == dedup_key))
            .map(|row| row.version))
    }

    async fn max_version(&self, document_id: Uuid) -> AppResult<i64> {
        let inner = self.lock();
        Self::check_reachable(&inner)?;
        Ok(inner
            .versions
            .get(&document_id)
            .and_then(|rows| rows.iter().map(|row| row.version).max())
            .unwrap_or(0))
    }

    async fn get_metadata(&self, document_id: Uuid) -> AppResult<Option<DocumentMetadata>> {
        Ok(self.lock().metadata.get(&document_id).cloned())
    }

    async fn list_versions(&self, document_id: Uuid) -> AppResult<Vec<DocumentVersion>> {
        let mut rows = self
            .lock()
            .versions
            .get(&document_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|row| row.version);
        Ok(rows)
    }

    async fn ping(&self) -> AppResult<()> {
        let inner = self.lock();
        Self::check_reachable(&inner)
    }
}
