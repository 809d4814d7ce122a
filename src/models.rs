// Core data model for the persistence pipeline.
// Note: FromRow is needed for runtime query_as (without DATABASE_URL at compile time)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and routing context carried alongside a snapshot, supplied by the
/// collaboration server at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobContext {
    pub user_id: Uuid,
    pub user_email: String,
    pub slug: String,
    pub document_id: Uuid,
}

/// A unit of persistence work. Owned exclusively by the job queue until
/// claimed by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub document_name: String,
    /// Opaque encoded snapshot of the collaborative document.
    #[serde(with = "base64_bytes")]
    pub state: Vec<u8>,
    pub context: JobContext,
    pub commit_message: Option<String>,
    pub first_creation: bool,
    /// Completed (failed) processing attempts so far.
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        document_name: impl Into<String>,
        state: Vec<u8>,
        context: JobContext,
        commit_message: Option<String>,
        first_creation: bool,
    ) -> Self {
        Self {
            document_name: document_name.into(),
            state,
            context,
            commit_message,
            first_creation,
            attempts_made: 0,
            enqueued_at: Utc::now(),
        }
    }
}

/// A job as handed to a worker: queue-assigned id plus stall bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job_id: String,
    pub job: Job,
    /// Times this job was recovered by the stalled-job sweep.
    pub stalled_count: u32,
}

/// Terminal failure record. Never mutated after creation, never auto-pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub original_job_id: String,
    pub job: Job,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}

/// One durable snapshot of a document. `version` is 1-based, gapless and
/// unique per document; `dedup_key` makes duplicate deliveries a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentVersion {
    pub document_id: Uuid,
    pub version: i64,
    pub data: Vec<u8>,
    pub commit_message: Option<String>,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentMetadata {
    pub document_id: Uuid,
    /// Write-once at first creation, immutable thereafter.
    pub slug: String,
    pub title: Option<String>,
    pub owner_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Best-effort pub/sub message emitted after a durable write. Ephemeral.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfirmation {
    pub document_id: Uuid,
    pub version: i64,
    pub timestamp: DateTime<Utc>,
}

/// Liveness payload for `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub worker: WorkerHealth,
    pub services: ServiceHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub running: bool,
    pub paused: bool,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub queue_backend: String,
    pub storage: String,
}

/// Serde helper: snapshot bytes travel through JSON job payloads as base64.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
