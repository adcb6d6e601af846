//! Status reader: tenant-scoped, read-only projection of ledger state for
//! polling clients.
//!
//! Stage, progress, and result are not job columns; they are projected from
//! the latest event's detail blob. Readers take no locks and accept a mildly
//! stale view.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::common::CoreError;
use crate::config::StatusVocabulary;

use super::events::EventDetail;
use super::job::JobStatus;
use super::store::JobStore;

/// The view served to polling clients. Full error detail (code, stack)
/// stays server-side; clients see only the short message.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub id: Uuid,
    pub status: String,
    pub stage: Option<String>,
    pub progress: i32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Map an internal status onto the configured external vocabulary.
pub fn external_status(vocabulary: StatusVocabulary, status: JobStatus) -> &'static str {
    match vocabulary {
        StatusVocabulary::Internal => status.as_str(),
        StatusVocabulary::Legacy => match status {
            JobStatus::Queued => "pending",
            JobStatus::Running => "processing",
            JobStatus::Succeeded => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::DeadLetter => "failed",
        },
    }
}

pub struct StatusReader {
    store: Arc<dyn JobStore>,
    vocabulary: StatusVocabulary,
}

impl StatusReader {
    pub fn new(store: Arc<dyn JobStore>, vocabulary: StatusVocabulary) -> Self {
        Self { store, vocabulary }
    }

    /// Read a job's status on behalf of a tenant.
    ///
    /// Fails with [`CoreError::Forbidden`] when the job belongs to another
    /// org, before any detail leaves the store.
    pub async fn get_status(
        &self,
        job_id: Uuid,
        caller_org_id: Uuid,
    ) -> Result<StatusView, CoreError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CoreError::NotFound)?;

        if job.org_id != caller_org_id {
            return Err(CoreError::Forbidden);
        }

        let latest = self.store.latest_event(job_id).await?;
        let detail: EventDetail = latest
            .and_then(|event| event.detail)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        Ok(StatusView {
            id: job.id,
            status: external_status(self.vocabulary, job.status).to_string(),
            stage: detail.stage,
            progress: detail.progress.unwrap_or(0),
            result: detail.result,
            error: job.last_error_message,
            created_at: job.created_at,
            updated_at: job.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_vocabulary_matches_the_published_mapping() {
        use JobStatus::*;
        let legacy = StatusVocabulary::Legacy;
        assert_eq!(external_status(legacy, Queued), "pending");
        assert_eq!(external_status(legacy, Running), "processing");
        assert_eq!(external_status(legacy, Succeeded), "completed");
        assert_eq!(external_status(legacy, Failed), "failed");
        assert_eq!(external_status(legacy, Canceled), "canceled");
        assert_eq!(external_status(legacy, DeadLetter), "failed");
    }

    #[test]
    fn internal_vocabulary_is_passthrough() {
        use JobStatus::*;
        let internal = StatusVocabulary::Internal;
        for status in [Queued, Running, Succeeded, Failed, Canceled, DeadLetter] {
            assert_eq!(external_status(internal, status), status.as_str());
        }
    }
}
