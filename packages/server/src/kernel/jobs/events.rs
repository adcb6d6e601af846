//! Append-only audit log of job state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use super::JobStatus;

/// One immutable ledger entry. Ordering by `ts` per job is a total order
/// for that job; rows are never updated after insert.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub ts: DateTime<Utc>,
    /// `None` for the initial `-> queued` event.
    pub prev_status: Option<JobStatus>,
    pub next_status: JobStatus,
    pub detail: Option<Value>,
}

/// Structured content of a JobEvent's detail blob.
///
/// Stage, progress, and result are not columns on the job row; the latest
/// event's detail is the source of truth for these transient fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventDetail {
    pub fn stage(stage: impl Into<String>, progress: i32) -> Self {
        Self {
            stage: Some(stage.into()),
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn result(result: Value) -> Self {
        Self {
            result: Some(result),
            progress: Some(100),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stage.is_none()
            && self.progress.is_none()
            && self.result.is_none()
            && self.error.is_none()
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).expect("event detail serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_detail_serializes_compactly() {
        let detail = EventDetail::stage("extracting", 33).into_value();
        assert_eq!(detail, json!({"stage": "extracting", "progress": 33}));
    }

    #[test]
    fn result_detail_carries_full_progress() {
        let detail = EventDetail::result(json!({"ok": true})).into_value();
        assert_eq!(detail["progress"], 100);
        assert_eq!(detail["result"]["ok"], true);
    }

    #[test]
    fn empty_detail_detected() {
        assert!(EventDetail::default().is_empty());
        assert!(!EventDetail::error("boom").is_empty());
    }
}
