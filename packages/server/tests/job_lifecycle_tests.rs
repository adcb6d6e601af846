//! End-to-end lifecycle: dispatch, execution, duplicate delivery, retries,
//! and dead-lettering.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conveyor_core::kernel::jobs::{JobStatus, JobStore, SubmitRequest, TaskMessage};

fn payload(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn happy_path_runs_to_succeeded() {
    let harness = Harness::new().await;
    let job_id = harness.submit_mock(Uuid::new_v4(), json!({"stage": "a"})).await;

    harness.run_to_completion().await;

    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.started_at.is_some());
    assert!(job.finished_at.is_some());
    assert_eq!(job.attempt, 0);

    assert_eq!(
        harness.transition_log(job_id).await,
        vec![
            (None, JobStatus::Queued),
            (Some(JobStatus::Queued), JobStatus::Running),
            (Some(JobStatus::Running), JobStatus::Succeeded),
        ]
    );

    // The final event carries the handler's result.
    let latest = harness.store.latest_event(job_id).await.unwrap().unwrap();
    let detail = latest.detail.unwrap();
    assert_eq!(detail["progress"], 100);
    assert_eq!(detail["result"]["stages_completed"][0], "extracting");
}

#[tokio::test]
async fn progress_events_are_visible_and_ordered() {
    let harness = Harness::new().await;
    let job_id = harness.submit_mock(Uuid::new_v4(), json!({"stage": "a"})).await;

    harness.run_to_completion().await;

    let events = harness.store.events(job_id).await.unwrap();
    let stages: Vec<String> = events
        .iter()
        .filter(|e| e.prev_status == Some(e.next_status))
        .filter_map(|e| e.detail.as_ref())
        .filter_map(|d| d["stage"].as_str().map(str::to_string))
        .collect();

    assert_eq!(
        stages,
        vec![
            "extracting",
            "extracting",
            "analyzing",
            "analyzing",
            "indexing",
            "indexing"
        ]
    );

    // Progress never decreases within the run.
    let progress: Vec<i64> = events
        .iter()
        .filter_map(|e| e.detail.as_ref())
        .filter_map(|d| d["progress"].as_i64())
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
}

#[tokio::test]
async fn pending_outbox_row_survives_until_a_dispatcher_runs() {
    // Crash-between-commit-and-publish: the submit commits but no dispatcher
    // tick happens. A later dispatcher (the restart) finds the row.
    let harness = Harness::new().await;
    let job_id = harness.submit_mock(Uuid::new_v4(), json!({"k": "v"})).await;

    // Nothing was published yet.
    assert!(!harness.work_one().await);
    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    // The "restarted" dispatcher drains the backlog and the job completes.
    let (sent, failed) = harness.dispatch().await;
    assert_eq!((sent, failed), (1, 0));
    harness.drain().await;

    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn duplicate_delivery_is_a_noop_after_terminal_state() {
    let harness = Harness::new().await;
    let job_id = harness.submit_mock(Uuid::new_v4(), json!({"k": "v"})).await;

    harness.run_to_completion().await;

    // Force the broker to deliver the same message again.
    let rows = harness.store.outbox_for_job(job_id).await.unwrap();
    let message = TaskMessage::from_outbox(&rows[0]).unwrap();
    harness.kernel.broker.publish(&message).await.unwrap();
    harness.drain().await;

    let events = harness.transition_log(job_id).await;
    let succeeded_count = events
        .iter()
        .filter(|(_, next)| *next == JobStatus::Succeeded)
        .count();
    assert_eq!(succeeded_count, 1, "no duplicate succeeded event");

    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn retry_exhaustion_dead_letters_with_full_transition_trail() {
    let harness = Harness::new().await;
    let org = Uuid::new_v4();

    let job_id = harness
        .ingest
        .submit(
            org,
            None,
            SubmitRequest::new("mock", payload(json!({"k": "v"})))
                .fail_at("analyzing")
                .max_attempts(2),
        )
        .await
        .unwrap()
        .job_id();

    harness.run_to_completion().await;

    use JobStatus::*;
    assert_eq!(
        harness.transition_log(job_id).await,
        vec![
            (None, Queued),
            (Some(Queued), Running),
            (Some(Running), Failed),
            (Some(Failed), Queued),
            (Some(Queued), Running),
            (Some(Running), Failed),
            (Some(Failed), DeadLetter),
        ]
    );

    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, DeadLetter);
    assert_eq!(job.attempt, 2);
    assert!(job.finished_at.is_some());
    assert!(job
        .last_error_message
        .as_deref()
        .unwrap()
        .contains("analyzing"));
}

#[tokio::test]
async fn observed_transitions_stay_inside_the_state_machine() {
    let harness = Harness::new().await;
    let org = Uuid::new_v4();

    // One success, one dead-letter: cover both shapes.
    let ok_id = harness.submit_mock(org, json!({"n": 1})).await;
    let dead_id = harness
        .ingest
        .submit(
            org,
            None,
            SubmitRequest::new("mock", payload(json!({"n": 2})))
                .fail_at("extracting")
                .max_attempts(1),
        )
        .await
        .unwrap()
        .job_id();

    harness.run_to_completion().await;

    for job_id in [ok_id, dead_id] {
        for (prev, next) in harness.transition_log(job_id).await {
            match prev {
                None => assert_eq!(next, JobStatus::Queued, "initial event must enter queued"),
                Some(prev) => assert!(
                    prev.can_transition_to(next),
                    "illegal edge {prev:?} -> {next:?} observed for {job_id}"
                ),
            }
        }

        // Terminal status and finished_at stay coherent.
        let job = harness.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status.is_terminal(), job.finished_at.is_some());
    }
}

#[tokio::test]
async fn validation_failures_are_permanent() {
    let harness = Harness::new().await;
    let org = Uuid::new_v4();

    // Missing text: the handler rejects it as a validation error.
    let job_id = harness
        .ingest
        .submit(
            org,
            None,
            SubmitRequest::new(
                "embed_text",
                payload(json!({"asset_id": "doc_1", "segment_id": "chunk_0"})),
            ),
        )
        .await
        .unwrap()
        .job_id();

    harness.run_to_completion().await;

    use JobStatus::*;
    assert_eq!(
        harness.transition_log(job_id).await,
        vec![
            (None, Queued),
            (Some(Queued), Running),
            (Some(Running), Failed),
        ],
        "no retry after a validation failure"
    );

    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, Failed);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.last_error_code.as_deref(), Some("VALIDATION_ERROR"));
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn first_retry_does_not_touch_started_at_twice() {
    let harness = Harness::new().await;
    let org = Uuid::new_v4();

    let job_id = harness
        .ingest
        .submit(
            org,
            None,
            SubmitRequest::new("mock", payload(json!({"k": "v"})))
                .fail_at("indexing")
                .max_attempts(3),
        )
        .await
        .unwrap()
        .job_id();

    harness.dispatch().await;
    // First attempt fails and requeues.
    assert!(harness.work_one().await);
    let after_first = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(after_first.status, JobStatus::Queued);
    assert_eq!(after_first.attempt, 1);
    assert!(after_first.finished_at.is_none(), "requeue clears finished_at");
    let first_started = after_first.started_at.unwrap();

    harness.drain().await;

    let job = harness.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.started_at, Some(first_started), "started_at set once");
}

#[tokio::test]
async fn worker_runtime_stops_on_cancellation() {
    let harness = Harness::new().await;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&harness.runtime).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("worker exits after cancellation")
        .unwrap()
        .unwrap();
}
