//! Shared test harness: a kernel wired over in-memory fakes, plus helpers
//! for driving the dispatcher and worker by hand.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use conveyor_core::kernel::broker::{MemoryBroker, Subscription};
use conveyor_core::kernel::embedding::HashEmbedder;
use conveyor_core::kernel::handlers::standard_registry;
use conveyor_core::kernel::jobs::testing::MemoryJobStore;
use conveyor_core::kernel::jobs::{
    DispatcherConfig, IngestService, JobStatus, JobStore, OutboxDispatcher, StatusReader,
    SubmitRequest, WorkerConfig, WorkerRuntime,
};
use conveyor_core::kernel::vector::MemoryVectorIndex;
use conveyor_core::kernel::Kernel;
use conveyor_core::server::build_app;
use conveyor_core::server::middleware::JwtVerifier;
use conveyor_core::Config;

pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub store: Arc<MemoryJobStore>,
    pub broker: Arc<MemoryBroker>,
    pub vectors: Arc<MemoryVectorIndex>,
    pub ingest: IngestService,
    pub status: StatusReader,
    pub dispatcher: OutboxDispatcher,
    pub runtime: Arc<WorkerRuntime>,
    subscription: tokio::sync::Mutex<Box<dyn Subscription>>,
    verifier: JwtVerifier,
}

impl Harness {
    pub async fn new() -> Self {
        let config = Config::for_tests();
        let store = Arc::new(MemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let vectors = Arc::new(MemoryVectorIndex::new());
        let embedder = Arc::new(HashEmbedder::default());

        let kernel = Arc::new(Kernel::new(
            config,
            store.clone(),
            broker.clone(),
            embedder,
            vectors.clone(),
        ));

        let registry = Arc::new(standard_registry(Duration::from_millis(1)));
        let runtime = Arc::new(WorkerRuntime::with_config(
            Arc::clone(&kernel),
            registry,
            WorkerConfig {
                queue: "default".to_string(),
                min_backoff_ms: 1,
                max_backoff_ms: 2,
                max_retries: 3,
                worker_id: "test-worker".to_string(),
            },
        ));

        let dispatcher = OutboxDispatcher::with_config(
            Arc::clone(&kernel.store),
            Arc::clone(&kernel.broker),
            DispatcherConfig {
                interval: Duration::from_millis(10),
                batch_size: 100,
            },
        );

        let subscription = tokio::sync::Mutex::new(
            kernel.broker.subscribe("default").await.expect("subscribe"),
        );

        Self {
            ingest: kernel.ingest(),
            status: kernel.status_reader(),
            verifier: JwtVerifier::new(&kernel.config.auth_jwt_secret),
            kernel,
            store,
            broker,
            vectors,
            dispatcher,
            runtime,
            subscription,
        }
    }

    pub fn app(&self) -> Router {
        build_app(Arc::clone(&self.kernel))
    }

    pub fn token_for(&self, user_id: &str, org_id: Uuid) -> String {
        self.verifier.issue(user_id, org_id)
    }

    pub async fn submit_mock(&self, org_id: Uuid, payload: Value) -> Uuid {
        self.ingest
            .submit(
                org_id,
                Some("tester".to_string()),
                SubmitRequest::new("mock", payload.as_object().cloned().unwrap_or_default()),
            )
            .await
            .expect("submit")
            .job_id()
    }

    /// One dispatcher tick: claim pending outbox rows and publish them.
    pub async fn dispatch(&self) -> (usize, usize) {
        self.dispatcher.dispatch_once().await.expect("dispatch")
    }

    /// Consume and process one delivery. Returns false when the queue is
    /// drained.
    pub async fn work_one(&self) -> bool {
        let mut subscription = self.subscription.lock().await;
        match tokio::time::timeout(Duration::from_millis(200), subscription.next()).await {
            Ok(Some(delivery)) => {
                self.runtime.handle_delivery(delivery).await;
                true
            }
            _ => false,
        }
    }

    /// Process deliveries until the queue stays empty.
    pub async fn drain(&self) {
        while self.work_one().await {}
    }

    /// Dispatch then drain: the full submit-to-terminal path.
    pub async fn run_to_completion(&self) {
        self.dispatch().await;
        self.drain().await;
    }

    /// The job's status-change sequence (progress events filtered out).
    pub async fn transition_log(&self, job_id: Uuid) -> Vec<(Option<JobStatus>, JobStatus)> {
        self.store
            .events(job_id)
            .await
            .expect("events")
            .into_iter()
            .filter(|e| e.prev_status != Some(e.next_status))
            .map(|e| (e.prev_status, e.next_status))
            .collect()
    }
}

/// POST a JSON body with a bearer token and return the response.
pub async fn post_json(app: Router, path: &str, token: Option<&str>, body: Value) -> Response<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder.body(Body::from(body.to_string())).expect("request");
    app.oneshot(request).await.expect("response")
}

/// GET a path with a bearer token and return the response.
pub async fn get_path(app: Router, path: &str, token: Option<&str>) -> Response<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder.body(Body::empty()).expect("request");
    app.oneshot(request).await.expect("response")
}

/// Decode a JSON response body.
pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

/// Assert status and decode the body in one step.
pub async fn expect_json(response: Response<Body>, status: StatusCode) -> Value {
    assert_eq!(response.status(), status);
    json_body(response).await
}
