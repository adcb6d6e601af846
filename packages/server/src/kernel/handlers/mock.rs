//! Staged mock pipeline for exercising the platform end to end.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::common::CoreError;
use crate::kernel::jobs::{JobContext, JobHandler};

/// Simulated stages and their relative durations.
const STAGES: [(&str, u32); 3] = [("extracting", 2), ("analyzing", 3), ("indexing", 1)];

/// Multi-stage mock job. Reports stage/progress through the ledger and fails
/// deterministically at the stage named by the `fail_at` kwarg, which is how
/// the retry and dead-letter paths get exercised.
pub struct ProcessMockHandler {
    tick: Duration,
}

impl ProcessMockHandler {
    /// `tick` scales the simulated stage durations.
    pub fn new(tick: Duration) -> Self {
        Self { tick }
    }
}

#[async_trait]
impl JobHandler for ProcessMockHandler {
    fn name(&self) -> &'static str {
        "process_mock"
    }

    async fn run(
        &self,
        ctx: &JobContext,
        _args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Option<Value>, CoreError> {
        let fail_at = kwargs.get("fail_at").and_then(Value::as_str);
        let total: u32 = STAGES.iter().map(|(_, weight)| weight).sum();
        let mut elapsed: u32 = 0;

        for (stage, weight) in STAGES {
            let progress = (elapsed * 100 / total) as i32;
            ctx.progress(stage, progress).await?;

            if fail_at == Some(stage) {
                return Err(CoreError::Handler(format!(
                    "deterministic failure at stage: {stage}"
                )));
            }

            tokio::time::sleep(self.tick * weight).await;
            elapsed += weight;

            let progress = (elapsed * 100 / total) as i32;
            ctx.progress(stage, progress).await?;
            info!(job_id = %ctx.job().id, stage, progress, "stage completed");
        }

        Ok(Some(json!({
            "stages_completed": STAGES.iter().map(|(stage, _)| *stage).collect::<Vec<_>>(),
            "total_ticks": total,
        })))
    }
}
