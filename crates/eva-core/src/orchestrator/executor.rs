use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use eva_protocol::Experiment;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct ExperimentResult {
    pub success: bool,
    pub detail: String,
    pub metrics: Value,
}

/// Runs an experiment that has already passed policy and lease gating.
#[async_trait]
pub trait ExperimentExecutor: Send + Sync {
    async fn execute(&self, experiment: &Experiment) -> Result<ExperimentResult>;
}

/// Stand-in executor: waits a fixed latency and reports success.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    latency: Duration,
}

impl SimulatedExecutor {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl ExperimentExecutor for SimulatedExecutor {
    async fn execute(&self, experiment: &Experiment) -> Result<ExperimentResult> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(ExperimentResult {
            success: true,
            detail: format!("experiment {} completed in simulation", experiment.id),
            metrics: json!({
                "latency_ms": self.latency.as_millis() as u64,
                "kind": experiment.kind.as_str(),
            }),
        })
    }
}
