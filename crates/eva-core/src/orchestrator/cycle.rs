use chrono::{DateTime, Utc};
use eva_protocol::{
    Experiment, GrowthMetrics, Insights, MemoryUpdateSummary, PerceptionSnapshot,
};
use serde::Serialize;
use serde_json::Value;

/// Working state of one iteration. Exactly one is current per orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct EvolutionCycle {
    pub number: u64,
    pub started_at: DateTime<Utc>,
    pub perception: PerceptionSnapshot,
    pub memory_updates: MemoryUpdateSummary,
    pub insights: Insights,
    pub experiments: Vec<ExperimentOutcome>,
    pub output: Option<CycleOutput>,
}

impl EvolutionCycle {
    pub(crate) fn new(number: u64) -> Self {
        Self {
            number,
            started_at: Utc::now(),
            perception: PerceptionSnapshot::new(),
            memory_updates: MemoryUpdateSummary::default(),
            insights: Insights::default(),
            experiments: Vec::new(),
            output: None,
        }
    }

    pub fn successful_experiments(&self) -> usize {
        self.experiments.iter().filter(|e| e.success).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentOutcome {
    pub experiment: Experiment,
    pub success: bool,
    pub detail: String,
    pub metrics: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleOutput {
    pub insights_found: usize,
    pub experiments_run: usize,
    pub experiments_succeeded: usize,
    pub growth: GrowthMetrics,
    pub recommendations: Vec<String>,
    pub knowledge_growth_rate: f64,
}
