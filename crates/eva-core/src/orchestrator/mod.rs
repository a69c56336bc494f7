//! The evolution cycle scheduler.
//!
//! One long-lived loop runs perception, fusion, insight, experimentation and
//! output strictly in sequence, archives the cycle, then paces itself to the
//! configured target interval. A phase failure parks the loop in
//! [`CycleState::Error`] for the recovery pause and then resumes; only
//! [`Orchestrator::shutdown`] or the kill switch end the loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use eva_events::Bus;
use eva_knowledge::KnowledgeFusionEngine;
use eva_policy::PolicyEngine;
use eva_topics as topics;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CycleConfig;
use crate::killswitch::KillSwitch;
use crate::leases::LeaseManager;
use crate::CoreError;

mod cycle;
mod executor;
mod sources;
mod state;

pub use cycle::{CycleOutput, EvolutionCycle, ExperimentOutcome};
pub use executor::{ExperimentExecutor, ExperimentResult, SimulatedExecutor};
pub use sources::{
    EnvironmentalSource, FixedSource, InteractionTracker, PerceptionSource, SystemMetricsSource,
    UserInteractionSource,
};
pub use state::CycleState;

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub state: CycleState,
    pub running: bool,
    pub total_cycles: u64,
    pub successful_experiments: u64,
    pub knowledge_growth_rate: f64,
    pub uptime_secs: f64,
    pub last_cycle_ms: Option<u64>,
    pub killswitch_engaged: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total_cycles: u64,
    successful_experiments: u64,
    knowledge_growth_rate: f64,
    last_cycle_ms: Option<u64>,
    first_cycle_at: Option<Instant>,
}

/// Default perception sources: host metrics, user interaction and environment.
pub fn default_sources(
    policy: Arc<PolicyEngine>,
    tracker: InteractionTracker,
) -> Vec<Arc<dyn PerceptionSource>> {
    vec![
        Arc::new(SystemMetricsSource::new()),
        Arc::new(UserInteractionSource::new(tracker)),
        Arc::new(EnvironmentalSource::new(Some(policy))),
    ]
}

pub struct Orchestrator {
    cfg: CycleConfig,
    policy: Arc<PolicyEngine>,
    leases: Arc<LeaseManager>,
    knowledge: Arc<KnowledgeFusionEngine>,
    sources: Vec<Arc<dyn PerceptionSource>>,
    executor: Arc<dyn ExperimentExecutor>,
    killswitch: Option<Arc<KillSwitch>>,
    bus: Option<Bus>,
    state: RwLock<CycleState>,
    running: AtomicBool,
    wake: Notify,
    counters: Mutex<Counters>,
    current: Mutex<Option<EvolutionCycle>>,
    archive: Mutex<VecDeque<EvolutionCycle>>,
    flow: tokio::sync::Mutex<()>,
    active: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .field("sources", &self.sources.iter().map(|s| s.category()).collect::<Vec<_>>())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        cfg: CycleConfig,
        policy: Arc<PolicyEngine>,
        leases: Arc<LeaseManager>,
        knowledge: Arc<KnowledgeFusionEngine>,
    ) -> Self {
        let sources = default_sources(policy.clone(), InteractionTracker::new());
        let executor = Arc::new(SimulatedExecutor::new(cfg.experiment_latency()));
        Self {
            cfg,
            policy,
            leases,
            knowledge,
            sources,
            executor,
            killswitch: None,
            bus: None,
            state: RwLock::new(CycleState::Initializing),
            running: AtomicBool::new(false),
            wake: Notify::new(),
            counters: Mutex::new(Counters::default()),
            current: Mutex::new(None),
            archive: Mutex::new(VecDeque::new()),
            flow: tokio::sync::Mutex::new(()),
            active: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_sources(mut self, sources: Vec<Arc<dyn PerceptionSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ExperimentExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_killswitch(mut self, killswitch: Arc<KillSwitch>) -> Self {
        self.killswitch = Some(killswitch);
        self
    }

    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn state(&self) -> CycleState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: CycleState) {
        let prev = {
            let mut state = self.state.write();
            let prev = *state;
            if prev == next {
                return;
            }
            *state = next;
            prev
        };
        if !prev.can_transition_to(next) {
            warn!(target: "eva::cycle", from = %prev, to = %next, "unexpected state transition");
        }
        debug!(target: "eva::cycle", from = %prev, to = %next, "state changed");
        self.publish(
            topics::TOPIC_ORCHESTRATOR_STATE_CHANGED,
            json!({"from": prev, "to": next}),
        );
    }

    fn publish(&self, topic: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, &payload);
        }
    }

    /// Verify every collaborator is ready, then move to `Idle`.
    pub fn initialize(&self) -> Result<(), CoreError> {
        info!(target: "eva::cycle", "initializing orchestrator");
        if !self.leases.is_ready() {
            return Err(CoreError::NotReady {
                component: "lease manager",
            });
        }
        if !self.policy.is_ready() {
            return Err(CoreError::NotReady {
                component: "policy engine",
            });
        }
        if !self.knowledge.is_ready() {
            return Err(CoreError::NotReady {
                component: "knowledge fusion engine",
            });
        }
        self.set_state(CycleState::Idle);
        info!(target: "eva::cycle", sources = self.sources.len(), "orchestrator ready");
        Ok(())
    }

    fn killswitch_engaged(&self) -> bool {
        self.killswitch.as_ref().is_some_and(|ks| ks.is_engaged())
    }

    /// Run cycles until shutdown or the kill switch stops the loop.
    pub async fn start_cycle(&self) -> Result<(), CoreError> {
        if self.state() == CycleState::Initializing {
            return Err(CoreError::NotReady {
                component: "orchestrator",
            });
        }
        let _active = self
            .active
            .try_lock()
            .map_err(|_| CoreError::AlreadyRunning)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyRunning);
        }
        info!(target: "eva::cycle", "starting evolution cycle");
        self.set_state(CycleState::Learning);

        while self.is_running() {
            if self.killswitch_engaged() {
                self.emergency_stop().await;
                break;
            }
            let started = Instant::now();
            match self.run_cycle_once().await {
                Ok(_) => {
                    let pause = self
                        .cfg
                        .target_interval()
                        .saturating_sub(started.elapsed())
                        .max(self.cfg.min_interval());
                    self.pause(pause).await;
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    error!(target: "eva::cycle", error = %message, "evolution cycle failed");
                    self.set_state(CycleState::Error);
                    self.publish(topics::TOPIC_CYCLE_FAILED, json!({"error": message}));
                    self.pause(self.cfg.recovery_pause()).await;
                    if self.is_running() {
                        self.set_state(CycleState::Learning);
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.set_state(CycleState::Idle);
        info!(target: "eva::cycle", "evolution cycle stopped");
        Ok(())
    }

    async fn pause(&self, duration: Duration) {
        // Registered before the flag check so a concurrent shutdown cannot
        // slip between the two.
        let woken = self.wake.notified();
        if !self.is_running() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = woken => {}
        }
    }

    /// Resolves once no evolution loop is running on this orchestrator,
    /// including the tail of a cycle that was in flight at shutdown.
    pub async fn stopped(&self) {
        let _active = self.active.lock().await;
    }

    async fn emergency_stop(&self) {
        let reason = self
            .killswitch
            .as_ref()
            .and_then(|ks| ks.reason())
            .unwrap_or_else(|| "kill switch engaged".to_string());
        error!(target: "eva::killswitch", %reason, "halting evolution cycle");
        let revoked = self.leases.revoke_all().await;
        self.policy.emergency_lockdown();
        self.running.store(false, Ordering::SeqCst);
        self.publish(
            topics::TOPIC_KILLSWITCH_ENGAGED,
            json!({"reason": reason, "revoked_leases": revoked}),
        );
    }

    /// Execute exactly one phase sequence and archive the result.
    pub async fn run_cycle_once(&self) -> Result<EvolutionCycle> {
        let _flow = self.flow.lock().await;
        let number = self.counters.lock().total_cycles + 1;
        let started = Instant::now();
        let mut cycle = EvolutionCycle::new(number);
        self.set_current(&cycle);

        self.perception_phase(&mut cycle)
            .await
            .context("perception phase")?;
        self.set_current(&cycle);
        self.memory_phase(&mut cycle);
        self.set_current(&cycle);
        self.learning_phase(&mut cycle);
        self.set_current(&cycle);
        self.experimentation_phase(&mut cycle)
            .await
            .context("experimentation phase")?;
        self.set_current(&cycle);
        self.output_phase(&mut cycle, number);
        self.set_current(&cycle);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        {
            let mut counters = self.counters.lock();
            counters.total_cycles = number;
            counters.last_cycle_ms = Some(elapsed_ms);
            counters.first_cycle_at.get_or_insert(started);
            if let Some(output) = &cycle.output {
                counters.knowledge_growth_rate = output.knowledge_growth_rate;
            }
        }
        {
            let mut archive = self.archive.lock();
            archive.push_back(cycle.clone());
            while archive.len() > self.cfg.archive_limit {
                archive.pop_front();
            }
        }

        info!(
            target: "eva::cycle",
            cycle = number,
            duration_ms = elapsed_ms,
            experiments = cycle.experiments.len(),
            "evolution cycle completed"
        );
        self.publish(
            topics::TOPIC_CYCLE_COMPLETED,
            json!({"cycle": number, "duration_ms": elapsed_ms, "output": cycle.output}),
        );
        Ok(cycle)
    }

    fn set_current(&self, cycle: &EvolutionCycle) {
        *self.current.lock() = Some(cycle.clone());
    }

    async fn perception_phase(&self, cycle: &mut EvolutionCycle) -> Result<()> {
        debug!(target: "eva::cycle", cycle = cycle.number, "perception phase");
        for source in &self.sources {
            let value = source
                .collect()
                .await
                .with_context(|| format!("source {}", source.category()))?;
            cycle.perception.insert(source.category(), value);
        }
        Ok(())
    }

    fn memory_phase(&self, cycle: &mut EvolutionCycle) {
        debug!(target: "eva::cycle", cycle = cycle.number, "memory phase");
        cycle.memory_updates = self.knowledge.process_perception(&cycle.perception);
    }

    fn learning_phase(&self, cycle: &mut EvolutionCycle) {
        debug!(target: "eva::cycle", cycle = cycle.number, "learning phase");
        cycle.insights = self
            .knowledge
            .generate_insights(&cycle.perception, &cycle.memory_updates);
    }

    async fn experimentation_phase(&self, cycle: &mut EvolutionCycle) -> Result<()> {
        debug!(target: "eva::cycle", cycle = cycle.number, "experimentation phase");
        for experiment in self.policy.filter_experiments(&cycle.insights) {
            if !self.leases.can_execute(&experiment).await {
                debug!(
                    target: "eva::cycle",
                    experiment = %experiment.id,
                    "experiment skipped: no lease"
                );
                continue;
            }
            let result = self
                .executor
                .execute(&experiment)
                .await
                .with_context(|| format!("experiment {}", experiment.id))?;
            if result.success {
                self.counters.lock().successful_experiments += 1;
            }
            cycle.experiments.push(ExperimentOutcome {
                experiment,
                success: result.success,
                detail: result.detail,
                metrics: result.metrics,
            });
        }
        Ok(())
    }

    fn output_phase(&self, cycle: &mut EvolutionCycle, cycles_completed: u64) {
        debug!(target: "eva::cycle", cycle = cycle.number, "output phase");
        let successful = self.counters.lock().successful_experiments;
        let knowledge_growth_rate = if cycles_completed == 0 {
            0.0
        } else {
            successful as f64 / cycles_completed as f64
        };
        cycle.output = Some(CycleOutput {
            insights_found: cycle.insights.total(),
            experiments_run: cycle.experiments.len(),
            experiments_succeeded: cycle.successful_experiments(),
            growth: self.knowledge.growth_metrics(),
            recommendations: cycle_recommendations(cycle),
            knowledge_growth_rate,
        });
    }

    /// Stop the loop at its next boundary and return to `Idle`.
    pub fn shutdown(&self) {
        info!(target: "eva::cycle", "orchestrator shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
        if self.state() != CycleState::Initializing {
            self.set_state(CycleState::Idle);
        }
    }

    pub fn status(&self) -> OrchestratorStatus {
        let counters = self.counters.lock();
        OrchestratorStatus {
            state: self.state(),
            running: self.is_running(),
            total_cycles: counters.total_cycles,
            successful_experiments: counters.successful_experiments,
            knowledge_growth_rate: counters.knowledge_growth_rate,
            uptime_secs: counters
                .first_cycle_at
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            last_cycle_ms: counters.last_cycle_ms,
            killswitch_engaged: self.killswitch_engaged(),
        }
    }

    pub fn current_cycle(&self) -> Option<EvolutionCycle> {
        self.current.lock().clone()
    }

    /// Up to `limit` most recent archived cycles, oldest first.
    pub fn recent_cycles(&self, limit: usize) -> Vec<EvolutionCycle> {
        let archive = self.archive.lock();
        let skip = archive.len().saturating_sub(limit);
        archive.iter().skip(skip).cloned().collect()
    }
}

fn cycle_recommendations(cycle: &EvolutionCycle) -> Vec<String> {
    let mut out = Vec::new();
    if cycle.experiments.is_empty() {
        out.push("No experiments ran this cycle; review policy filters and lease capacity".to_string());
    }
    if !cycle.insights.anomalies.is_empty() {
        out.push("Investigate detected anomalies before widening experimentation".to_string());
    }
    if !cycle.insights.optimizations.is_empty() {
        out.push("Schedule knowledge graph maintenance".to_string());
    }
    if out.is_empty() {
        out.push("Continue the current learning cadence".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LeaseConfig;
    use async_trait::async_trait;
    use eva_protocol::{PolicyLevel, CATEGORY_SYSTEM_METRICS};
    use serde_json::Value;
    use std::sync::atomic::AtomicUsize;

    struct FlakySource {
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl PerceptionSource for FlakySource {
        fn category(&self) -> &str {
            CATEGORY_SYSTEM_METRICS
        }

        async fn collect(&self) -> Result<Value> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("sensor offline");
            }
            Ok(json!({"cpu_usage": 10.0}))
        }
    }

    struct Parts {
        policy: Arc<PolicyEngine>,
        leases: Arc<LeaseManager>,
        knowledge: Arc<KnowledgeFusionEngine>,
    }

    fn parts() -> Parts {
        let policy = Arc::new(PolicyEngine::default());
        policy.initialize().unwrap();
        let leases = Arc::new(LeaseManager::new(
            LeaseConfig::default(),
            policy.clone(),
            None,
        ));
        leases.initialize();
        let knowledge = Arc::new(KnowledgeFusionEngine::default());
        knowledge.initialize().unwrap();
        Parts {
            policy,
            leases,
            knowledge,
        }
    }

    fn quiet_cfg() -> CycleConfig {
        CycleConfig {
            experiment_latency_ms: 0,
            ..Default::default()
        }
    }

    fn orchestrator(parts: &Parts, sources: Vec<Arc<dyn PerceptionSource>>) -> Orchestrator {
        Orchestrator::new(
            quiet_cfg(),
            parts.policy.clone(),
            parts.leases.clone(),
            parts.knowledge.clone(),
        )
        .with_sources(sources)
    }

    #[tokio::test]
    async fn initialize_requires_ready_collaborators() {
        let policy = Arc::new(PolicyEngine::default());
        let leases = Arc::new(LeaseManager::new(LeaseConfig::default(), policy.clone(), None));
        let knowledge = Arc::new(KnowledgeFusionEngine::default());
        let orch = Orchestrator::new(quiet_cfg(), policy, leases.clone(), knowledge);
        assert!(matches!(
            orch.initialize(),
            Err(CoreError::NotReady { component: "lease manager" })
        ));
        assert_eq!(orch.state(), CycleState::Initializing);
        assert!(matches!(
            orch.start_cycle().await,
            Err(CoreError::NotReady { .. })
        ));
        leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn single_cycle_runs_every_phase() {
        let parts = parts();
        let orch = orchestrator(
            &parts,
            vec![Arc::new(FixedSource::new(
                CATEGORY_SYSTEM_METRICS,
                json!({"cpu_usage": 50.0}),
            ))],
        );
        orch.initialize().unwrap();
        let cycle = orch.run_cycle_once().await.unwrap();
        assert_eq!(cycle.number, 1);
        assert_eq!(cycle.memory_updates.new_nodes, 1);
        assert!(cycle.insights.anomalies.is_empty());
        let ids: Vec<_> = cycle.experiments.iter().map(|e| e.experiment.id.as_str()).collect();
        assert_eq!(ids, ["exp_001", "exp_002", "exp_003"]);
        let output = cycle.output.as_ref().unwrap();
        assert_eq!(output.experiments_succeeded, 3);
        assert_eq!(output.growth.total_nodes, 4);

        let status = orch.status();
        assert_eq!(status.total_cycles, 1);
        assert_eq!(status.successful_experiments, 3);
        assert_eq!(status.knowledge_growth_rate, 3.0);
        assert_eq!(orch.recent_cycles(10).len(), 1);
        assert_eq!(orch.current_cycle().unwrap().number, 1);
        parts.leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn archive_is_bounded() {
        let parts = parts();
        let orch = Orchestrator::new(
            CycleConfig {
                archive_limit: 2,
                ..quiet_cfg()
            },
            parts.policy.clone(),
            parts.leases.clone(),
            parts.knowledge.clone(),
        )
        .with_sources(Vec::new());
        orch.initialize().unwrap();
        for _ in 0..3 {
            orch.run_cycle_once().await.unwrap();
        }
        let recent = orch.recent_cycles(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].number, 2);
        assert_eq!(recent[1].number, 3);
        parts.leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn phase_failure_enters_error_then_recovers() {
        let parts = parts();
        let orch = Arc::new(orchestrator(
            &parts,
            vec![Arc::new(FlakySource {
                failures_left: AtomicUsize::new(1),
            })],
        ));
        orch.initialize().unwrap();
        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start_cycle().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orch.state(), CycleState::Error);
        assert_eq!(orch.status().total_cycles, 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(orch.state(), CycleState::Learning);
        assert!(orch.status().total_cycles >= 1);
        assert!(matches!(
            orch.start_cycle().await,
            Err(CoreError::AlreadyRunning)
        ));

        orch.shutdown();
        runner.await.unwrap().unwrap();
        assert_eq!(orch.state(), CycleState::Idle);
        assert!(!orch.is_running());
        parts.leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loop_paces_to_target_interval() {
        let parts = parts();
        let orch = Arc::new(orchestrator(&parts, Vec::new()));
        orch.initialize().unwrap();
        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(orch.status().total_cycles, 4);
        orch.shutdown();
        runner.await.unwrap().unwrap();
        parts.leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn kill_switch_halts_and_locks_down() {
        let parts = parts();
        let switch = Arc::new(KillSwitch::new(parts.policy.clone(), 1, None));
        let orch = orchestrator(&parts, Vec::new()).with_killswitch(switch.clone());
        orch.initialize().unwrap();
        orch.run_cycle_once().await.unwrap();
        assert!(parts.leases.lease_status().await.active_leases > 0);

        parts
            .policy
            .report_violation("safety_001", None, PolicyLevel::Critical, "unsafe actuator");
        orch.start_cycle().await.unwrap();

        assert_eq!(orch.state(), CycleState::Idle);
        assert_eq!(orch.status().total_cycles, 1);
        assert!(orch.status().killswitch_engaged);
        assert_eq!(parts.leases.lease_status().await.active_leases, 0);
        assert_eq!(parts.policy.status().active_policies, 2);
        parts.leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_start_leaves_pacing_intact() {
        let parts = parts();
        let orch = Arc::new(orchestrator(&parts, Vec::new()));
        orch.initialize().unwrap();
        orch.shutdown();
        orch.stopped().await;

        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(orch.status().total_cycles, 1);
        orch.shutdown();
        orch.stopped().await;
        assert!(!orch.is_running());
        runner.await.unwrap().unwrap();
        parts.leases.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_waits_for_the_cycle_in_flight() {
        let parts = parts();
        let orch = Arc::new(
            Orchestrator::new(
                CycleConfig::default(),
                parts.policy.clone(),
                parts.leases.clone(),
                parts.knowledge.clone(),
            )
            .with_sources(Vec::new()),
        );
        orch.initialize().unwrap();
        let runner = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.start_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(orch.current_cycle().unwrap().output.is_none());

        orch.shutdown();
        orch.stopped().await;
        assert!(!orch.is_running());
        assert_eq!(orch.status().total_cycles, 1);
        assert_eq!(orch.recent_cycles(1)[0].experiments.len(), 3);
        runner.await.unwrap().unwrap();
        parts.leases.shutdown().await;
    }

    #[test]
    fn recommendations_are_never_empty() {
        let cycle = EvolutionCycle::new(1);
        let recs = cycle_recommendations(&cycle);
        assert_eq!(recs.len(), 1);
        assert!(recs[0].starts_with("No experiments"));
    }
}
