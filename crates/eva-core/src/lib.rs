//! Orchestration and governance core: lease governor, cycle scheduler, kill
//! switch and the `EvaCore` bootstrap that wires them to the policy engine
//! and the knowledge fusion engine.

use std::sync::Arc;

use eva_events::Bus;
use eva_knowledge::KnowledgeFusionEngine;
use eva_policy::{PolicyEngine, PolicyStatus, PolicyViolation};
use eva_protocol::GrowthMetrics;
use serde::Serialize;
use tracing::info;

pub mod config;
mod error;
pub mod killswitch;
pub mod leases;
pub mod orchestrator;
pub mod tasks;

pub use config::{
    config_schema_json, load_config, write_schema_file, Config, CycleConfig, KillSwitchConfig,
    LeaseConfig,
};
pub use error::CoreError;
pub use killswitch::KillSwitch;
pub use leases::{Lease, LeaseId, LeaseManager, LeaseRequirement, LeaseStatus};
pub use orchestrator::{
    CycleState, EvolutionCycle, ExperimentExecutor, InteractionTracker, Orchestrator,
    OrchestratorStatus, PerceptionSource,
};

/// Optional replacements for the default perception sources and executor.
#[derive(Default)]
pub struct CoreOverrides {
    pub sources: Option<Vec<Arc<dyn PerceptionSource>>>,
    pub executor: Option<Arc<dyn ExperimentExecutor>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub orchestrator: OrchestratorStatus,
    pub leases: LeaseStatus,
    pub policy: PolicyStatus,
    pub knowledge: GrowthMetrics,
}

/// The four components, initialised in dependency order and shared by `Arc`.
#[derive(Debug)]
pub struct EvaCore {
    pub policy: Arc<PolicyEngine>,
    pub leases: Arc<LeaseManager>,
    pub knowledge: Arc<KnowledgeFusionEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub killswitch: Arc<KillSwitch>,
    pub interactions: InteractionTracker,
}

impl EvaCore {
    /// Must be called from within a tokio runtime; the lease expiry monitor
    /// is spawned here.
    pub fn initialize(config: Config, bus: Option<Bus>) -> Result<Self, CoreError> {
        Self::initialize_with(config, bus, CoreOverrides::default())
    }

    pub fn initialize_with(
        config: Config,
        bus: Option<Bus>,
        overrides: CoreOverrides,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        info!(target: "eva::cycle", "initializing core components");

        let policy = Arc::new(PolicyEngine::new(config.policy.clone()));
        policy.initialize()?;

        let leases = Arc::new(LeaseManager::new(
            config.leases.clone(),
            policy.clone(),
            bus.clone(),
        ));
        leases.initialize();

        let knowledge = Arc::new(KnowledgeFusionEngine::new(config.knowledge.clone()));
        knowledge.initialize()?;

        let killswitch = Arc::new(KillSwitch::new(
            policy.clone(),
            config.killswitch.critical_violation_threshold,
            bus.clone(),
        ));

        let interactions = InteractionTracker::new();
        let sources = overrides
            .sources
            .unwrap_or_else(|| orchestrator::default_sources(policy.clone(), interactions.clone()));
        let mut orch = Orchestrator::new(
            config.cycle.clone(),
            policy.clone(),
            leases.clone(),
            knowledge.clone(),
        )
        .with_sources(sources)
        .with_killswitch(killswitch.clone());
        if let Some(executor) = overrides.executor {
            orch = orch.with_executor(executor);
        }
        if let Some(bus) = bus {
            orch = orch.with_bus(bus);
        }
        orch.initialize()?;

        info!(target: "eva::cycle", "core initialized");
        Ok(Self {
            policy,
            leases,
            knowledge,
            orchestrator: Arc::new(orch),
            killswitch,
            interactions,
        })
    }

    /// Run the evolution loop until shutdown.
    pub async fn run(&self) -> Result<(), CoreError> {
        self.orchestrator.start_cycle().await
    }

    /// Stop the orchestrator and wait out any cycle in flight, then stop the
    /// lease manager, then the policy engine.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown();
        self.orchestrator.stopped().await;
        self.leases.shutdown().await;
        self.policy.shutdown();
        info!(target: "eva::cycle", "core shut down");
    }

    pub async fn status(&self) -> CoreStatus {
        CoreStatus {
            orchestrator: self.orchestrator.status(),
            leases: self.leases.lease_status().await,
            policy: self.policy.status(),
            knowledge: self.knowledge.growth_metrics(),
        }
    }

    pub fn violations(&self) -> Vec<PolicyViolation> {
        self.policy.violations()
    }
}
