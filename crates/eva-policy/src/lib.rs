//! Policy engine: named, leveled rule sets that authorise lease requests and
//! screen candidate experiments.
//!
//! Authorisation is unanimous. Every active policy must accept a request; the
//! first refusal is recorded in an append-only violation log and the request
//! is denied. Denial is a normal outcome, never an error.
//!
//! Once [`PolicyEngine::shutdown`] runs, enforcement is inactive and every
//! authorisation check returns `true` (fail-open). This is deliberate and is
//! reported through [`PolicyStatus::enforcement_active`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use eva_protocol::{Attributes, Experiment, ExperimentKind, Insights, PolicyLevel, ResourceKind};
use parking_lot::{Mutex, RwLock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

mod bootstrap;
mod experiments;
mod rules;

pub use rules::RuleBreach;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PolicyError {
    #[error("no policies could be loaded")]
    NoPolicies,
    #[error("duplicate policy id: {0}")]
    DuplicateId(String),
    #[error("failed to load policy {id}: {reason}")]
    Load { id: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub description: String,
    pub level: PolicyLevel,
    pub rules: BTreeMap<String, Value>,
    pub active: bool,
}

/// Policy definition supplied through configuration.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PolicySpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub level: PolicyLevel,
    #[serde(default)]
    pub rules: BTreeMap<String, Value>,
}

impl From<PolicySpec> for Policy {
    fn from(spec: PolicySpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            description: spec.description,
            level: spec.level,
            rules: spec.rules,
            active: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PolicyConfig {
    /// Security posture preset: "standard" or "strict".
    #[serde(default = "default_posture")]
    pub posture: String,
    /// Policies loaded in addition to the bootstrap set.
    #[serde(default)]
    pub extra: Vec<PolicySpec>,
    /// Policy ids loaded inactive.
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default = "default_disallowed_kinds")]
    pub disallowed_experiment_kinds: Vec<ExperimentKind>,
}

fn default_posture() -> String {
    "standard".into()
}

fn default_disallowed_kinds() -> Vec<ExperimentKind> {
    vec![
        ExperimentKind::SystemModification,
        ExperimentKind::ExternalCommunication,
    ]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            posture: default_posture(),
            extra: Vec::new(),
            disabled: Vec::new(),
            disallowed_experiment_kinds: default_disallowed_kinds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub timestamp: DateTime<Utc>,
    pub policy_id: String,
    pub policy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_kind: Option<ResourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub severity: PolicyLevel,
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyStatus {
    pub total_policies: usize,
    pub active_policies: usize,
    pub violations: usize,
    pub critical_violations: usize,
    pub enforcement_active: bool,
}

pub struct PolicyEngine {
    cfg: PolicyConfig,
    policies: RwLock<Vec<Policy>>,
    violations: Mutex<Vec<PolicyViolation>>,
    enforcement_active: AtomicBool,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("cfg", &self.cfg)
            .field("policies", &self.policies.read().len())
            .field("enforcement_active", &self.enforcement_active())
            .finish()
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicyConfig::default())
    }
}

impl PolicyEngine {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self {
            cfg,
            policies: RwLock::new(Vec::new()),
            violations: Mutex::new(Vec::new()),
            enforcement_active: AtomicBool::new(true),
        }
    }

    /// Load the bootstrap policy set, the posture preset and any configured
    /// extras. Returns the number of loaded policies.
    pub fn initialize(&self) -> Result<usize, PolicyError> {
        info!(target: "eva::policy", posture = %self.cfg.posture, "initializing policy engine");
        let mut loaded = bootstrap::core_policies();
        loaded.extend(bootstrap::posture_policies(&self.cfg.posture));
        for spec in &self.cfg.extra {
            let policy: Policy = spec.clone().into();
            rules::validate(&policy).map_err(|reason| PolicyError::Load {
                id: policy.id.clone(),
                reason,
            })?;
            loaded.push(policy);
        }
        for id in &self.cfg.disabled {
            match loaded.iter_mut().find(|p| &p.id == id) {
                Some(policy) => policy.active = false,
                None => warn!(target: "eva::policy", policy = %id, "cannot disable unknown policy"),
            }
        }
        let count = self.load(loaded)?;
        info!(target: "eva::policy", policies = count, "policy engine initialized");
        Ok(count)
    }

    /// Replace the policy set. Rule sets are read-only from here on.
    pub fn load(&self, policies: Vec<Policy>) -> Result<usize, PolicyError> {
        if policies.is_empty() {
            return Err(PolicyError::NoPolicies);
        }
        for (idx, policy) in policies.iter().enumerate() {
            if policies[..idx].iter().any(|p| p.id == policy.id) {
                return Err(PolicyError::DuplicateId(policy.id.clone()));
            }
        }
        let count = policies.len();
        *self.policies.write() = policies;
        self.enforcement_active.store(true, Ordering::SeqCst);
        Ok(count)
    }

    pub fn is_ready(&self) -> bool {
        !self.policies.read().is_empty()
    }

    pub fn enforcement_active(&self) -> bool {
        self.enforcement_active.load(Ordering::SeqCst)
    }

    /// Unanimous authorisation of a lease request.
    pub fn can_grant_lease(&self, kind: ResourceKind, attrs: &Attributes) -> bool {
        if !self.enforcement_active() {
            return true;
        }
        let denial = {
            let policies = self.policies.read();
            policies.iter().filter(|p| p.active).find_map(|p| {
                rules::check(p, kind, attrs)
                    .err()
                    .map(|breach| (p.id.clone(), p.name.clone(), p.level, breach))
            })
        };
        match denial {
            None => true,
            Some((policy_id, policy_name, severity, breach)) => {
                warn!(
                    target: "eva::policy",
                    policy = %policy_name,
                    kind = %kind,
                    rule = %breach.rule,
                    "lease denied by policy"
                );
                self.record(PolicyViolation {
                    timestamp: Utc::now(),
                    policy_id,
                    policy_name,
                    resource_kind: Some(kind),
                    rule: Some(breach.rule),
                    severity,
                    description: breach.reason,
                });
                false
            }
        }
    }

    /// Candidate experiments for these insights that pass the safety screen,
    /// in generation order.
    pub fn filter_experiments(&self, insights: &Insights) -> Vec<Experiment> {
        experiments::candidates(insights)
            .into_iter()
            .filter(|exp| {
                let safe = experiments::is_safe(exp, &self.cfg.disallowed_experiment_kinds);
                if !safe {
                    info!(
                        target: "eva::policy",
                        experiment = %exp.id,
                        kind = %exp.kind,
                        risk = exp.risk_level.as_str(),
                        "experiment filtered by policy"
                    );
                }
                safe
            })
            .collect()
    }

    /// Record a violation detected outside the engine.
    pub fn report_violation(
        &self,
        policy_id: impl Into<String>,
        kind: Option<ResourceKind>,
        severity: PolicyLevel,
        description: impl Into<String>,
    ) {
        let policy_id = policy_id.into();
        let policy_name = self
            .policies
            .read()
            .iter()
            .find(|p| p.id == policy_id)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| policy_id.clone());
        self.record(PolicyViolation {
            timestamp: Utc::now(),
            policy_id,
            policy_name,
            resource_kind: kind,
            rule: None,
            severity,
            description: description.into(),
        });
    }

    fn record(&self, violation: PolicyViolation) {
        match violation.severity {
            PolicyLevel::Critical => {
                error!(target: "eva::policy", policy = %violation.policy_id, "critical policy violation: {}", violation.description)
            }
            PolicyLevel::High | PolicyLevel::Medium => {
                warn!(target: "eva::policy", policy = %violation.policy_id, severity = violation.severity.as_str(), "policy violation: {}", violation.description)
            }
            PolicyLevel::Low => {
                info!(target: "eva::policy", policy = %violation.policy_id, "low severity policy violation: {}", violation.description)
            }
        }
        self.violations.lock().push(violation);
    }

    pub fn violations(&self) -> Vec<PolicyViolation> {
        self.violations.lock().clone()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.lock().len()
    }

    pub fn critical_violation_count(&self) -> usize {
        self.violations
            .lock()
            .iter()
            .filter(|v| v.severity == PolicyLevel::Critical)
            .count()
    }

    pub fn policies(&self) -> Vec<Policy> {
        self.policies.read().clone()
    }

    pub fn policy(&self, id: &str) -> Option<Policy> {
        self.policies.read().iter().find(|p| p.id == id).cloned()
    }

    /// Mark a policy inactive. Returns false for unknown ids.
    pub fn deactivate(&self, id: &str) -> bool {
        let mut policies = self.policies.write();
        match policies.iter_mut().find(|p| p.id == id) {
            Some(policy) => {
                policy.active = false;
                info!(target: "eva::policy", policy = %id, "policy deactivated");
                true
            }
            None => false,
        }
    }

    /// Keep only critical policies active and force enforcement on.
    pub fn emergency_lockdown(&self) {
        error!(target: "eva::policy", "emergency policy lockdown activated");
        for policy in self.policies.write().iter_mut() {
            if policy.level != PolicyLevel::Critical {
                policy.active = false;
            }
        }
        self.enforcement_active.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> PolicyStatus {
        let policies = self.policies.read();
        PolicyStatus {
            total_policies: policies.len(),
            active_policies: policies.iter().filter(|p| p.active).count(),
            violations: self.violation_count(),
            critical_violations: self.critical_violation_count(),
            enforcement_active: self.enforcement_active(),
        }
    }

    /// Deactivate enforcement; authorisation fails open afterwards.
    pub fn shutdown(&self) {
        info!(target: "eva::policy", "shutting down policy engine");
        self.enforcement_active.store(false, Ordering::SeqCst);
    }
}
