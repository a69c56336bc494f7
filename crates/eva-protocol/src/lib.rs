//! Shared data model passed between the policy engine, the lease manager,
//! the knowledge fusion engine and the cycle orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque permission attributes attached to a lease request.
pub type Attributes = Map<String, Value>;

pub const CATEGORY_SYSTEM_METRICS: &str = "system_metrics";
pub const CATEGORY_USER_INTERACTIONS: &str = "user_interactions";
pub const CATEGORY_ENVIRONMENTAL: &str = "environmental_data";

// -------- Resources / governance --------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Compute,
    NetworkAccess,
    FileSystem,
    DeviceControl,
    Learning,
    Experimentation,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Compute,
        ResourceKind::NetworkAccess,
        ResourceKind::FileSystem,
        ResourceKind::DeviceControl,
        ResourceKind::Learning,
        ResourceKind::Experimentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Compute => "compute",
            ResourceKind::NetworkAccess => "network_access",
            ResourceKind::FileSystem => "file_system",
            ResourceKind::DeviceControl => "device_control",
            ResourceKind::Learning => "learning",
            ResourceKind::Experimentation => "experimentation",
        }
    }

    /// Parse a slug; dashes and a few legacy spellings are accepted.
    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "compute" | "computation" => Some(ResourceKind::Compute),
            "network_access" | "network" | "net" => Some(ResourceKind::NetworkAccess),
            "file_system" | "filesystem" | "fs" => Some(ResourceKind::FileSystem),
            "device_control" | "device" => Some(ResourceKind::DeviceControl),
            "learning" => Some(ResourceKind::Learning),
            "experimentation" | "experiment" => Some(ResourceKind::Experimentation),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl PolicyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyLevel::Critical => "critical",
            PolicyLevel::High => "high",
            PolicyLevel::Medium => "medium",
            PolicyLevel::Low => "low",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(PolicyLevel::Critical),
            "high" => Some(PolicyLevel::High),
            "medium" | "moderate" => Some(PolicyLevel::Medium),
            "low" => Some(PolicyLevel::Low),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------- Experiments --------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentKind {
    PatternRecognition,
    Optimization,
    PatternReinforcement,
    SystemModification,
    ExternalCommunication,
}

impl ExperimentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentKind::PatternRecognition => "pattern_recognition",
            ExperimentKind::Optimization => "optimization",
            ExperimentKind::PatternReinforcement => "pattern_reinforcement",
            ExperimentKind::SystemModification => "system_modification",
            ExperimentKind::ExternalCommunication => "external_communication",
        }
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate behaviour change proposed from the current insights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub kind: ExperimentKind,
    pub description: String,
    pub risk_level: RiskLevel,
    /// Resource kind a lease must cover before the experiment may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_resource: Option<ResourceKind>,
}

// -------- Perception / fusion --------

/// One perception pass: named input categories mapped to structured values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerceptionSnapshot {
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

impl PerceptionSnapshot {
    pub fn new() -> Self {
        Self {
            captured_at: Utc::now(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, category: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(category.into(), value);
        self
    }

    pub fn insert(&mut self, category: impl Into<String>, value: Value) {
        self.inputs.insert(category.into(), value);
    }

    pub fn get(&self, category: &str) -> Option<&Value> {
        self.inputs.get(category)
    }

    /// Numeric field inside a category, e.g. `metric("system_metrics", "cpu_usage")`.
    pub fn metric(&self, category: &str, key: &str) -> Option<f64> {
        self.inputs
            .get(category)
            .and_then(|v| v.get(key))
            .and_then(|v| v.as_f64())
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl Default for PerceptionSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUpdateSummary {
    pub new_nodes: usize,
    /// Pre-existing nodes that gained at least one connection in this pass.
    pub updated_nodes: usize,
    pub new_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub kind: String,
    pub subject: String,
    pub description: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub kind: String,
    pub description: String,
    pub observed: f64,
    pub threshold: f64,
    pub severity: RiskLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub kind: String,
    pub description: String,
    pub potential_benefit: String,
}

/// Derived learning output of one cycle; each list is computed independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    #[serde(default)]
    pub patterns: Vec<PatternRecord>,
    #[serde(default)]
    pub anomalies: Vec<AnomalyRecord>,
    #[serde(default)]
    pub optimizations: Vec<OptimizationRecord>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Insights {
    pub fn total(&self) -> usize {
        self.patterns.len()
            + self.anomalies.len()
            + self.optimizations.len()
            + self.recommendations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GrowthMetrics {
    pub total_nodes: usize,
    /// Undirected edges; each connected pair counts once.
    pub total_connections: usize,
    pub fusion_operations: u64,
    pub average_confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resource_kind_slugs_round_trip_and_accept_aliases() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_slug(kind.as_str()), Some(kind));
        }
        assert_eq!(
            ResourceKind::from_slug("Computation"),
            Some(ResourceKind::Compute)
        );
        assert_eq!(
            ResourceKind::from_slug("network-access"),
            Some(ResourceKind::NetworkAccess)
        );
        assert_eq!(ResourceKind::from_slug("teleport"), None);
    }

    #[test]
    fn resource_kind_serializes_snake_case() {
        let v = serde_json::to_value(ResourceKind::DeviceControl).unwrap();
        assert_eq!(v, json!("device_control"));
    }

    #[test]
    fn snapshot_metric_reads_nested_numbers() {
        let snap = PerceptionSnapshot::new()
            .with_input(CATEGORY_SYSTEM_METRICS, json!({"cpu_usage": 95, "label": "x"}));
        assert_eq!(snap.metric(CATEGORY_SYSTEM_METRICS, "cpu_usage"), Some(95.0));
        assert_eq!(snap.metric(CATEGORY_SYSTEM_METRICS, "label"), None);
        assert_eq!(snap.metric(CATEGORY_ENVIRONMENTAL, "cpu_usage"), None);
    }

    #[test]
    fn insights_total_counts_every_list() {
        let mut insights = Insights::default();
        assert!(insights.is_empty());
        insights.recommendations.push("expand sources".into());
        insights.patterns.push(PatternRecord {
            kind: "frequent_data_type".into(),
            subject: "system_metrics".into(),
            description: "Most common data type: system_metrics".into(),
            confidence: 0.8,
        });
        assert_eq!(insights.total(), 2);
    }
}
