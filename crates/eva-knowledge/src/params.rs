use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How connection generation enumerates candidate pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PairingMode {
    /// Every unordered pair in the graph, every pass.
    #[default]
    FullScan,
    /// Only pairs sharing a source or a content type.
    Indexed,
}

impl PairingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingMode::FullScan => "full_scan",
            PairingMode::Indexed => "indexed",
        }
    }
}

/// Tunable fusion parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct FusionParams {
    pub confidence_threshold: f64,
    pub max_connections_per_node: usize,
    /// Pairs connect when their similarity is strictly above this value.
    pub similarity_threshold: f64,
    /// Reported only; nodes do not decay.
    pub decay_rate: f64,
    /// Reported only.
    pub reinforcement_factor: f64,
    pub cpu_anomaly_threshold: f64,
    pub node_ceiling: usize,
    pub fusion_ops_threshold: u64,
    pub small_graph_threshold: usize,
    /// Confidence for perception categories without a dedicated profile.
    pub floor_confidence: f64,
    pub pairing: PairingMode,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_connections_per_node: 10,
            similarity_threshold: 0.8,
            decay_rate: 0.01,
            reinforcement_factor: 1.2,
            cpu_anomaly_threshold: 90.0,
            node_ceiling: 1000,
            fusion_ops_threshold: 100,
            small_graph_threshold: 50,
            floor_confidence: 0.5,
            pairing: PairingMode::FullScan,
        }
    }
}

impl FusionParams {
    pub(crate) fn validate(&self) -> Result<(), String> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{name} must be within [0, 1], got {v}"))
            }
        };
        unit("confidence_threshold", self.confidence_threshold)?;
        unit("similarity_threshold", self.similarity_threshold)?;
        unit("decay_rate", self.decay_rate)?;
        unit("floor_confidence", self.floor_confidence)?;
        if !(self.reinforcement_factor.is_finite() && self.reinforcement_factor > 0.0) {
            return Err(format!(
                "reinforcement_factor must be positive, got {}",
                self.reinforcement_factor
            ));
        }
        Ok(())
    }
}
