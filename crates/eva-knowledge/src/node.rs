use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use eva_protocol::{CATEGORY_ENVIRONMENTAL, CATEGORY_SYSTEM_METRICS, CATEGORY_USER_INTERACTIONS};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub type NodeId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: NodeId,
    pub content_type: String,
    pub content: Value,
    pub confidence: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
    /// Undirected edges; never contains `id`.
    pub connections: BTreeSet<NodeId>,
}

impl KnowledgeNode {
    pub fn new(
        id: impl Into<NodeId>,
        content_type: impl Into<String>,
        content: Value,
        confidence: f64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content_type: content_type.into(),
            content,
            confidence,
            source: source.into(),
            created_at: Utc::now(),
            access_count: 0,
            connections: BTreeSet::new(),
        }
    }

    pub fn is_connected_to(&self, other: &str) -> bool {
        self.connections.contains(other)
    }
}

pub(crate) const SEED_CONTENT_TYPE: &str = "foundation";

pub(crate) fn seed_nodes() -> Vec<KnowledgeNode> {
    vec![
        KnowledgeNode::new(
            "safety_001",
            SEED_CONTENT_TYPE,
            json!({"concept": "human_safety", "priority": "critical"}),
            1.0,
            "core_policy",
        ),
        KnowledgeNode::new(
            "learning_001",
            SEED_CONTENT_TYPE,
            json!({"concept": "continuous_learning", "method": "reinforcement"}),
            0.9,
            "core_design",
        ),
        KnowledgeNode::new(
            "communication_001",
            SEED_CONTENT_TYPE,
            json!({"concept": "human_interaction", "channels": ["voice", "text"]}),
            0.8,
            "interface_spec",
        ),
    ]
}

/// Content type, source label and default confidence for nodes fused from
/// a perception category.
pub(crate) struct CategoryProfile {
    pub content_type: String,
    pub source: String,
    pub confidence: f64,
}

impl CategoryProfile {
    pub(crate) fn for_category(category: &str, floor: f64) -> Self {
        let (content_type, source, confidence) = match category {
            CATEGORY_SYSTEM_METRICS => ("system_metrics", "system_monitor", 0.8),
            CATEGORY_USER_INTERACTIONS => ("user_interaction", "user_interface", 0.7),
            CATEGORY_ENVIRONMENTAL => ("environment", "environment_sensor", 0.6),
            other => (other, other, floor),
        };
        Self {
            content_type: content_type.to_string(),
            source: source.to_string(),
            confidence,
        }
    }
}
