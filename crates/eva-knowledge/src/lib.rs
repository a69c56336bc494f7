//! Knowledge fusion graph: perception snapshots become nodes, similar nodes
//! are linked by undirected edges, and the graph is summarised into insights
//! and growth metrics.
//!
//! The graph lives behind a single write lock. Fusion passes and external
//! writers ([`KnowledgeFusionEngine::add_knowledge`],
//! [`KnowledgeFusionEngine::connect`]) serialise on it, so a connection pass
//! always sees a stable node set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use eva_protocol::{GrowthMetrics, Insights, MemoryUpdateSummary, PerceptionSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

mod insights;
mod node;
mod pairing;
mod params;

pub use insights::{RECOMMEND_DEEPER_PATTERNS, RECOMMEND_MORE_SOURCES};
pub use node::{KnowledgeNode, NodeId};
pub use pairing::{similarity, BASELINE_SCORE, SAME_SOURCE_SCORE, SAME_TYPE_SCORE};
pub use params::{FusionParams, PairingMode};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum KnowledgeError {
    #[error("confidence {0} is outside [0, 1]")]
    InvalidConfidence(f64),
    #[error("unknown knowledge node: {0}")]
    UnknownNode(String),
    #[error("node {0} cannot connect to itself")]
    SelfConnection(String),
    #[error("node {0} has reached its connection limit")]
    Saturated(String),
    #[error("invalid fusion parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeStatus {
    pub ready: bool,
    pub total_nodes: usize,
    pub total_connections: usize,
    pub fusion_operations: u64,
    pub params: FusionParams,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: BTreeMap<NodeId, KnowledgeNode>,
    fusion_operations: u64,
}

impl Graph {
    fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.connections.len()).sum::<usize>() / 2
    }
}

#[derive(Debug)]
pub struct KnowledgeFusionEngine {
    params: FusionParams,
    graph: RwLock<Graph>,
    ready: AtomicBool,
}

impl Default for KnowledgeFusionEngine {
    fn default() -> Self {
        Self::new(FusionParams::default())
    }
}

impl KnowledgeFusionEngine {
    pub fn new(params: FusionParams) -> Self {
        Self {
            params,
            graph: RwLock::new(Graph::default()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    /// Validate parameters and seed the foundational nodes. Seeding is
    /// skipped for ids already present, so repeated calls are harmless.
    pub fn initialize(&self) -> Result<usize, KnowledgeError> {
        self.params.validate().map_err(KnowledgeError::InvalidParams)?;
        let mut graph = self.graph.write();
        for seed in node::seed_nodes() {
            graph.nodes.entry(seed.id.clone()).or_insert(seed);
        }
        let count = graph.nodes.len();
        drop(graph);
        self.ready.store(true, Ordering::SeqCst);
        info!(
            target: "eva::knowledge",
            nodes = count,
            pairing = self.params.pairing.as_str(),
            "knowledge fusion engine initialized"
        );
        Ok(count)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.graph.read().nodes.is_empty()
    }

    /// Fuse one snapshot: a node per input category, then one connection pass.
    pub fn process_perception(&self, snapshot: &PerceptionSnapshot) -> MemoryUpdateSummary {
        let mut graph = self.graph.write();
        let mut created = BTreeSet::new();
        for (category, value) in &snapshot.inputs {
            let profile = node::CategoryProfile::for_category(category, self.params.floor_confidence);
            let id = format!("{category}-{}", uuid::Uuid::new_v4());
            let node = KnowledgeNode::new(
                id.clone(),
                profile.content_type,
                value.clone(),
                profile.confidence,
                profile.source,
            );
            graph.nodes.insert(id.clone(), node);
            created.insert(id);
        }
        let outcome = pairing::connect_similar(&mut graph.nodes, &self.params);
        graph.fusion_operations += 1;
        let summary = MemoryUpdateSummary {
            new_nodes: created.len(),
            updated_nodes: outcome.touched.difference(&created).count(),
            new_connections: outcome.new_connections,
        };
        debug!(
            target: "eva::knowledge",
            new_nodes = summary.new_nodes,
            updated_nodes = summary.updated_nodes,
            new_connections = summary.new_connections,
            total_nodes = graph.nodes.len(),
            "perception fused"
        );
        summary
    }

    pub fn generate_insights(
        &self,
        snapshot: &PerceptionSnapshot,
        summary: &MemoryUpdateSummary,
    ) -> Insights {
        let graph = self.graph.read();
        let insights = insights::derive(&graph.nodes, graph.fusion_operations, snapshot, &self.params);
        debug!(
            target: "eva::knowledge",
            fused_nodes = summary.new_nodes,
            patterns = insights.patterns.len(),
            anomalies = insights.anomalies.len(),
            optimizations = insights.optimizations.len(),
            recommendations = insights.recommendations.len(),
            "insights generated"
        );
        insights
    }

    pub fn growth_metrics(&self) -> GrowthMetrics {
        let graph = self.graph.read();
        let total_nodes = graph.nodes.len();
        let average_confidence = if total_nodes == 0 {
            0.0
        } else {
            graph.nodes.values().map(|n| n.confidence).sum::<f64>() / total_nodes as f64
        };
        GrowthMetrics {
            total_nodes,
            total_connections: graph.edge_count(),
            fusion_operations: graph.fusion_operations,
            average_confidence,
        }
    }

    /// Insert a node without running a connection pass.
    pub fn add_knowledge(
        &self,
        category: &str,
        content: Value,
        source: &str,
        confidence: f64,
    ) -> Result<NodeId, KnowledgeError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(KnowledgeError::InvalidConfidence(confidence));
        }
        let id = format!("{category}-{}", uuid::Uuid::new_v4());
        let node = KnowledgeNode::new(id.clone(), category, content, confidence, source);
        self.graph.write().nodes.insert(id.clone(), node);
        debug!(target: "eva::knowledge", node = %id, "knowledge added");
        Ok(id)
    }

    /// Clone of a node; counts as an access.
    pub fn get_node(&self, id: &str) -> Option<KnowledgeNode> {
        let mut graph = self.graph.write();
        let node = graph.nodes.get_mut(id)?;
        node.access_count += 1;
        Some(node.clone())
    }

    pub fn nodes_by_type(&self, content_type: &str) -> Vec<KnowledgeNode> {
        let mut graph = self.graph.write();
        graph
            .nodes
            .values_mut()
            .filter(|n| n.content_type == content_type)
            .map(|n| {
                n.access_count += 1;
                n.clone()
            })
            .collect()
    }

    /// Link two nodes explicitly. `Ok(false)` when they were already linked.
    pub fn connect(&self, a: &str, b: &str) -> Result<bool, KnowledgeError> {
        if a == b {
            return Err(KnowledgeError::SelfConnection(a.to_string()));
        }
        let mut graph = self.graph.write();
        for id in [a, b] {
            if !graph.nodes.contains_key(id) {
                return Err(KnowledgeError::UnknownNode(id.to_string()));
            }
        }
        if graph.nodes.get(a).is_some_and(|n| n.is_connected_to(b)) {
            return Ok(false);
        }
        for id in [a, b] {
            if pairing::saturated(&graph.nodes, id, &self.params) {
                return Err(KnowledgeError::Saturated(id.to_string()));
            }
        }
        Ok(pairing::link(&mut graph.nodes, a, b))
    }

    pub fn node_count(&self) -> usize {
        self.graph.read().nodes.len()
    }

    pub fn status(&self) -> KnowledgeStatus {
        let graph = self.graph.read();
        KnowledgeStatus {
            ready: self.ready.load(Ordering::SeqCst) && !graph.nodes.is_empty(),
            total_nodes: graph.nodes.len(),
            total_connections: graph.edge_count(),
            fusion_operations: graph.fusion_operations,
            params: self.params.clone(),
        }
    }
}
