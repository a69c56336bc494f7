use std::collections::BTreeMap;

use eva_protocol::{
    AnomalyRecord, Insights, OptimizationRecord, PatternRecord, PerceptionSnapshot, RiskLevel,
    CATEGORY_SYSTEM_METRICS,
};

use crate::node::{KnowledgeNode, NodeId};
use crate::params::FusionParams;

pub const RECOMMEND_DEEPER_PATTERNS: &str = "Increase pattern recognition depth";
pub const RECOMMEND_MORE_SOURCES: &str = "Expand knowledge base through more diverse data sources";

const PATTERN_CONFIDENCE: f64 = 0.8;

pub(crate) fn derive(
    nodes: &BTreeMap<NodeId, KnowledgeNode>,
    fusion_operations: u64,
    snapshot: &PerceptionSnapshot,
    params: &FusionParams,
) -> Insights {
    Insights {
        patterns: frequent_type(nodes).into_iter().collect(),
        anomalies: cpu_anomaly(snapshot, params).into_iter().collect(),
        optimizations: pruning(nodes.len(), params).into_iter().collect(),
        recommendations: recommendations(nodes.len(), fusion_operations, params),
    }
}

/// Most frequent content type; ties go to the lexically smallest tag.
fn frequent_type(nodes: &BTreeMap<NodeId, KnowledgeNode>) -> Option<PatternRecord> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for node in nodes.values() {
        *counts.entry(node.content_type.as_str()).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (tag, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((tag, count));
        }
    }
    best.map(|(tag, _)| PatternRecord {
        kind: "frequent_data_type".into(),
        subject: tag.to_string(),
        description: format!("Most common data type: {tag}"),
        confidence: PATTERN_CONFIDENCE,
    })
}

fn cpu_anomaly(snapshot: &PerceptionSnapshot, params: &FusionParams) -> Option<AnomalyRecord> {
    let cpu = snapshot.metric(CATEGORY_SYSTEM_METRICS, "cpu_usage")?;
    (cpu > params.cpu_anomaly_threshold).then(|| AnomalyRecord {
        kind: "high_cpu_usage".into(),
        description: format!("CPU usage at {cpu}%"),
        observed: cpu,
        threshold: params.cpu_anomaly_threshold,
        severity: RiskLevel::Medium,
    })
}

fn pruning(node_count: usize, params: &FusionParams) -> Option<OptimizationRecord> {
    (node_count > params.node_ceiling).then(|| OptimizationRecord {
        kind: "knowledge_pruning".into(),
        description: "Consider pruning old knowledge nodes".into(),
        potential_benefit: "Improved query performance".into(),
    })
}

fn recommendations(node_count: usize, fusion_operations: u64, params: &FusionParams) -> Vec<String> {
    let mut out = Vec::new();
    if fusion_operations > params.fusion_ops_threshold {
        out.push(RECOMMEND_DEEPER_PATTERNS.to_string());
    }
    if node_count < params.small_graph_threshold {
        out.push(RECOMMEND_MORE_SOURCES.to_string());
    }
    out
}
