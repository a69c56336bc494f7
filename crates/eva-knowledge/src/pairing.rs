//! Connection generation over the node graph.
//!
//! The full scan is quadratic in node count on every pass. The indexed mode
//! only visits pairs that share a source or a content type, which are the
//! only pairs scoring above the cross-type baseline. Pairs are walked in
//! place in ascending `(a, b)` id order in both modes, so saturation
//! decisions, and therefore the resulting edge sets, are identical. Nothing
//! proportional to the number of pairs is ever held in memory.

use std::collections::{BTreeMap, BTreeSet};

use crate::node::{KnowledgeNode, NodeId};
use crate::params::{FusionParams, PairingMode};

pub const SAME_SOURCE_SCORE: f64 = 0.9;
pub const SAME_TYPE_SCORE: f64 = 0.8;
pub const BASELINE_SCORE: f64 = 0.3;

pub fn similarity(a: &KnowledgeNode, b: &KnowledgeNode) -> f64 {
    if a.source == b.source {
        SAME_SOURCE_SCORE
    } else if a.content_type == b.content_type {
        SAME_TYPE_SCORE
    } else {
        BASELINE_SCORE
    }
}

#[derive(Debug, Default)]
pub(crate) struct PairingOutcome {
    pub new_connections: usize,
    pub touched: BTreeSet<NodeId>,
}

pub(crate) fn connect_similar(
    nodes: &mut BTreeMap<NodeId, KnowledgeNode>,
    params: &FusionParams,
) -> PairingOutcome {
    let ids: Vec<NodeId> = nodes.keys().cloned().collect();
    let mut outcome = PairingOutcome::default();
    match params.pairing {
        PairingMode::Indexed if params.similarity_threshold >= BASELINE_SCORE => {
            let index = SharedIndex::build(nodes);
            let mut partners = Vec::new();
            for (i, a) in ids.iter().enumerate() {
                index.partners_after(i, &mut partners);
                for &j in &partners {
                    if saturated(nodes, a, params) {
                        break;
                    }
                    try_link(nodes, a, &ids[j], params, &mut outcome);
                }
            }
        }
        _ => {
            for (i, a) in ids.iter().enumerate() {
                for b in &ids[i + 1..] {
                    if saturated(nodes, a, params) {
                        break;
                    }
                    try_link(nodes, a, b, params, &mut outcome);
                }
            }
        }
    }
    outcome
}

fn try_link(
    nodes: &mut BTreeMap<NodeId, KnowledgeNode>,
    a: &NodeId,
    b: &NodeId,
    params: &FusionParams,
    outcome: &mut PairingOutcome,
) {
    let Some(score) = pair_score(nodes, a, b) else {
        return;
    };
    if score <= params.similarity_threshold || saturated(nodes, b, params) {
        return;
    }
    link(nodes, a, b);
    outcome.new_connections += 1;
    outcome.touched.insert(a.clone());
    outcome.touched.insert(b.clone());
}

/// Write both adjacency entries. Returns false when already linked.
pub(crate) fn link(nodes: &mut BTreeMap<NodeId, KnowledgeNode>, a: &str, b: &str) -> bool {
    let inserted = nodes
        .get_mut(a)
        .map(|n| n.connections.insert(b.to_string()))
        .unwrap_or(false);
    if let Some(n) = nodes.get_mut(b) {
        n.connections.insert(a.to_string());
    }
    inserted
}

pub(crate) fn saturated(
    nodes: &BTreeMap<NodeId, KnowledgeNode>,
    id: &str,
    params: &FusionParams,
) -> bool {
    nodes
        .get(id)
        .is_some_and(|n| n.connections.len() >= params.max_connections_per_node)
}

fn pair_score(nodes: &BTreeMap<NodeId, KnowledgeNode>, a: &str, b: &str) -> Option<f64> {
    let left = nodes.get(a)?;
    let right = nodes.get(b)?;
    if left.is_connected_to(b) {
        return None;
    }
    Some(similarity(left, right))
}

/// Node positions (in key order) grouped by source and by content type.
struct SharedIndex {
    source_of: Vec<usize>,
    type_of: Vec<usize>,
    sources: Vec<Vec<usize>>,
    types: Vec<Vec<usize>>,
}

impl SharedIndex {
    fn build(nodes: &BTreeMap<NodeId, KnowledgeNode>) -> Self {
        let mut source_slots: BTreeMap<&str, usize> = BTreeMap::new();
        let mut type_slots: BTreeMap<&str, usize> = BTreeMap::new();
        let mut index = SharedIndex {
            source_of: Vec::with_capacity(nodes.len()),
            type_of: Vec::with_capacity(nodes.len()),
            sources: Vec::new(),
            types: Vec::new(),
        };
        for (pos, node) in nodes.values().enumerate() {
            let slot = *source_slots.entry(node.source.as_str()).or_insert_with(|| {
                index.sources.push(Vec::new());
                index.sources.len() - 1
            });
            index.sources[slot].push(pos);
            index.source_of.push(slot);

            let slot = *type_slots.entry(node.content_type.as_str()).or_insert_with(|| {
                index.types.push(Vec::new());
                index.types.len() - 1
            });
            index.types[slot].push(pos);
            index.type_of.push(slot);
        }
        index
    }

    /// Ascending positions after `pos` that share a source or a content type
    /// with it, written into `out`.
    fn partners_after(&self, pos: usize, out: &mut Vec<usize>) {
        out.clear();
        let by_source = tail_after(&self.sources[self.source_of[pos]], pos);
        let by_type = tail_after(&self.types[self.type_of[pos]], pos);
        let (mut i, mut j) = (0, 0);
        while i < by_source.len() || j < by_type.len() {
            let next = match (by_source.get(i), by_type.get(j)) {
                (Some(&x), Some(&y)) if x == y => {
                    i += 1;
                    j += 1;
                    x
                }
                (Some(&x), Some(&y)) if x < y => {
                    i += 1;
                    x
                }
                (Some(_), Some(&y)) => {
                    j += 1;
                    y
                }
                (Some(&x), None) => {
                    i += 1;
                    x
                }
                (None, Some(&y)) => {
                    j += 1;
                    y
                }
                (None, None) => break,
            };
            out.push(next);
        }
    }
}

fn tail_after(bucket: &[usize], pos: usize) -> &[usize] {
    &bucket[bucket.partition_point(|&j| j <= pos)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, kind: &str, source: &str) -> KnowledgeNode {
        KnowledgeNode::new(id, kind, json!({}), 0.5, source)
    }

    fn graph() -> BTreeMap<NodeId, KnowledgeNode> {
        let specs = [
            ("a1", "metrics", "monitor"),
            ("a2", "metrics", "monitor"),
            ("a3", "metrics", "probe"),
            ("b1", "chat", "ui"),
            ("b2", "chat", "ui"),
            ("b3", "env", "ui"),
            ("c1", "env", "sensor"),
            ("c2", "env", "sensor"),
            ("c3", "env", "sensor"),
            ("c4", "env", "sensor"),
        ];
        specs
            .iter()
            .map(|(id, kind, source)| (id.to_string(), node(id, kind, source)))
            .collect()
    }

    fn edges(nodes: &BTreeMap<NodeId, KnowledgeNode>) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (id, n) in nodes {
            for other in &n.connections {
                if id < other {
                    out.push((id.clone(), other.clone()));
                }
            }
        }
        out
    }

    #[test]
    fn similarity_prefers_source_then_type() {
        assert_eq!(similarity(&node("x", "t", "s"), &node("y", "u", "s")), SAME_SOURCE_SCORE);
        assert_eq!(similarity(&node("x", "t", "s"), &node("y", "t", "r")), SAME_TYPE_SCORE);
        assert_eq!(similarity(&node("x", "t", "s"), &node("y", "u", "r")), BASELINE_SCORE);
    }

    #[test]
    fn only_same_source_pairs_clear_the_default_threshold() {
        let mut nodes = graph();
        let outcome = connect_similar(&mut nodes, &FusionParams::default());
        // monitor: 1 pair, ui: 3 pairs, sensor: 6 pairs
        assert_eq!(outcome.new_connections, 10);
        assert!(!nodes["a1"].is_connected_to("a3"));
        assert!(nodes["b3"].is_connected_to("b1"));
    }

    #[test]
    fn connections_are_symmetric_and_never_self() {
        let mut nodes = graph();
        let params = FusionParams {
            similarity_threshold: 0.5,
            ..Default::default()
        };
        connect_similar(&mut nodes, &params);
        for (id, n) in &nodes {
            assert!(!n.connections.contains(id));
            for other in &n.connections {
                assert!(nodes[other].is_connected_to(id), "{id} -> {other} is one-sided");
            }
        }
    }

    #[test]
    fn second_pass_adds_nothing() {
        let mut nodes = graph();
        let params = FusionParams::default();
        connect_similar(&mut nodes, &params);
        let again = connect_similar(&mut nodes, &params);
        assert_eq!(again.new_connections, 0);
        assert!(again.touched.is_empty());
    }

    #[test]
    fn indexed_matches_full_scan() {
        for threshold in [0.1, 0.5, 0.8, 0.85] {
            for max in [1, 2, 10] {
                let full = FusionParams {
                    similarity_threshold: threshold,
                    max_connections_per_node: max,
                    pairing: PairingMode::FullScan,
                    ..Default::default()
                };
                let indexed = FusionParams {
                    pairing: PairingMode::Indexed,
                    ..full.clone()
                };
                let mut left = graph();
                let mut right = graph();
                let a = connect_similar(&mut left, &full);
                let b = connect_similar(&mut right, &indexed);
                assert_eq!(a.new_connections, b.new_connections);
                assert_eq!(edges(&left), edges(&right), "threshold {threshold} max {max}");
            }
        }
    }

    #[test]
    fn large_single_source_graph_stays_bounded() {
        let mut nodes: BTreeMap<NodeId, KnowledgeNode> = (0..2000)
            .map(|i| {
                let id = format!("n{i:05}");
                (id.clone(), node(&id, "metrics", "monitor"))
            })
            .collect();
        for pairing in [PairingMode::FullScan, PairingMode::Indexed] {
            let params = FusionParams {
                pairing,
                ..Default::default()
            };
            let mut graph = nodes.clone();
            let outcome = connect_similar(&mut graph, &params);
            let degree_sum: usize = graph.values().map(|n| n.connections.len()).sum();
            assert_eq!(outcome.new_connections * 2, degree_sum);
            assert!(graph.values().all(|n| n.connections.len() <= 10));
            assert_eq!(graph["n00000"].connections.len(), 10);
        }
        connect_similar(&mut nodes, &FusionParams::default());
        assert!(nodes.values().all(|n| n.connections.len() <= 10));
    }

    #[test]
    fn saturated_nodes_take_no_more_edges() {
        let mut nodes = graph();
        let params = FusionParams {
            max_connections_per_node: 2,
            ..Default::default()
        };
        connect_similar(&mut nodes, &params);
        assert!(nodes.values().all(|n| n.connections.len() <= 2));
        assert_eq!(nodes["c1"].connections.len(), 2);
    }
}
