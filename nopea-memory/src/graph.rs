//! In-memory knowledge graph: content-addressed nodes, directed weighted
//! relationships, EWMA reinforcement and time decay.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

type Blake2b128 = Blake2b<U16>;

/// EWMA smoothing factor for relevance and weight updates.
const EWMA_ALPHA: f64 = 0.3;

/// Relationships below this weight are dropped during decay.
const RELATIONSHIP_PRUNE_WEIGHT: f64 = 0.05;

/// Nodes below this relevance with no incident relationship are dropped
/// during decay.
const NODE_PRUNE_RELEVANCE: f64 = 0.01;

/// Node category. Error names are canonicalized to lowercase; concept names
/// are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Concept,
    Error,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Concept => "concept",
            NodeKind::Error => "error",
        }
    }
}

/// Typed directed relationship between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Breaks,
    DeployedTo,
    DependsOn,
}

impl Relation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Breaks => "breaks",
            Relation::DeployedTo => "deployed_to",
            Relation::DependsOn => "depends_on",
        }
    }
}

/// Edge direction for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A content-addressed graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// 16-byte BLAKE2b digest of `(kind, canonical_name)`, hex-encoded.
    pub id: String,
    pub kind: NodeKind,
    pub name: String,
    /// EWMA relevance in [0, 1].
    pub relevance: f64,
    pub observations: u64,
    /// Identifier marker of the first ingestion that mentioned this node.
    pub first_seen: String,
    pub last_seen: String,
}

/// A directed, typed, weighted edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub relation: Relation,
    pub target_id: String,
    /// EWMA weight in [0, 1].
    pub weight: f64,
    pub observations: u64,
    pub first_seen: String,
    pub last_seen: String,
    /// Short evidence strings, appended on every reinforcement.
    pub evidence: Vec<String>,
}

type RelationshipKey = (String, Relation, String);

/// The whole graph: node-id → node, relationship-key → relationship.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    nodes: HashMap<String, GraphNode>,
    relationships: HashMap<RelationshipKey, Relationship>,
}

/// Canonical name for a node: error names collapse case, concept names are
/// kept verbatim.
fn canonical_name(kind: NodeKind, name: &str) -> String {
    match kind {
        NodeKind::Error => name.to_lowercase(),
        NodeKind::Concept => name.to_string(),
    }
}

/// Deterministic node identity from `(kind, canonical_name)`.
pub fn node_id(kind: NodeKind, name: &str) -> String {
    let canonical = canonical_name(kind, name);
    let mut hasher = Blake2b128::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn ewma(old: f64, confidence: f64) -> f64 {
    (EWMA_ALPHA * confidence + (1.0 - EWMA_ALPHA) * old).clamp(0.0, 1.0)
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn get_node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    /// Creates or reinforces a node. A fresh node starts at relevance 0.5
    /// with one observation; an existing node follows the EWMA recurrence
    /// and bumps `observations` and `last_seen`. Returns the node id.
    pub fn upsert_node(
        &mut self,
        kind: NodeKind,
        name: &str,
        confidence: f64,
        marker: &str,
    ) -> String {
        let id = node_id(kind, name);
        match self.nodes.get_mut(&id) {
            Some(node) => {
                node.relevance = ewma(node.relevance, confidence);
                node.observations += 1;
                node.last_seen = marker.to_string();
            }
            None => {
                self.nodes.insert(
                    id.clone(),
                    GraphNode {
                        id: id.clone(),
                        kind,
                        name: canonical_name(kind, name),
                        relevance: 0.5,
                        observations: 1,
                        first_seen: marker.to_string(),
                        last_seen: marker.to_string(),
                    },
                );
            }
        }
        id
    }

    /// Creates or reinforces a relationship. The weight starts from 0.5 and
    /// follows the EWMA recurrence on every observation, the first included.
    /// The evidence string is appended, never rewritten.
    pub fn upsert_relationship(
        &mut self,
        source_id: &str,
        relation: Relation,
        target_id: &str,
        confidence: f64,
        marker: &str,
        evidence: impl Into<String>,
    ) {
        let key = (source_id.to_string(), relation, target_id.to_string());
        match self.relationships.get_mut(&key) {
            Some(rel) => {
                rel.weight = ewma(rel.weight, confidence);
                rel.observations += 1;
                rel.last_seen = marker.to_string();
                rel.evidence.push(evidence.into());
            }
            None => {
                self.relationships.insert(
                    key,
                    Relationship {
                        source_id: source_id.to_string(),
                        relation,
                        target_id: target_id.to_string(),
                        weight: ewma(0.5, confidence),
                        observations: 1,
                        first_seen: marker.to_string(),
                        last_seen: marker.to_string(),
                        evidence: vec![evidence.into()],
                    },
                );
            }
        }
    }

    /// Multiplies every relevance and weight by `factor`, then prunes:
    /// relationships under the weight floor first, then nodes under the
    /// relevance floor that have no surviving incident relationship.
    pub fn decay_all(&mut self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        for node in self.nodes.values_mut() {
            node.relevance *= factor;
        }
        for rel in self.relationships.values_mut() {
            rel.weight *= factor;
        }

        self.relationships
            .retain(|_, rel| rel.weight >= RELATIONSHIP_PRUNE_WEIGHT);

        let incident: std::collections::HashSet<&str> = self
            .relationships
            .values()
            .flat_map(|r| [r.source_id.as_str(), r.target_id.as_str()])
            .collect();
        self.nodes
            .retain(|id, node| node.relevance >= NODE_PRUNE_RELEVANCE || incident.contains(id.as_str()));
    }

    /// Relationships incident to `id` in the given direction.
    pub fn neighbors(&self, id: &str, direction: Direction) -> Vec<&Relationship> {
        self.relationships
            .values()
            .filter(|rel| match direction {
                Direction::Outgoing => rel.source_id == id,
                Direction::Incoming => rel.target_id == id,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_kind_and_name_collapse_to_one_node() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Error, "OOMKilled", 0.8, "m1");
        let b = g.upsert_node(NodeKind::Error, "oomkilled", 0.8, "m2");
        assert_eq!(a, b);
        assert_eq!(g.node_count(), 1);
        assert_eq!(g.get_node(&a).unwrap().observations, 2);
        assert_eq!(g.get_node(&a).unwrap().name, "oomkilled");
    }

    #[test]
    fn concept_names_are_case_sensitive() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Concept, "Payments", 0.5, "m1");
        let b = g.upsert_node(NodeKind::Concept, "payments", 0.5, "m1");
        assert_ne!(a, b);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn relevance_follows_ewma_recurrence() {
        let mut g = KnowledgeGraph::new();
        let id = g.upsert_node(NodeKind::Concept, "svc", 0.9, "m1");
        assert!((g.get_node(&id).unwrap().relevance - 0.5).abs() < 1e-12);

        g.upsert_node(NodeKind::Concept, "svc", 0.9, "m2");
        // 0.3 * 0.9 + 0.7 * 0.5 = 0.62
        assert!((g.get_node(&id).unwrap().relevance - 0.62).abs() < 1e-12);

        g.upsert_node(NodeKind::Concept, "svc", 0.9, "m3");
        // 0.3 * 0.9 + 0.7 * 0.62 = 0.704
        assert!((g.get_node(&id).unwrap().relevance - 0.704).abs() < 1e-12);
        assert_eq!(g.get_node(&id).unwrap().observations, 3);
    }

    #[test]
    fn values_stay_in_unit_interval() {
        let mut g = KnowledgeGraph::new();
        let id = g.upsert_node(NodeKind::Concept, "svc", 5.0, "m1");
        for _ in 0..20 {
            g.upsert_node(NodeKind::Concept, "svc", 5.0, "m");
        }
        assert!(g.get_node(&id).unwrap().relevance <= 1.0);
    }

    #[test]
    fn relationship_weight_follows_ewma_from_half() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Concept, "svc", 0.9, "m1");
        let b = g.upsert_node(NodeKind::Error, "crash", 0.8, "m1");

        g.upsert_relationship(&a, Relation::Breaks, &b, 0.8, "m1", "e1");
        let rel = g.neighbors(&a, Direction::Outgoing)[0];
        // 0.3 * 0.8 + 0.7 * 0.5 = 0.59
        assert!((rel.weight - 0.59).abs() < 1e-12);

        g.upsert_relationship(&a, Relation::Breaks, &b, 0.8, "m2", "e2");
        let rel = g.neighbors(&a, Direction::Outgoing)[0];
        // 0.3 * 0.8 + 0.7 * 0.59 = 0.653
        assert!((rel.weight - 0.653).abs() < 1e-12);
        assert_eq!(rel.observations, 2);
    }

    #[test]
    fn evidence_is_append_only() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Concept, "svc", 0.9, "m1");
        let b = g.upsert_node(NodeKind::Concept, "namespace:prod", 0.5, "m1");
        g.upsert_relationship(&a, Relation::DeployedTo, &b, 0.9, "m1", "first");
        g.upsert_relationship(&a, Relation::DeployedTo, &b, 0.9, "m2", "second");
        let rel = g.neighbors(&a, Direction::Outgoing)[0];
        assert_eq!(rel.evidence, vec!["first", "second"]);
        assert_eq!(rel.observations, 2);
    }

    #[test]
    fn full_decay_empties_the_graph() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Concept, "svc", 0.9, "m1");
        let b = g.upsert_node(NodeKind::Error, "crash", 0.8, "m1");
        g.upsert_relationship(&a, Relation::Breaks, &b, 0.8, "m1", "e");
        g.decay_all(0.0);
        assert_eq!(g.node_count(), 0);
        assert_eq!(g.relationship_count(), 0);
    }

    #[test]
    fn incident_edge_keeps_a_faded_node_alive() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Concept, "svc", 0.0, "m1");
        let b = g.upsert_node(NodeKind::Error, "crash", 0.0, "m1");
        // Drive node relevance toward zero while keeping the edge strong.
        for _ in 0..16 {
            g.upsert_node(NodeKind::Concept, "svc", 0.0, "m");
            g.upsert_node(NodeKind::Error, "crash", 0.0, "m");
            g.upsert_relationship(&a, Relation::Breaks, &b, 1.0, "m", "e");
        }
        g.decay_all(0.06);
        // Node relevance dropped below the floor but the surviving edge
        // keeps both endpoints alive.
        assert!(g.get_node(&a).unwrap().relevance < 0.01);
        assert_eq!(g.relationship_count(), 1);
        assert_eq!(g.node_count(), 2);
    }

    #[test]
    fn neighbors_filters_by_direction() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeKind::Concept, "svc", 0.9, "m1");
        let b = g.upsert_node(NodeKind::Concept, "namespace:prod", 0.5, "m1");
        g.upsert_relationship(&a, Relation::DeployedTo, &b, 0.9, "m1", "e");
        assert_eq!(g.neighbors(&a, Direction::Outgoing).len(), 1);
        assert_eq!(g.neighbors(&a, Direction::Incoming).len(), 0);
        assert_eq!(g.neighbors(&b, Direction::Incoming).len(), 1);
    }
}
