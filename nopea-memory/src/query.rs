//! Query surface over the knowledge graph: failure patterns, dependencies
//! and strategy recommendations for a service.

use crate::graph::{node_id, Direction, KnowledgeGraph, NodeKind, Relation};
use serde::{Deserialize, Serialize};

/// One observed failure mode of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePattern {
    pub error: String,
    /// Current weight of the `breaks` edge.
    pub confidence: f64,
    pub observations: u64,
    pub evidence: Vec<String>,
}

/// One observed dependency of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub target: String,
    pub weight: f64,
    pub observations: u64,
}

/// Context handed to the orchestrator before a deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployContext {
    pub service: String,
    pub namespace: String,
    /// True when the graph has seen this service before.
    pub known: bool,
    pub failure_patterns: Vec<FailurePattern>,
    pub dependencies: Vec<Dependency>,
    pub recommendations: Vec<String>,
}

impl DeployContext {
    /// Context for a service the memory has never seen (or when the memory
    /// service is absent).
    pub fn unknown(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            known: false,
            failure_patterns: Vec::new(),
            dependencies: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    /// Highest failure-pattern confidence, if any.
    pub fn max_failure_confidence(&self) -> Option<f64> {
        self.failure_patterns
            .iter()
            .map(|p| p.confidence)
            .fold(None, |acc, c| Some(acc.map_or(c, |a: f64| a.max(c))))
    }
}

/// Outgoing `breaks` edges of a service, most confident first.
pub fn failure_patterns(graph: &KnowledgeGraph, service: &str) -> Vec<FailurePattern> {
    let service_id = node_id(NodeKind::Concept, service);
    let mut patterns: Vec<FailurePattern> = graph
        .neighbors(&service_id, Direction::Outgoing)
        .into_iter()
        .filter(|rel| rel.relation == Relation::Breaks)
        .map(|rel| FailurePattern {
            error: graph
                .get_node(&rel.target_id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| rel.target_id.clone()),
            confidence: rel.weight,
            observations: rel.observations,
            evidence: rel.evidence.clone(),
        })
        .collect();
    patterns.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    patterns
}

/// Outgoing `depends_on` edges of a service.
pub fn dependencies(graph: &KnowledgeGraph, service: &str) -> Vec<Dependency> {
    let service_id = node_id(NodeKind::Concept, service);
    graph
        .neighbors(&service_id, Direction::Outgoing)
        .into_iter()
        .filter(|rel| rel.relation == Relation::DependsOn)
        .map(|rel| Dependency {
            target: graph
                .get_node(&rel.target_id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|| rel.target_id.clone()),
            weight: rel.weight,
            observations: rel.observations,
        })
        .collect()
}

/// Canary suggestions for repeat offenders: patterns over 0.7 confidence
/// observed at least twice.
pub fn recommendations(patterns: &[FailurePattern]) -> Vec<String> {
    patterns
        .iter()
        .filter(|p| p.confidence > 0.7 && p.observations >= 2)
        .map(|p| {
            format!(
                "Consider a canary rollout: '{}' has failed this service {} times (confidence {:.2})",
                p.error, p.observations, p.confidence
            )
        })
        .collect()
}

/// Full deploy context for a service/namespace pair.
pub fn build_context(graph: &KnowledgeGraph, service: &str, namespace: &str) -> DeployContext {
    let service_id = node_id(NodeKind::Concept, service);
    let known = graph.get_node(&service_id).is_some();
    let failure_patterns = failure_patterns(graph, service);
    let recommendations = recommendations(&failure_patterns);
    DeployContext {
        service: service.to_string(),
        namespace: namespace.to_string(),
        known,
        failure_patterns,
        dependencies: dependencies(graph, service),
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ingest_outcome;
    use nopea_shared::{DeployError, DeployOutcome, DeployStatus};

    fn failed_outcome() -> DeployOutcome {
        DeployOutcome {
            service: "risky".to_string(),
            namespace: "prod".to_string(),
            status: DeployStatus::Failed,
            error: Some(DeployError::WorkerCrash {
                reason: "oom".to_string(),
            }),
            concurrent_deploys: Vec::new(),
        }
    }

    #[test]
    fn unknown_service_yields_empty_context() {
        let g = KnowledgeGraph::new();
        let ctx = build_context(&g, "ghost", "default");
        assert!(!ctx.known);
        assert!(ctx.failure_patterns.is_empty());
        assert!(ctx.recommendations.is_empty());
        assert!(ctx.max_failure_confidence().is_none());
    }

    #[test]
    fn failure_patterns_sorted_by_confidence() {
        let mut g = KnowledgeGraph::new();
        ingest_outcome(&mut g, &failed_outcome()).unwrap();
        let mut other = failed_outcome();
        other.error = Some(DeployError::Timeout);
        ingest_outcome(&mut g, &other).unwrap();
        ingest_outcome(&mut g, &other).unwrap();

        let patterns = failure_patterns(&g, "risky");
        assert_eq!(patterns.len(), 2);
        assert!(patterns[0].confidence >= patterns[1].confidence);
        let errors: Vec<&str> = patterns.iter().map(|p| p.error.as_str()).collect();
        assert!(errors.contains(&"timeout"));
        assert!(errors.contains(&"worker_crash"));
        let timeout = patterns.iter().find(|p| p.error == "timeout").unwrap();
        assert_eq!(timeout.observations, 2);
    }

    #[test]
    fn single_failure_crosses_auto_canary_cutoff() {
        let mut g = KnowledgeGraph::new();
        ingest_outcome(&mut g, &failed_outcome()).unwrap();
        let ctx = build_context(&g, "risky", "prod");
        assert!(ctx.known);
        // One 0.8 observation lands at ewma(0.5, 0.8) = 0.59, past the cutoff.
        assert!(ctx.max_failure_confidence().unwrap() > 0.15);
    }

    #[test]
    fn recommendations_require_repeat_offenders() {
        let mut g = KnowledgeGraph::new();
        // The breaks weight climbs 0.59, 0.653, 0.6971, 0.72797 under
        // repeated 0.8 observations; only the fourth clears the 0.7 cutoff.
        for _ in 0..3 {
            ingest_outcome(&mut g, &failed_outcome()).unwrap();
            let ctx = build_context(&g, "risky", "prod");
            assert!(ctx.recommendations.is_empty(), "confidence still below 0.7");
        }

        ingest_outcome(&mut g, &failed_outcome()).unwrap();
        let ctx = build_context(&g, "risky", "prod");
        assert_eq!(ctx.recommendations.len(), 1);
        assert!(ctx.recommendations[0].contains("worker_crash"));
    }
}
