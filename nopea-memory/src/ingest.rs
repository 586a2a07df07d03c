//! Maps a deploy outcome onto graph reinforcement operations.

use crate::graph::{KnowledgeGraph, NodeKind, Relation};
use nopea_shared::{id, DeployOutcome, DeployStatus};

/// Rejected outcome; the graph is left unchanged.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("outcome is missing a service name")]
    MissingService,
    #[error("outcome is missing a namespace")]
    MissingNamespace,
}

fn status_confidence(status: DeployStatus) -> f64 {
    match status {
        DeployStatus::Completed => 0.9,
        DeployStatus::Failed => 0.8,
        DeployStatus::Rolledback => 0.7,
    }
}

/// Reinforces the graph with one deploy outcome:
/// a concept node for the service, a concept node for the namespace, the
/// `deployed_to` edge between them, and on failure an error node plus a
/// `breaks` edge. Concurrently deploying services get concept nodes too.
///
/// Validation happens before the first mutation, so a rejected outcome
/// leaves the previous graph intact.
pub fn ingest_outcome(
    graph: &mut KnowledgeGraph,
    outcome: &DeployOutcome,
) -> Result<(), IngestError> {
    if outcome.service.trim().is_empty() {
        return Err(IngestError::MissingService);
    }
    if outcome.namespace.trim().is_empty() {
        return Err(IngestError::MissingNamespace);
    }

    let marker = id::next();
    let confidence = status_confidence(outcome.status);

    let service_id = graph.upsert_node(NodeKind::Concept, &outcome.service, confidence, &marker);
    let namespace_name = format!("namespace:{}", outcome.namespace);
    let namespace_id = graph.upsert_node(NodeKind::Concept, &namespace_name, 0.5, &marker);

    graph.upsert_relationship(
        &service_id,
        Relation::DeployedTo,
        &namespace_id,
        confidence,
        &marker,
        format!(
            "deploy {} at {}",
            outcome.status,
            chrono::Utc::now().to_rfc3339()
        ),
    );

    if outcome.status == DeployStatus::Failed {
        if let Some(error) = &outcome.error {
            let error_id = graph.upsert_node(NodeKind::Error, error.tag(), 0.8, &marker);
            graph.upsert_relationship(
                &service_id,
                Relation::Breaks,
                &error_id,
                0.8,
                &marker,
                format!("deploy failed: {error}"),
            );
        }
    }

    for concurrent in &outcome.concurrent_deploys {
        if !concurrent.trim().is_empty() {
            graph.upsert_node(NodeKind::Concept, concurrent, 0.5, &marker);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{node_id, Direction};
    use nopea_shared::DeployError;

    fn outcome(status: DeployStatus, error: Option<DeployError>) -> DeployOutcome {
        DeployOutcome {
            service: "checkout".to_string(),
            namespace: "prod".to_string(),
            status,
            error,
            concurrent_deploys: Vec::new(),
        }
    }

    #[test]
    fn completed_deploy_creates_service_and_namespace() {
        let mut g = KnowledgeGraph::new();
        ingest_outcome(&mut g, &outcome(DeployStatus::Completed, None)).unwrap();

        assert_eq!(g.node_count(), 2);
        assert_eq!(g.relationship_count(), 1);

        let svc = node_id(NodeKind::Concept, "checkout");
        let edges = g.neighbors(&svc, Direction::Outgoing);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relation, Relation::DeployedTo);
        assert!(edges[0].evidence[0].starts_with("deploy completed at "));
    }

    #[test]
    fn failed_deploy_records_a_breaks_edge() {
        let mut g = KnowledgeGraph::new();
        ingest_outcome(
            &mut g,
            &outcome(
                DeployStatus::Failed,
                Some(DeployError::ApplyFailed {
                    message: "image pull backoff".to_string(),
                }),
            ),
        )
        .unwrap();

        let svc = node_id(NodeKind::Concept, "checkout");
        let err = node_id(NodeKind::Error, "apply_failed");
        let node = g.get_node(&err).expect("error node exists");
        assert_eq!(node.kind, NodeKind::Error);

        let breaks: Vec<_> = g
            .neighbors(&svc, Direction::Outgoing)
            .into_iter()
            .filter(|r| r.relation == Relation::Breaks)
            .collect();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].target_id, err);
        assert_eq!(
            breaks[0].evidence[0],
            "deploy failed: apply failed: image pull backoff"
        );
    }

    #[test]
    fn failed_without_error_adds_no_breaks_edge() {
        let mut g = KnowledgeGraph::new();
        ingest_outcome(&mut g, &outcome(DeployStatus::Failed, None)).unwrap();
        assert_eq!(g.relationship_count(), 1);
    }

    #[test]
    fn concurrent_deploys_become_concept_nodes() {
        let mut g = KnowledgeGraph::new();
        let mut o = outcome(DeployStatus::Completed, None);
        o.concurrent_deploys = vec!["billing".to_string(), "search".to_string()];
        ingest_outcome(&mut g, &o).unwrap();
        assert_eq!(g.node_count(), 4);
    }

    #[test]
    fn empty_service_is_rejected_without_mutation() {
        let mut g = KnowledgeGraph::new();
        let mut o = outcome(DeployStatus::Completed, None);
        o.service = "  ".to_string();
        assert!(ingest_outcome(&mut g, &o).is_err());
        assert_eq!(g.node_count(), 0);
    }
}
