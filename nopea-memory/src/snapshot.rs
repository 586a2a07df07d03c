//! Binary graph snapshots. The memory service is the only encoder and
//! decoder; everyone else treats snapshots as opaque blobs.

use crate::graph::KnowledgeGraph;
use bincode::Options;
use serde::{Deserialize, Serialize};

const SNAPSHOT_VERSION: u32 = 1;

/// Upper bound on accepted snapshot size. Anything larger is rejected
/// before deserialization starts.
const MAX_SNAPSHOT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot exceeds {MAX_SNAPSHOT_BYTES} bytes")]
    TooLarge,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot failed validation: {0}")]
    Invalid(String),
    #[error("snapshot decode failed: {0}")]
    Decode(#[from] bincode::Error),
}

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    graph: KnowledgeGraph,
}

/// Encodes the graph into an opaque binary snapshot.
pub fn encode_snapshot(graph: &KnowledgeGraph) -> Vec<u8> {
    let envelope = SnapshotEnvelope {
        version: SNAPSHOT_VERSION,
        graph: graph.clone(),
    };
    bincode::serialize(&envelope).unwrap_or_default()
}

/// Decodes and validates a snapshot. The decode is length-bounded and the
/// resulting graph is shape-checked; a snapshot that fails either check is
/// rejected wholesale.
pub fn decode_snapshot(bytes: &[u8]) -> Result<KnowledgeGraph, SnapshotError> {
    if bytes.len() as u64 > MAX_SNAPSHOT_BYTES {
        return Err(SnapshotError::TooLarge);
    }
    let envelope: SnapshotEnvelope = bincode::options()
        .with_limit(MAX_SNAPSHOT_BYTES)
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .deserialize(bytes)?;
    if envelope.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(envelope.version));
    }
    validate(&envelope.graph)?;
    Ok(envelope.graph)
}

fn validate(graph: &KnowledgeGraph) -> Result<(), SnapshotError> {
    for node in graph.nodes() {
        if !(0.0..=1.0).contains(&node.relevance) {
            return Err(SnapshotError::Invalid(format!(
                "node {} relevance {} out of range",
                node.id, node.relevance
            )));
        }
        if node.observations == 0 {
            return Err(SnapshotError::Invalid(format!(
                "node {} has zero observations",
                node.id
            )));
        }
    }
    for rel in graph.relationships() {
        if !(0.0..=1.0).contains(&rel.weight) {
            return Err(SnapshotError::Invalid(format!(
                "relationship {}-{}-{} weight {} out of range",
                rel.source_id,
                rel.relation.as_str(),
                rel.target_id,
                rel.weight
            )));
        }
    }
    Ok(())
}
