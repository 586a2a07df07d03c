//! Deploy memory: a content-addressed, weighted knowledge graph with EWMA
//! reinforcement and time decay, owned by a single service task.
//!
//! Every deploy outcome is ingested as graph reinforcement; the orchestrator
//! queries the graph for failure patterns before selecting a strategy. No
//! component outside this crate mutates the live graph.

mod graph;
mod ingest;
mod query;
mod service;
mod snapshot;

pub use graph::{Direction, GraphNode, KnowledgeGraph, NodeKind, Relation, Relationship};
pub use ingest::ingest_outcome;
pub use query::{DeployContext, Dependency, FailurePattern};
pub use service::{GraphStats, MemoryHandle, MemoryService, SnapshotStore};
pub use snapshot::{decode_snapshot, encode_snapshot, SnapshotError};
