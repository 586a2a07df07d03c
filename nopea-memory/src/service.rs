//! Single-owner memory service: a background task that owns the live graph
//! and processes ingestion and queries in submission order.

use crate::graph::KnowledgeGraph;
use crate::ingest::ingest_outcome;
use crate::query::{build_context, DeployContext};
use crate::snapshot::{decode_snapshot, encode_snapshot};
use nopea_shared::DeployOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Hourly decay factor applied to every node and relationship.
const DECAY_FACTOR: f64 = 0.98;
const DECAY_INTERVAL: Duration = Duration::from_secs(3600);

/// Where the memory service parks its opaque snapshot between restarts.
pub trait SnapshotStore: Send + Sync {
    fn load_snapshot(&self) -> Option<Vec<u8>>;
    fn store_snapshot(&self, bytes: Vec<u8>);
}

/// Graph size introspection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub relationships: usize,
}

enum Command {
    Record(DeployOutcome),
    Context {
        service: String,
        namespace: String,
        reply: oneshot::Sender<DeployContext>,
    },
    Stats {
        reply: oneshot::Sender<GraphStats>,
    },
    Graph {
        reply: oneshot::Sender<KnowledgeGraph>,
    },
}

/// Cheap cloneable handle to the memory service task.
#[derive(Clone)]
pub struct MemoryHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl MemoryHandle {
    /// Non-blocking submission of a deploy outcome. Never fails observably:
    /// if the service is gone the outcome is dropped and logged.
    pub fn record_deploy(&self, outcome: DeployOutcome) {
        if self.tx.send(Command::Record(outcome)).is_err() {
            tracing::warn!(target: "nopea::memory", "memory service is down; outcome dropped");
        }
    }

    /// Context for the next deploy of `service` in `namespace`. Returns the
    /// unknown-service context when the service task is unavailable.
    pub async fn get_deploy_context(&self, service: &str, namespace: &str) -> DeployContext {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(Command::Context {
            service: service.to_string(),
            namespace: namespace.to_string(),
            reply,
        });
        if sent.is_err() {
            return DeployContext::unknown(service, namespace);
        }
        rx.await
            .unwrap_or_else(|_| DeployContext::unknown(service, namespace))
    }

    pub async fn stats(&self) -> GraphStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stats { reply }).is_err() {
            return GraphStats {
                nodes: 0,
                relationships: 0,
            };
        }
        rx.await.unwrap_or(GraphStats {
            nodes: 0,
            relationships: 0,
        })
    }

    /// A consistent copy of the live graph.
    pub async fn graph(&self) -> KnowledgeGraph {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Graph { reply }).is_err() {
            return KnowledgeGraph::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// The memory service task. Owns the graph exclusively.
pub struct MemoryService;

impl MemoryService {
    /// Restores the graph from the store's snapshot slot (empty graph on any
    /// restoration failure), then spawns the owner task with an hourly decay
    /// tick.
    pub fn spawn(store: Arc<dyn SnapshotStore>) -> MemoryHandle {
        let graph = match store.load_snapshot() {
            Some(bytes) => match decode_snapshot(&bytes) {
                Ok(graph) => {
                    tracing::info!(
                        target: "nopea::memory",
                        nodes = graph.node_count(),
                        relationships = graph.relationship_count(),
                        "restored graph snapshot"
                    );
                    graph
                }
                Err(e) => {
                    tracing::warn!(
                        target: "nopea::memory",
                        error = %e,
                        "snapshot restoration failed; starting with an empty graph"
                    );
                    KnowledgeGraph::new()
                }
            },
            None => KnowledgeGraph::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(graph, rx, store));
        MemoryHandle { tx }
    }
}

async fn run(
    mut graph: KnowledgeGraph,
    mut rx: mpsc::UnboundedReceiver<Command>,
    store: Arc<dyn SnapshotStore>,
) {
    let start = tokio::time::Instant::now() + DECAY_INTERVAL;
    let mut decay = tokio::time::interval_at(start, DECAY_INTERVAL);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                handle(&mut graph, cmd, store.as_ref());
            }
            _ = decay.tick() => {
                graph.decay_all(DECAY_FACTOR);
                store.store_snapshot(encode_snapshot(&graph));
                tracing::debug!(
                    target: "nopea::memory",
                    nodes = graph.node_count(),
                    relationships = graph.relationship_count(),
                    "applied hourly decay"
                );
            }
        }
    }
    tracing::debug!(target: "nopea::memory", "memory service stopped");
}

fn handle(graph: &mut KnowledgeGraph, cmd: Command, store: &dyn SnapshotStore) {
    match cmd {
        Command::Record(outcome) => match ingest_outcome(graph, &outcome) {
            Ok(()) => store.store_snapshot(encode_snapshot(graph)),
            Err(e) => {
                tracing::warn!(
                    target: "nopea::memory",
                    service = %outcome.service,
                    error = %e,
                    "deploy outcome rejected; graph unchanged"
                );
            }
        },
        Command::Context {
            service,
            namespace,
            reply,
        } => {
            let _ = reply.send(build_context(graph, &service, &namespace));
        }
        Command::Stats { reply } => {
            let _ = reply.send(GraphStats {
                nodes: graph.node_count(),
                relationships: graph.relationship_count(),
            });
        }
        Command::Graph { reply } => {
            let _ = reply.send(graph.clone());
        }
    }
}
