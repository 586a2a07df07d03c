//! Deploy core: orchestrator, strategies, drift verification, cache tables,
//! occurrence reports and the per-service agent runtime.

pub mod agent;
pub mod cache;
pub mod cdevents;
pub mod drift;
pub mod kube;
pub mod occurrence;
pub mod orchestrator;
pub mod strategy;
pub mod telemetry;

pub use agent::{AgentStatus, AgentSupervisor};
pub use cache::{resource_key, Cache, ServiceState};
pub use cdevents::CdEventsEmitter;
pub use drift::{three_way_diff, verify_manifest, DriftOutcome};
pub use kube::{KubeClient, KubeError, MockKubeClient};
pub use orchestrator::Orchestrator;
pub use telemetry::{Telemetry, TelemetrySnapshot};
