//! Deploy specification and result types shared by the orchestrator,
//! the agents and the gateway surfaces.

use crate::error::DeployError;
use serde::{Deserialize, Serialize};

/// Namespace used when a spec does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Per-deploy timeout applied to K8s client calls, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Canary traffic steps used when the spec does not provide any.
pub const DEFAULT_CANARY_STEPS: [u32; 5] = [10, 25, 50, 75, 100];

/// Rollout strategy for a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Direct,
    Canary,
    BlueGreen,
}

impl Strategy {
    /// Stable wire name (matches the CLI/API strings).
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Canary => "canary",
            Strategy::BlueGreen => "blue_green",
        }
    }

    /// Parses a wire string. Unknown values return None so the caller can
    /// decide whether to coerce or reject.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Strategy::Direct),
            "canary" => Some(Strategy::Canary),
            "blue_green" => Some(Strategy::BlueGreen),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Blue/green slot currently receiving live traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveSlot {
    Blue,
    Green,
}

impl Default for ActiveSlot {
    fn default() -> Self {
        ActiveSlot::Blue
    }
}

/// Strategy-specific knobs carried on the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOptions {
    /// Traffic percentages for canary steps. Must be strictly increasing in
    /// (0, 100] with a final step of 100.
    #[serde(default = "default_canary_steps")]
    pub canary_steps: Vec<u32>,
    #[serde(default)]
    pub active_slot: ActiveSlot,
}

fn default_canary_steps() -> Vec<u32> {
    DEFAULT_CANARY_STEPS.to_vec()
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            canary_steps: default_canary_steps(),
            active_slot: ActiveSlot::default(),
        }
    }
}

impl DeployOptions {
    /// Validates the canary step sequence: strictly monotone, in (0, 100],
    /// last step 100.
    pub fn canary_steps_valid(&self) -> bool {
        if self.canary_steps.is_empty() {
            return false;
        }
        let mut prev = 0u32;
        for &step in &self.canary_steps {
            if step == 0 || step > 100 || step <= prev {
                return false;
            }
            prev = step;
        }
        prev == 100
    }
}

/// A deploy request as submitted by the CLI, HTTP API or tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySpec {
    pub service: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Ordered resource manifests (already parsed into JSON objects).
    #[serde(default)]
    pub manifests: Vec<serde_json::Value>,
    /// Explicit strategy; absent means auto-select from deploy memory.
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub options: DeployOptions,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl DeploySpec {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: default_namespace(),
            manifests: Vec::new(),
            strategy: None,
            options: DeployOptions::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_manifests(mut self, manifests: Vec<serde_json::Value>) -> Self {
        self.manifests = manifests;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

/// Terminal status of a deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Completed,
    Failed,
    Rolledback,
}

impl DeployStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployStatus::Completed => "completed",
            DeployStatus::Failed => "failed",
            DeployStatus::Rolledback => "rolledback",
        }
    }
}

impl std::fmt::Display for DeployStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single deploy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResult {
    /// 26-char sortable identifier assigned at the start of the run.
    pub deploy_id: String,
    pub service: String,
    pub namespace: String,
    pub status: DeployStatus,
    /// The strategy actually used (after auto-selection).
    pub strategy: Strategy,
    pub manifest_count: usize,
    pub duration_ms: u64,
    /// True iff every post-deploy verification returned no drift or a new
    /// resource. Verification errors clear this without failing the deploy.
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DeployError>,
    #[serde(default)]
    pub applied_resources: Vec<serde_json::Value>,
    /// ISO-8601 UTC completion time.
    pub timestamp: String,
}

impl DeployResult {
    /// Builds a failure result for a deploy that never reached the
    /// orchestrator (queue overflow, worker crash).
    pub fn failure(
        deploy_id: impl Into<String>,
        spec: &DeploySpec,
        error: DeployError,
        duration_ms: u64,
    ) -> Self {
        Self {
            deploy_id: deploy_id.into(),
            service: spec.service.clone(),
            namespace: spec.namespace.clone(),
            status: DeployStatus::Failed,
            strategy: spec.strategy.unwrap_or(Strategy::Direct),
            manifest_count: spec.manifests.len(),
            duration_ms,
            verified: false,
            error: Some(error),
            applied_resources: Vec::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Outcome record handed to the memory service for ingestion.
    pub fn outcome(&self) -> DeployOutcome {
        DeployOutcome {
            service: self.service.clone(),
            namespace: self.namespace.clone(),
            status: self.status,
            error: self.error.clone(),
            concurrent_deploys: Vec::new(),
        }
    }
}

/// The slice of a deploy result the memory subsystem ingests.
///
/// `concurrent_deploys` is part of the contract so future schedulers can
/// wire co-deploy information in without touching the graph core; callers
/// today pass an empty list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub service: String,
    pub namespace: String,
    pub status: DeployStatus,
    #[serde(default)]
    pub error: Option<DeployError>,
    #[serde(default)]
    pub concurrent_deploys: Vec<String>,
}
