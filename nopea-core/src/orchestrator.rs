//! End-to-end deploy lifecycle: context fetch, strategy selection,
//! execution, drift verification, recording and reporting.
//!
//! `run` never raises; every failure mode is folded into the returned
//! result. Callers needing per-service serialization route through the
//! agent runtime; direct invocation is permitted when no supervisor exists,
//! in which case the caller serializes.

use crate::cache::{resource_key, Cache};
use crate::cdevents::{self, CdEventsEmitter};
use crate::drift::verify_manifest;
use crate::kube::KubeClient;
use crate::occurrence::{build_occurrence, persist_occurrence};
use crate::strategy;
use crate::telemetry::Telemetry;
use nopea_memory::{DeployContext, MemoryHandle};
use nopea_shared::{id, DeployResult, DeploySpec, DeployStatus, Strategy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub struct Orchestrator {
    kube: Arc<dyn KubeClient>,
    cache: Arc<Cache>,
    memory: Option<MemoryHandle>,
    telemetry: Arc<Telemetry>,
    cdevents: Option<Arc<CdEventsEmitter>>,
    canary_confidence_threshold: f64,
    state_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(kube: Arc<dyn KubeClient>, cache: Arc<Cache>) -> Self {
        Self {
            kube,
            cache,
            memory: None,
            telemetry: Arc::new(Telemetry::new()),
            cdevents: None,
            canary_confidence_threshold: 0.15,
            state_dir: PathBuf::from("."),
        }
    }

    pub fn with_memory(mut self, memory: MemoryHandle) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_cdevents(mut self, emitter: Arc<CdEventsEmitter>) -> Self {
        self.cdevents = Some(emitter);
        self
    }

    pub fn with_canary_threshold(mut self, threshold: f64) -> Self {
        self.canary_confidence_threshold = threshold;
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn memory(&self) -> Option<&MemoryHandle> {
        self.memory.as_ref()
    }

    /// Strategy for this run: explicit choice wins; otherwise the deploy
    /// memory promotes risky services to canary.
    fn select_strategy(&self, spec: &DeploySpec, context: &DeployContext) -> Strategy {
        if let Some(strategy) = spec.strategy {
            return strategy;
        }
        let risky = context
            .max_failure_confidence()
            .map(|c| c > self.canary_confidence_threshold)
            .unwrap_or(false);
        if risky {
            tracing::info!(
                target: "nopea::deploy",
                service = %spec.service,
                "failure history detected; auto-selecting canary"
            );
            Strategy::Canary
        } else {
            Strategy::Direct
        }
    }

    /// Runs one deploy to completion. Always returns a result.
    pub async fn run(&self, spec: DeploySpec) -> DeployResult {
        let deploy_id = id::next();
        let start = Instant::now();

        let context = match &self.memory {
            Some(memory) => {
                memory
                    .get_deploy_context(&spec.service, &spec.namespace)
                    .await
            }
            None => DeployContext::unknown(&spec.service, &spec.namespace),
        };
        let strategy = self.select_strategy(&spec, &context);

        self.telemetry.deploy_start(&spec.service);
        if let Some(emitter) = &self.cdevents {
            emitter.emit(cdevents::DEPLOYMENT_STARTED, &spec.service, &deploy_id);
        }
        tracing::info!(
            target: "nopea::deploy",
            service = %spec.service,
            namespace = %spec.namespace,
            deploy_id = %deploy_id,
            strategy = %strategy,
            manifests = spec.manifests.len(),
            "deploy started"
        );

        let result = match strategy::execute(strategy, &spec, self.kube.as_ref()).await {
            Ok(applied) => {
                // Record what was applied before verifying, so the three-way
                // diff compares live state against this deploy.
                for manifest in &applied {
                    let key = resource_key(manifest, &spec.namespace);
                    self.cache
                        .put_last_applied(&spec.service, &key, manifest.clone());
                }
                let verified = self.verify_applied(&spec, &applied).await;
                DeployResult {
                    deploy_id: deploy_id.clone(),
                    service: spec.service.clone(),
                    namespace: spec.namespace.clone(),
                    status: DeployStatus::Completed,
                    strategy,
                    manifest_count: applied.len(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    verified,
                    error: None,
                    applied_resources: applied,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                }
            }
            Err(error) => {
                tracing::warn!(
                    target: "nopea::deploy",
                    service = %spec.service,
                    deploy_id = %deploy_id,
                    error = %error,
                    "deploy failed"
                );
                DeployResult {
                    deploy_id: deploy_id.clone(),
                    service: spec.service.clone(),
                    namespace: spec.namespace.clone(),
                    status: DeployStatus::Failed,
                    strategy,
                    manifest_count: spec.manifests.len(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    verified: false,
                    error: Some(error),
                    applied_resources: Vec::new(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                }
            }
        };

        self.record(&result, &context);
        result
    }

    /// Post-deploy verification. True iff every manifest comes back clean;
    /// any verification error clears the flag without failing the deploy.
    async fn verify_applied(&self, spec: &DeploySpec, applied: &[serde_json::Value]) -> bool {
        for manifest in applied {
            match verify_manifest(
                &self.cache,
                self.kube.as_ref(),
                &spec.service,
                manifest,
                &spec.namespace,
            )
            .await
            {
                Ok(outcome) if outcome.is_clean() => {}
                Ok(outcome) => {
                    tracing::warn!(
                        target: "nopea::drift",
                        service = %spec.service,
                        resource = %resource_key(manifest, &spec.namespace),
                        outcome = outcome.as_str(),
                        "drift detected"
                    );
                    return false;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "nopea::drift",
                        service = %spec.service,
                        error = %e,
                        "verification error"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Records the finished deploy into memory (fire-and-forget), the cache
    /// (synchronous) and the occurrence artifact, then emits the outcome
    /// telemetry and events.
    fn record(&self, result: &DeployResult, context: &DeployContext) {
        if let Some(memory) = &self.memory {
            memory.record_deploy(result.outcome());
        }
        self.cache.put_deployment(result.clone());

        let occurrence = build_occurrence(result, Some(context));
        if let Err(e) = persist_occurrence(&self.state_dir, &occurrence) {
            tracing::error!(
                target: "nopea::deploy",
                service = %result.service,
                error = %e,
                "failed to persist occurrence artifact"
            );
        }

        match result.status {
            DeployStatus::Completed => {
                self.telemetry
                    .deploy_stop(&result.service, result.duration_ms);
            }
            _ => {
                self.telemetry
                    .deploy_error(&result.service, result.duration_ms);
            }
        }

        if let Some(emitter) = &self.cdevents {
            emitter.emit(
                cdevents::outcome_event_type(result.status),
                &result.service,
                &result.deploy_id,
            );
            if result.status == DeployStatus::Completed {
                let service_event = if context.known {
                    cdevents::SERVICE_UPGRADED
                } else {
                    cdevents::SERVICE_DEPLOYED
                };
                emitter.emit(service_event, &result.service, &result.deploy_id);
            }
        }
    }
}

/// Parses a strategy string from an external surface. Unknown values are
/// logged and coerced to direct.
pub fn parse_strategy_lenient(raw: &str) -> Strategy {
    match Strategy::parse(raw) {
        Some(strategy) => strategy,
        None => {
            tracing::warn!(
                target: "nopea::deploy",
                strategy = raw,
                "unknown strategy; using direct"
            );
            Strategy::Direct
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{KubeError, MockKubeClient};
    use nopea_memory::{MemoryService, SnapshotStore};
    use nopea_shared::DeployError;
    use serde_json::json;

    fn orchestrator_with(kube: Arc<MockKubeClient>) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(kube, Arc::new(Cache::new())).with_state_dir(dir.path());
        (orch, dir)
    }

    #[tokio::test]
    async fn empty_direct_deploy_completes() {
        let kube = Arc::new(MockKubeClient::new());
        let (orch, _dir) = orchestrator_with(kube);
        let result = orch
            .run(DeploySpec::new("test-svc").with_strategy(Strategy::Direct))
            .await;
        assert_eq!(result.status, DeployStatus::Completed);
        assert_eq!(result.strategy, Strategy::Direct);
        assert_eq!(result.manifest_count, 0);
        assert_eq!(result.deploy_id.len(), 26);
        assert!(result.verified);
    }

    #[tokio::test]
    async fn kube_failure_folds_into_the_result() {
        let kube = Arc::new(MockKubeClient::new());
        kube.fail_next(KubeError::Forbidden);
        let (orch, _dir) = orchestrator_with(kube);
        let result = orch
            .run(
                DeploySpec::new("web")
                    .with_manifests(vec![json!({"kind": "ConfigMap", "metadata": {"name": "c"}})]),
            )
            .await;
        assert_eq!(result.status, DeployStatus::Failed);
        assert_eq!(result.error, Some(DeployError::Forbidden));
        assert!(!result.verified);
    }

    #[tokio::test]
    async fn auto_selects_canary_after_a_recorded_failure() {
        let kube = Arc::new(MockKubeClient::new());
        let cache = Arc::new(Cache::new());
        let memory = MemoryService::spawn(Arc::clone(&cache) as Arc<dyn SnapshotStore>);
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(kube, cache)
            .with_memory(memory.clone())
            .with_state_dir(dir.path());

        memory.record_deploy(nopea_shared::DeployOutcome {
            service: "risky-svc".to_string(),
            namespace: "prod".to_string(),
            status: DeployStatus::Failed,
            error: Some(DeployError::WorkerCrash {
                reason: "crash".to_string(),
            }),
            concurrent_deploys: Vec::new(),
        });
        // Serialize against the write before asking for context.
        let _ = memory.get_deploy_context("risky-svc", "prod").await;

        let result = orch
            .run(
                DeploySpec::new("risky-svc")
                    .with_namespace("prod")
                    .with_manifests(vec![json!({
                        "kind": "Deployment",
                        "metadata": {"name": "risky-svc"},
                        "spec": {"replicas": 1}
                    })]),
            )
            .await;
        assert_eq!(result.strategy, Strategy::Canary);
        assert_eq!(result.status, DeployStatus::Completed);
    }

    #[tokio::test]
    async fn fresh_service_defaults_to_direct() {
        let kube = Arc::new(MockKubeClient::new());
        let cache = Arc::new(Cache::new());
        let memory = MemoryService::spawn(Arc::clone(&cache) as Arc<dyn SnapshotStore>);
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(kube, cache)
            .with_memory(memory)
            .with_state_dir(dir.path());
        let result = orch.run(DeploySpec::new("fresh-svc")).await;
        assert_eq!(result.strategy, Strategy::Direct);
    }

    #[tokio::test]
    async fn verification_error_clears_verified_without_failing() {
        let kube = Arc::new(MockKubeClient::new());
        let (orch, _dir) = orchestrator_with(Arc::clone(&kube));
        let spec = DeploySpec::new("web").with_manifests(vec![json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        })]);

        // The apply succeeds; the verification GET hits a refused connection.
        kube.fail_next_get(KubeError::ConnectionRefused);
        let result = orch.run(spec).await;
        assert_eq!(result.status, DeployStatus::Completed);
        assert!(!result.verified);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn records_deploy_into_cache_and_memory() {
        let kube = Arc::new(MockKubeClient::new());
        let cache = Arc::new(Cache::new());
        let memory = MemoryService::spawn(Arc::clone(&cache) as Arc<dyn SnapshotStore>);
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(kube, Arc::clone(&cache))
            .with_memory(memory.clone())
            .with_state_dir(dir.path());

        let result = orch.run(DeploySpec::new("test-svc")).await;
        assert!(cache
            .get_deployment("test-svc", &result.deploy_id)
            .is_some());

        let ctx = memory.get_deploy_context("test-svc", "default").await;
        assert!(ctx.known);

        // Occurrence artifacts landed on disk.
        assert!(dir.path().join(".nopea/occurrence.json").exists());
    }

    #[test]
    fn unknown_strategy_strings_coerce_to_direct() {
        assert_eq!(parse_strategy_lenient("canary"), Strategy::Canary);
        assert_eq!(parse_strategy_lenient("rolling"), Strategy::Direct);
    }
}
