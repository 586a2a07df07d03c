//! Strategy execution: direct batch apply, and the rollout-manifest builder
//! for canary and blue-green, handed off to the progressive-delivery
//! collaborator.

use crate::kube::KubeClient;
use nopea_shared::{DeployError, DeploySpec, Strategy, DEFAULT_CANARY_STEPS};
use serde_json::json;
use std::time::Duration;

/// API group/version of the rollout envelope.
pub const ROLLOUT_API_VERSION: &str = "kulta.io/v1alpha1";
pub const ROLLOUT_KIND: &str = "Rollout";

/// Executes the chosen strategy. All K8s calls are bounded by the spec's
/// timeout; an elapsed timer classifies as `timeout`.
pub async fn execute(
    strategy: Strategy,
    spec: &DeploySpec,
    kube: &dyn KubeClient,
) -> Result<Vec<serde_json::Value>, DeployError> {
    let budget = Duration::from_millis(spec.timeout_ms);
    match strategy {
        Strategy::Direct => {
            let applied = tokio::time::timeout(
                budget,
                kube.apply_manifests(&spec.manifests, &spec.namespace),
            )
            .await
            .map_err(|_| DeployError::Timeout)??;
            Ok(applied)
        }
        Strategy::Canary | Strategy::BlueGreen => {
            let rollout = build_rollout_manifest(spec, strategy)?;
            let applied = tokio::time::timeout(
                budget,
                kube.apply_manifest(&rollout, &spec.namespace),
            )
            .await
            .map_err(|_| DeployError::Timeout)??;
            Ok(vec![applied])
        }
    }
}

/// Translates the spec into the single rollout manifest. Replicas, selector
/// and template come from the first `Deployment` manifest in the spec.
pub fn build_rollout_manifest(
    spec: &DeploySpec,
    strategy: Strategy,
) -> Result<serde_json::Value, DeployError> {
    let deployment = spec
        .manifests
        .iter()
        .find(|m| m.get("kind").and_then(|k| k.as_str()) == Some("Deployment"))
        .ok_or(DeployError::NoDeploymentFound)?;

    let deployment_spec = deployment.get("spec").cloned().unwrap_or_else(|| json!({}));
    let strategy_section = match strategy {
        Strategy::Canary => {
            let steps = canary_steps(spec);
            json!({
                "canary": {
                    "steps": steps.iter().map(|w| json!({"setWeight": w})).collect::<Vec<_>>(),
                    "canaryService": format!("{}-canary", spec.service),
                    "stableService": spec.service,
                }
            })
        }
        Strategy::BlueGreen => json!({
            "blueGreen": {
                "activeService": spec.service,
                "previewService": format!("{}-preview", spec.service),
            }
        }),
        Strategy::Direct => json!({}),
    };

    Ok(json!({
        "apiVersion": ROLLOUT_API_VERSION,
        "kind": ROLLOUT_KIND,
        "metadata": {
            "name": spec.service,
            "namespace": spec.namespace,
            "labels": { "app.kubernetes.io/managed-by": "nopea" },
        },
        "spec": {
            "replicas": deployment_spec.get("replicas").cloned().unwrap_or(serde_json::Value::Null),
            "selector": deployment_spec.get("selector").cloned().unwrap_or(serde_json::Value::Null),
            "template": deployment_spec.get("template").cloned().unwrap_or(serde_json::Value::Null),
            "strategy": strategy_section,
        }
    }))
}

/// Canary steps from the spec, replaced by the defaults when the supplied
/// sequence violates the monotonicity contract.
fn canary_steps(spec: &DeploySpec) -> Vec<u32> {
    if spec.options.canary_steps_valid() {
        spec.options.canary_steps.clone()
    } else {
        tracing::warn!(
            target: "nopea::deploy",
            service = %spec.service,
            steps = ?spec.options.canary_steps,
            "invalid canary steps; using defaults"
        );
        DEFAULT_CANARY_STEPS.to_vec()
    }
}
