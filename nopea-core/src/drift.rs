//! Post-deploy drift verification: manifest normalization, content hashing
//! and the three-way diff between last-applied, desired and live state.

use crate::cache::{resource_key, Cache};
use crate::kube::{KubeClient, KubeError};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Volatile metadata fields managed by the cluster.
const METADATA_FIELDS: [&str; 7] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
    "namespace",
];

/// Annotations written by kubectl and the deployment controller.
const ANNOTATION_FIELDS: [&str; 2] = [
    "kubectl.kubernetes.io/last-applied-configuration",
    "deployment.kubernetes.io/revision",
];

/// Pod-spec fields the API server defaults.
const POD_SPEC_FIELDS: [&str; 5] = [
    "dnsPolicy",
    "restartPolicy",
    "schedulerName",
    "securityContext",
    "terminationGracePeriodSeconds",
];

const CONTAINER_FIELDS: [&str; 2] = ["terminationMessagePath", "terminationMessagePolicy"];

const PROBE_FIELDS: [&str; 3] = ["failureThreshold", "periodSeconds", "successThreshold"];

/// Service-spec fields assigned by the cluster.
const SERVICE_SPEC_FIELDS: [&str; 6] = [
    "clusterIP",
    "clusterIPs",
    "internalTrafficPolicy",
    "ipFamilies",
    "ipFamilyPolicy",
    "sessionAffinity",
];

/// Classification of a verified resource.
#[derive(Debug, Clone, PartialEq)]
pub enum DriftOutcome {
    /// Desired, last-applied and live all agree.
    NoDrift,
    /// The resource was never applied and does not exist live.
    NewResource,
    /// Live exists but nothing was recorded as last-applied.
    NeedsApply,
    /// Desired moved away from last-applied; live still matches.
    GitChange { from: String, to: String },
    /// Live moved away from last-applied; desired did not.
    ManualDrift { expected: Value, actual: Value },
    /// Both desired and live moved independently.
    Conflict {
        last: Value,
        desired: Value,
        live: Value,
    },
}

impl DriftOutcome {
    /// Outcomes that leave a deploy verified.
    pub fn is_clean(&self) -> bool {
        matches!(self, DriftOutcome::NoDrift | DriftOutcome::NewResource)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftOutcome::NoDrift => "no_drift",
            DriftOutcome::NewResource => "new_resource",
            DriftOutcome::NeedsApply => "needs_apply",
            DriftOutcome::GitChange { .. } => "git_change",
            DriftOutcome::ManualDrift { .. } => "manual_drift",
            DriftOutcome::Conflict { .. } => "conflict",
        }
    }
}

fn remove_fields(object: &mut Value, fields: &[&str]) {
    if let Some(map) = object.as_object_mut() {
        for field in fields {
            map.remove(*field);
        }
    }
}

/// "1000m" → "1" when the milli value is an exact whole-core count.
fn normalize_cpu(value: &Value) -> Value {
    if let Some(text) = value.as_str() {
        if let Some(milli) = text.strip_suffix('m') {
            if let Ok(n) = milli.parse::<u64>() {
                if n > 0 && n % 1000 == 0 {
                    return Value::String((n / 1000).to_string());
                }
            }
        }
    }
    value.clone()
}

fn normalize_container(container: &mut Value) {
    remove_fields(container, &CONTAINER_FIELDS);
    for probe in ["livenessProbe", "readinessProbe"] {
        if let Some(p) = container.get_mut(probe) {
            remove_fields(p, &PROBE_FIELDS);
        }
    }
    if let Some(cpu) = container
        .get_mut("resources")
        .and_then(|r| r.get_mut("limits"))
        .and_then(|l| l.get_mut("cpu"))
    {
        *cpu = normalize_cpu(cpu);
    }
}

fn normalize_deployment(spec: &mut Value) {
    remove_fields(spec, &["replicas"]);
    if let Some(rolling) = spec
        .get_mut("strategy")
        .and_then(|s| s.get_mut("rollingUpdate"))
    {
        remove_fields(rolling, &["maxSurge"]);
    }
    if let Some(pod_spec) = spec
        .get_mut("template")
        .and_then(|t| t.get_mut("spec"))
    {
        remove_fields(pod_spec, &POD_SPEC_FIELDS);
        if let Some(containers) = pod_spec.get_mut("containers").and_then(|c| c.as_array_mut()) {
            for container in containers {
                normalize_container(container);
            }
        }
    }
}

/// Strips volatile and cluster-managed fields so that semantically equal
/// manifests hash equal. Idempotent.
pub fn normalize(manifest: &Value) -> Value {
    let mut out = manifest.clone();
    remove_fields(&mut out, &["status"]);

    if let Some(metadata) = out.get_mut("metadata") {
        remove_fields(metadata, &METADATA_FIELDS);
        let drop_annotations = if let Some(annotations) = metadata.get_mut("annotations") {
            remove_fields(annotations, &ANNOTATION_FIELDS);
            annotations.as_object().map(|m| m.is_empty()).unwrap_or(false)
        } else {
            false
        };
        if drop_annotations {
            remove_fields(metadata, &["annotations"]);
        }
    }

    let kind = out.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    match kind {
        "Deployment" => {
            if let Some(spec) = out.get_mut("spec") {
                normalize_deployment(spec);
            }
        }
        "Service" => {
            if let Some(spec) = out.get_mut("spec") {
                remove_fields(spec, &SERVICE_SPEC_FIELDS);
            }
        }
        _ => {}
    }
    out
}

/// SHA-256 of the compact JSON encoding of the normalized manifest.
pub fn hash_manifest(manifest: &Value) -> String {
    let normalized = normalize(manifest);
    let encoded = serde_json::to_vec(&normalized).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Classifies drift among the three states of a resource.
pub fn three_way_diff(last_applied: &Value, desired: &Value, live: &Value) -> DriftOutcome {
    let last_hash = hash_manifest(last_applied);
    let git_change = hash_manifest(desired) != last_hash;
    let manual_drift = hash_manifest(live) != last_hash;

    match (git_change, manual_drift) {
        (false, false) => DriftOutcome::NoDrift,
        (true, false) => DriftOutcome::GitChange {
            from: last_hash,
            to: hash_manifest(desired),
        },
        (false, true) => DriftOutcome::ManualDrift {
            expected: normalize(last_applied),
            actual: normalize(live),
        },
        (true, true) => DriftOutcome::Conflict {
            last: normalize(last_applied),
            desired: normalize(desired),
            live: normalize(live),
        },
    }
}

/// Verifies one desired manifest against the last-applied cache entry and
/// the live resource.
pub async fn verify_manifest(
    cache: &Cache,
    kube: &dyn KubeClient,
    service: &str,
    desired: &Value,
    default_namespace: &str,
) -> Result<DriftOutcome, KubeError> {
    let key = resource_key(desired, default_namespace);
    let last_applied = cache.get_last_applied(service, &key);

    let api_version = desired
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .unwrap_or("v1");
    let kind = desired.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let name = desired
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let namespace = desired
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .unwrap_or(default_namespace);

    let live = match kube.get_resource(api_version, kind, name, namespace).await {
        Ok(manifest) => Some(manifest),
        Err(KubeError::NotFound) => None,
        Err(e) => return Err(e),
    };

    Ok(match (last_applied, live) {
        (None, None) => DriftOutcome::NewResource,
        (None, Some(_)) => DriftOutcome::NeedsApply,
        (Some(_), None) => DriftOutcome::NewResource,
        (Some(last), Some(live)) => three_way_diff(&last, desired, &live),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::MockKubeClient;
    use serde_json::json;

    fn deployment() -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "labels": {"app": "web"}
            },
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "strategy": {"rollingUpdate": {"maxUnavailable": 1}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {
                        "containers": [{
                            "name": "web",
                            "image": "web:1.2.3",
                            "resources": {"limits": {"cpu": "500m", "memory": "256Mi"}}
                        }]
                    }
                }
            }
        })
    }

    /// The same deployment after the cluster has had its way with it.
    fn cluster_noise(mut manifest: Value) -> Value {
        manifest["status"] = json!({"readyReplicas": 3});
        manifest["metadata"]["resourceVersion"] = json!("123456");
        manifest["metadata"]["uid"] = json!("6e1c3a");
        manifest["metadata"]["creationTimestamp"] = json!("2026-08-01T00:00:00Z");
        manifest["metadata"]["generation"] = json!(4);
        manifest["metadata"]["managedFields"] = json!([{"manager": "kubectl"}]);
        manifest["metadata"]["annotations"] = json!({
            "kubectl.kubernetes.io/last-applied-configuration": "{...}",
            "deployment.kubernetes.io/revision": "7"
        });
        manifest["spec"]["replicas"] = json!(3);
        manifest["spec"]["strategy"]["rollingUpdate"]["maxSurge"] = json!("25%");
        let pod_spec = &mut manifest["spec"]["template"]["spec"];
        pod_spec["dnsPolicy"] = json!("ClusterFirst");
        pod_spec["restartPolicy"] = json!("Always");
        pod_spec["schedulerName"] = json!("default-scheduler");
        pod_spec["terminationGracePeriodSeconds"] = json!(30);
        pod_spec["containers"][0]["terminationMessagePath"] = json!("/dev/termination-log");
        pod_spec["containers"][0]["terminationMessagePolicy"] = json!("File");
        manifest
    }

    #[test]
    fn normalize_is_idempotent() {
        let noisy = cluster_noise(deployment());
        let once = normalize(&noisy);
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn cluster_noise_does_not_change_the_hash() {
        let clean = deployment();
        let noisy = cluster_noise(deployment());
        assert_eq!(hash_manifest(&clean), hash_manifest(&noisy));
    }

    #[test]
    fn empty_annotations_map_is_dropped() {
        let mut manifest = deployment();
        manifest["metadata"]["annotations"] = json!({
            "deployment.kubernetes.io/revision": "2"
        });
        let normalized = normalize(&manifest);
        assert!(normalized["metadata"].get("annotations").is_none());

        // A user annotation survives.
        manifest["metadata"]["annotations"] = json!({
            "team": "payments",
            "deployment.kubernetes.io/revision": "2"
        });
        let normalized = normalize(&manifest);
        assert_eq!(normalized["metadata"]["annotations"]["team"], "payments");
    }

    #[test]
    fn whole_core_milli_cpu_is_normalized() {
        let mut a = deployment();
        a["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"]["cpu"] =
            json!("1000m");
        let mut b = deployment();
        b["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"]["cpu"] = json!("1");
        assert_eq!(hash_manifest(&a), hash_manifest(&b));

        // Fractional cores are left alone.
        let mut c = deployment();
        c["spec"]["template"]["spec"]["containers"][0]["resources"]["limits"]["cpu"] =
            json!("1500m");
        assert_ne!(hash_manifest(&c), hash_manifest(&b));
    }

    #[test]
    fn service_cluster_fields_are_stripped() {
        let desired = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "web"},
            "spec": {"ports": [{"port": 80}], "selector": {"app": "web"}}
        });
        let mut live = desired.clone();
        live["spec"]["clusterIP"] = json!("10.0.0.12");
        live["spec"]["clusterIPs"] = json!(["10.0.0.12"]);
        live["spec"]["sessionAffinity"] = json!("None");
        live["spec"]["internalTrafficPolicy"] = json!("Cluster");
        assert_eq!(hash_manifest(&desired), hash_manifest(&live));
    }

    #[test]
    fn identical_states_are_no_drift() {
        let m = deployment();
        assert_eq!(three_way_diff(&m, &m, &m), DriftOutcome::NoDrift);
    }

    #[test]
    fn desired_change_is_a_git_change() {
        let last = deployment();
        let mut desired = deployment();
        desired["spec"]["template"]["spec"]["containers"][0]["image"] = json!("web:2.0.0");
        let outcome = three_way_diff(&last, &desired, &last);
        assert!(matches!(outcome, DriftOutcome::GitChange { .. }));
    }

    #[test]
    fn live_change_is_manual_drift() {
        let last = deployment();
        let mut live = deployment();
        live["spec"]["template"]["spec"]["containers"][0]["image"] = json!("web:hacked");
        let outcome = three_way_diff(&last, &last, &live);
        match outcome {
            DriftOutcome::ManualDrift { expected, actual } => {
                assert_ne!(expected, actual);
            }
            other => panic!("expected manual drift, got {other:?}"),
        }
    }

    #[test]
    fn both_changed_is_a_conflict() {
        let last = deployment();
        let mut desired = deployment();
        desired["spec"]["template"]["spec"]["containers"][0]["image"] = json!("web:2.0.0");
        let mut live = deployment();
        live["spec"]["template"]["spec"]["containers"][0]["image"] = json!("web:hacked");
        assert!(matches!(
            three_way_diff(&last, &desired, &live),
            DriftOutcome::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn verify_detects_manual_drift_against_live_state() {
        let cache = Cache::new();
        let kube = MockKubeClient::new();
        let desired = deployment();

        cache.put_last_applied("drifted-svc", &resource_key(&desired, "default"), desired.clone());
        let mut hacked = deployment();
        hacked["spec"]["template"]["spec"]["containers"][0]["image"] = json!("drifted-svc:hacked");
        kube.put_resource(hacked, "default");

        let outcome = verify_manifest(&cache, &kube, "drifted-svc", &desired, "default")
            .await
            .unwrap();
        assert!(matches!(outcome, DriftOutcome::ManualDrift { .. }));
    }

    #[tokio::test]
    async fn verify_classifies_missing_states() {
        let cache = Cache::new();
        let kube = MockKubeClient::new();
        let desired = deployment();

        // Neither cached nor live.
        let outcome = verify_manifest(&cache, &kube, "web", &desired, "default")
            .await
            .unwrap();
        assert_eq!(outcome, DriftOutcome::NewResource);

        // Live but never recorded.
        kube.put_resource(desired.clone(), "default");
        let outcome = verify_manifest(&cache, &kube, "web", &desired, "default")
            .await
            .unwrap();
        assert_eq!(outcome, DriftOutcome::NeedsApply);

        // Recorded but the live resource vanished.
        let cache2 = Cache::new();
        let kube2 = MockKubeClient::new();
        cache2.put_last_applied("web", &resource_key(&desired, "default"), desired.clone());
        let outcome = verify_manifest(&cache2, &kube2, "web", &desired, "default")
            .await
            .unwrap();
        assert_eq!(outcome, DriftOutcome::NewResource);
    }
}
