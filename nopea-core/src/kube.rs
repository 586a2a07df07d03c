//! The K8s collaborator interface the core consumes, plus the in-memory
//! mock used for local mode and tests. Real clients live outside this crate
//! and are injected wholesale.

use async_trait::async_trait;
use nopea_shared::DeployError;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tokio::sync::watch;

/// Classified failure from the K8s collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KubeError {
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("timeout")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("apply failed: {0}")]
    ApplyFailed(String),
}

impl From<KubeError> for DeployError {
    fn from(e: KubeError) -> Self {
        match e {
            KubeError::Forbidden => DeployError::Forbidden,
            KubeError::NotFound => DeployError::NotFound,
            KubeError::Timeout => DeployError::Timeout,
            KubeError::ConnectionRefused => DeployError::ConnectionRefused,
            KubeError::ApplyFailed(message) => DeployError::ApplyFailed { message },
        }
    }
}

/// What the deploy core needs from a K8s client. Calls may block for
/// seconds; they are the only long-running operations on the critical path.
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Server-side apply of a batch, in order. Returns the applied manifests.
    async fn apply_manifests(
        &self,
        manifests: &[serde_json::Value],
        namespace: &str,
    ) -> Result<Vec<serde_json::Value>, KubeError>;

    /// Server-side apply of a single manifest.
    async fn apply_manifest(
        &self,
        manifest: &serde_json::Value,
        namespace: &str,
    ) -> Result<serde_json::Value, KubeError>;

    async fn get_resource(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<serde_json::Value, KubeError>;

    async fn delete_resource(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), KubeError>;
}

/// In-memory cluster double. Applied manifests are stored under
/// `{kind}/{namespace}/{name}` and returned by `get_resource`; tests can
/// inject failures, hold applies open, and inspect the apply log.
#[derive(Default)]
pub struct MockKubeClient {
    resources: RwLock<HashMap<String, serde_json::Value>>,
    applied_log: Mutex<Vec<serde_json::Value>>,
    fail_with: Mutex<Option<KubeError>>,
    fail_get_with: Mutex<Option<KubeError>>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MockKubeClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(manifest: &serde_json::Value, namespace: &str) -> String {
        crate::cache::resource_key(manifest, namespace)
    }

    /// Every manifest applied so far, in order.
    pub fn applied(&self) -> Vec<serde_json::Value> {
        self.applied_log.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Fails the next apply/get with the given error, once.
    pub fn fail_next(&self, error: KubeError) {
        if let Ok(mut slot) = self.fail_with.lock() {
            *slot = Some(error);
        }
    }

    /// Fails only the next `get_resource` with the given error, once.
    /// Applies are unaffected.
    pub fn fail_next_get(&self, error: KubeError) {
        if let Ok(mut slot) = self.fail_get_with.lock() {
            *slot = Some(error);
        }
    }

    /// Pre-seeds a live resource, bypassing the apply log.
    pub fn put_resource(&self, manifest: serde_json::Value, namespace: &str) {
        if let Ok(mut resources) = self.resources.write() {
            resources.insert(Self::key(&manifest, namespace), manifest);
        }
    }

    /// Holds all applies open until the returned sender flips to `false`
    /// (or is dropped). Models a slow cluster.
    pub fn hold_applies(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(true);
        if let Ok(mut gate) = self.gate.lock() {
            *gate = Some(rx);
        }
        tx
    }

    async fn wait_gate(&self) {
        let rx = self.gate.lock().ok().and_then(|g| g.clone());
        if let Some(mut rx) = rx {
            while *rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn take_failure(&self) -> Option<KubeError> {
        self.fail_with.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl KubeClient for MockKubeClient {
    async fn apply_manifests(
        &self,
        manifests: &[serde_json::Value],
        namespace: &str,
    ) -> Result<Vec<serde_json::Value>, KubeError> {
        self.wait_gate().await;
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let mut applied = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            applied.push(self.apply_one(manifest, namespace));
        }
        Ok(applied)
    }

    async fn apply_manifest(
        &self,
        manifest: &serde_json::Value,
        namespace: &str,
    ) -> Result<serde_json::Value, KubeError> {
        self.wait_gate().await;
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        Ok(self.apply_one(manifest, namespace))
    }

    async fn get_resource(
        &self,
        _api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<serde_json::Value, KubeError> {
        if let Some(e) = self.fail_get_with.lock().ok().and_then(|mut s| s.take()) {
            return Err(e);
        }
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let key = format!("{kind}/{namespace}/{name}");
        self.resources
            .read()
            .ok()
            .and_then(|r| r.get(&key).cloned())
            .ok_or(KubeError::NotFound)
    }

    async fn delete_resource(
        &self,
        _api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<(), KubeError> {
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let key = format!("{kind}/{namespace}/{name}");
        let removed = self
            .resources
            .write()
            .ok()
            .and_then(|mut r| r.remove(&key));
        match removed {
            Some(_) => Ok(()),
            None => Err(KubeError::NotFound),
        }
    }
}

impl MockKubeClient {
    fn apply_one(&self, manifest: &serde_json::Value, namespace: &str) -> serde_json::Value {
        if let Ok(mut log) = self.applied_log.lock() {
            log.push(manifest.clone());
        }
        if let Ok(mut resources) = self.resources.write() {
            resources.insert(Self::key(manifest, namespace), manifest.clone());
        }
        manifest.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name}
        })
    }

    #[tokio::test]
    async fn applied_manifests_become_gettable() {
        let kube = MockKubeClient::new();
        kube.apply_manifests(&[deployment("web")], "prod")
            .await
            .unwrap();
        let live = kube
            .get_resource("apps/v1", "Deployment", "web", "prod")
            .await
            .unwrap();
        assert_eq!(live["metadata"]["name"], "web");
        assert_eq!(kube.applied().len(), 1);
    }

    #[tokio::test]
    async fn missing_resource_is_a_not_found() {
        let kube = MockKubeClient::new();
        let err = kube
            .get_resource("apps/v1", "Deployment", "ghost", "prod")
            .await
            .unwrap_err();
        assert_eq!(err, KubeError::NotFound);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let kube = MockKubeClient::new();
        kube.fail_next(KubeError::Forbidden);
        let err = kube
            .apply_manifests(&[deployment("web")], "prod")
            .await
            .unwrap_err();
        assert_eq!(err, KubeError::Forbidden);
        assert!(kube.apply_manifests(&[deployment("web")], "prod").await.is_ok());
    }

    #[tokio::test]
    async fn held_applies_wait_for_release() {
        let kube = std::sync::Arc::new(MockKubeClient::new());
        let release = kube.hold_applies();

        let worker = {
            let kube = std::sync::Arc::clone(&kube);
            tokio::spawn(async move { kube.apply_manifests(&[deployment("web")], "prod").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!worker.is_finished(), "apply should be held open");

        release.send(false).ok();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn delete_removes_the_resource() {
        let kube = MockKubeClient::new();
        kube.apply_manifest(&deployment("web"), "prod").await.unwrap();
        kube.delete_resource("apps/v1", "Deployment", "web", "prod")
            .await
            .unwrap();
        assert_eq!(
            kube.get_resource("apps/v1", "Deployment", "web", "prod")
                .await
                .unwrap_err(),
            KubeError::NotFound
        );
    }
}
