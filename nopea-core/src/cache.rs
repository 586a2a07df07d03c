//! Process-wide in-memory cache: four keyed tables with single-writer-per-key
//! discipline. Reads are cheap clones; writes are unconditional.

use nopea_memory::SnapshotStore;
use nopea_shared::DeployResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Persisted agent view of a service, used to recover continuity across
/// agent restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    pub service: String,
    pub deploy_count: u64,
    #[serde(default)]
    pub last_result: Option<DeployResult>,
    /// ISO-8601 UTC time of the last update.
    pub updated_at: String,
}

/// Builds the `{kind}/{namespace}/{name}` key for the last-applied table.
/// Falls back to `default_namespace` when the manifest carries none.
pub fn resource_key(manifest: &serde_json::Value, default_namespace: &str) -> String {
    let kind = manifest
        .get("kind")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown");
    let metadata = manifest.get("metadata");
    let namespace = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .unwrap_or(default_namespace);
    let name = metadata
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("unnamed");
    format!("{kind}/{namespace}/{name}")
}

/// The four cache tables. Constructed once at component start and shared
/// behind an `Arc`.
#[derive(Default)]
pub struct Cache {
    deployments: RwLock<HashMap<(String, String), DeployResult>>,
    service_state: RwLock<HashMap<String, ServiceState>>,
    graph_snapshot: RwLock<Option<Vec<u8>>>,
    last_applied: RwLock<HashMap<(String, String), serde_json::Value>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once all four tables are initialized (always, after construction).
    pub fn available(&self) -> bool {
        true
    }

    pub fn put_deployment(&self, result: DeployResult) {
        if let Ok(mut table) = self.deployments.write() {
            table.insert((result.service.clone(), result.deploy_id.clone()), result);
        }
    }

    pub fn get_deployment(&self, service: &str, deploy_id: &str) -> Option<DeployResult> {
        self.deployments
            .read()
            .ok()?
            .get(&(service.to_string(), deploy_id.to_string()))
            .cloned()
    }

    /// All recorded deploys of a service, oldest first (identifiers sort
    /// chronologically).
    pub fn list_deployments(&self, service: &str) -> Vec<DeployResult> {
        let Ok(table) = self.deployments.read() else {
            return Vec::new();
        };
        let mut results: Vec<DeployResult> = table
            .iter()
            .filter(|((svc, _), _)| svc == service)
            .map(|(_, result)| result.clone())
            .collect();
        results.sort_by(|a, b| a.deploy_id.cmp(&b.deploy_id));
        results
    }

    pub fn put_service_state(&self, state: ServiceState) {
        if let Ok(mut table) = self.service_state.write() {
            table.insert(state.service.clone(), state);
        }
    }

    pub fn get_service_state(&self, service: &str) -> Option<ServiceState> {
        self.service_state.read().ok()?.get(service).cloned()
    }

    pub fn list_services(&self) -> Vec<String> {
        let Ok(table) = self.service_state.read() else {
            return Vec::new();
        };
        let mut services: Vec<String> = table.keys().cloned().collect();
        services.sort();
        services
    }

    pub fn put_last_applied(&self, service: &str, key: &str, manifest: serde_json::Value) {
        if let Ok(mut table) = self.last_applied.write() {
            table.insert((service.to_string(), key.to_string()), manifest);
        }
    }

    pub fn get_last_applied(&self, service: &str, key: &str) -> Option<serde_json::Value> {
        self.last_applied
            .read()
            .ok()?
            .get(&(service.to_string(), key.to_string()))
            .cloned()
    }
}

impl SnapshotStore for Cache {
    fn load_snapshot(&self) -> Option<Vec<u8>> {
        self.graph_snapshot.read().ok()?.clone()
    }

    fn store_snapshot(&self, bytes: Vec<u8>) {
        if let Ok(mut slot) = self.graph_snapshot.write() {
            *slot = Some(bytes);
        }
    }
}
