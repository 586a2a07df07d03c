//! Outbound CDEvents emission: fire-and-forget POSTs to a configured sink.

use nopea_shared::DeployStatus;
use serde_json::json;
use std::sync::Arc;

pub const DEPLOYMENT_STARTED: &str = "dev.cdevents.deployment.started.0.1.0";
pub const DEPLOYMENT_COMPLETED: &str = "dev.cdevents.deployment.completed.0.1.0";
pub const DEPLOYMENT_FAILED: &str = "dev.cdevents.deployment.failed.0.1.0";
pub const DEPLOYMENT_ROLLEDBACK: &str = "dev.cdevents.deployment.rolledback.0.1.0";
pub const SERVICE_DEPLOYED: &str = "dev.cdevents.service.deployed.0.3.0";
pub const SERVICE_UPGRADED: &str = "dev.cdevents.service.upgraded.0.3.0";

/// Maps a deploy status to its outcome event type.
pub fn outcome_event_type(status: DeployStatus) -> &'static str {
    match status {
        DeployStatus::Completed => DEPLOYMENT_COMPLETED,
        DeployStatus::Failed => DEPLOYMENT_FAILED,
        DeployStatus::Rolledback => DEPLOYMENT_ROLLEDBACK,
    }
}

/// Emits CDEvents to an HTTP sink. Emission is spawned and never awaited by
/// the deploy path; delivery failures are logged and dropped.
pub struct CdEventsEmitter {
    endpoint: String,
    client: reqwest::Client,
}

impl CdEventsEmitter {
    pub fn new(endpoint: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        })
    }

    /// Builds the CDEvents envelope for a deploy lifecycle event.
    fn envelope(event_type: &str, service: &str, deploy_id: &str) -> serde_json::Value {
        json!({
            "context": {
                "version": "0.4.1",
                "specversion": "1.0",
                "id": uuid::Uuid::new_v4().to_string(),
                "source": "nopea",
                "type": event_type,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "subject": {
                "id": service,
                "source": "nopea",
                "content": {
                    "deploy_id": deploy_id,
                }
            }
        })
    }

    pub fn emit(self: &Arc<Self>, event_type: &'static str, service: &str, deploy_id: &str) {
        let body = Self::envelope(event_type, service, deploy_id);
        let emitter = Arc::clone(self);
        let service = service.to_string();
        tokio::spawn(async move {
            let sent = emitter
                .client
                .post(&emitter.endpoint)
                .json(&body)
                .send()
                .await;
            match sent {
                Ok(resp) => tracing::debug!(
                    target: "nopea::cdevents",
                    service = %service,
                    event_type,
                    status = resp.status().as_u16(),
                    "event delivered"
                ),
                Err(e) => tracing::debug!(
                    target: "nopea::cdevents",
                    service = %service,
                    event_type,
                    error = %e,
                    "event delivery failed"
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_service_as_subject() {
        let v = CdEventsEmitter::envelope(DEPLOYMENT_STARTED, "web", "01ABC");
        assert_eq!(v["context"]["specversion"], "1.0");
        assert_eq!(v["context"]["type"], DEPLOYMENT_STARTED);
        assert_eq!(v["context"]["source"], "nopea");
        assert_eq!(v["subject"]["id"], "web");
        assert_eq!(v["subject"]["content"]["deploy_id"], "01ABC");
    }

    #[test]
    fn outcome_mapping_is_total() {
        assert_eq!(
            outcome_event_type(DeployStatus::Completed),
            DEPLOYMENT_COMPLETED
        );
        assert_eq!(outcome_event_type(DeployStatus::Failed), DEPLOYMENT_FAILED);
        assert_eq!(
            outcome_event_type(DeployStatus::Rolledback),
            DEPLOYMENT_ROLLEDBACK
        );
    }
}
