//! Structured post-deploy report artifacts, persisted per deploy.

use nopea_memory::DeployContext;
use nopea_shared::{DeployResult, DeployStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};

const OCCURRENCE_VERSION: &str = "1.0";
const SOURCE: &str = "nopea";

/// Binary envelope for the warm-path artifact file.
#[derive(Serialize, Deserialize)]
struct OccurrenceRecord {
    schema: u32,
    id: String,
    /// Compact JSON encoding of the occurrence map.
    json: Vec<u8>,
}

fn severity(status: DeployStatus) -> &'static str {
    match status {
        DeployStatus::Completed => "info",
        DeployStatus::Failed => "error",
        DeployStatus::Rolledback => "warning",
    }
}

fn history(result: &DeployResult) -> serde_json::Value {
    let mut steps = Vec::new();
    match result.status {
        DeployStatus::Completed => {
            steps.push(json!({
                "step": "apply manifests",
                "status": "completed",
                "duration_ms": result.duration_ms,
            }));
            if result.verified {
                steps.push(json!({
                    "step": "post-deploy verification",
                    "status": "passed",
                }));
            }
        }
        DeployStatus::Failed | DeployStatus::Rolledback => {
            let mut step = json!({
                "step": "apply manifests",
                "status": "failed",
                "duration_ms": result.duration_ms,
            });
            if let Some(error) = &result.error {
                step["error"] = json!(error.to_string());
            }
            steps.push(step);
            if result.status == DeployStatus::Rolledback {
                steps.push(json!({
                    "step": "rollback",
                    "status": "completed",
                }));
            }
        }
    }
    json!({
        "steps": steps,
        "duration_ms": result.duration_ms,
    })
}

/// Builds the occurrence map from a deploy result and, when available, the
/// memory context the orchestrator used.
pub fn build_occurrence(
    result: &DeployResult,
    context: Option<&DeployContext>,
) -> serde_json::Value {
    let id = nopea_shared::id::next();
    let mut occurrence = json!({
        "version": OCCURRENCE_VERSION,
        "id": id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "source": SOURCE,
        "type": format!("deploy.run.{}", result.status),
        "severity": severity(result.status),
        "outcome": result.status.as_str(),
        "history": history(result),
        "deploy_data": {
            "service": result.service,
            "namespace": result.namespace,
            "strategy": result.strategy.as_str(),
            "manifests_applied": result.manifest_count,
            "verified": result.verified,
            "deploy_id": result.deploy_id,
        },
    });

    if result.status != DeployStatus::Completed {
        let tag = result
            .error
            .as_ref()
            .map(|e| e.tag())
            .unwrap_or("unknown");
        let mut error_block = json!({
            "code": tag,
            "what_failed": format!("deploy of {} ({})", result.service, result.strategy),
            "why_it_matters": format!(
                "{} in {} is not updated — the desired state was not reached",
                result.service, result.namespace
            ),
        });
        if let Some(error) = &result.error {
            error_block["message"] = json!(error.to_string());
        }
        occurrence["error"] = error_block;

        let known = context.map(|c| c.known).unwrap_or(false);
        let mut reasoning = json!({
            "summary": format!("deploy failed with '{tag}'"),
            "confidence": if known { 0.8 } else { 0.3 },
        });
        if let Some(ctx) = context {
            if known {
                reasoning["memory_context"] = json!({
                    "failure_patterns": ctx.failure_patterns,
                    "dependencies": ctx.dependencies,
                });
            }
            if !ctx.recommendations.is_empty() {
                reasoning["recommendations"] = json!(ctx.recommendations);
            }
        }
        occurrence["reasoning"] = reasoning;
    }

    occurrence
}

fn artifact_root(state_dir: &Path) -> PathBuf {
    state_dir.join(".nopea")
}

/// Persists the occurrence: pretty JSON at `.nopea/occurrence.json` (most
/// recent) and a binary record at `.nopea/occurrences/{id}.etf`.
pub fn persist_occurrence(state_dir: &Path, occurrence: &serde_json::Value) -> std::io::Result<()> {
    let root = artifact_root(state_dir);
    let warm_dir = root.join("occurrences");
    std::fs::create_dir_all(&warm_dir)?;

    let pretty = serde_json::to_vec_pretty(occurrence)?;
    std::fs::write(root.join("occurrence.json"), pretty)?;

    let id = occurrence
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let record = OccurrenceRecord {
        schema: 1,
        id: id.clone(),
        json: serde_json::to_vec(occurrence)?,
    };
    let encoded = bincode::serialize(&record)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(warm_dir.join(format!("{id}.etf")), encoded)?;
    Ok(())
}

/// Reads back the most recent warm-path artifact for explain-style queries.
/// Returns the decoded occurrence maps, newest first.
pub fn read_occurrences(state_dir: &Path) -> Vec<serde_json::Value> {
    let warm_dir = artifact_root(state_dir).join("occurrences");
    let Ok(entries) = std::fs::read_dir(&warm_dir) else {
        return Vec::new();
    };
    let mut names: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("etf"))
        .collect();
    names.sort();
    names.reverse();
    names
        .into_iter()
        .filter_map(|path| {
            let bytes = std::fs::read(&path).ok()?;
            let record: OccurrenceRecord = bincode::deserialize(&bytes).ok()?;
            serde_json::from_slice(&record.json).ok()
        })
        .collect()
}
