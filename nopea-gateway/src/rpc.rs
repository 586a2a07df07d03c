//! JSON-RPC 2.0 tool server over newline-delimited stdio.
//!
//! Exposes the deploy core as callable tools: `nopea_deploy`,
//! `nopea_context`, `nopea_history`, `nopea_health`, `nopea_explain`.

use crate::App;
use nopea_shared::DeploySpec;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const PROTOCOL_VERSION: &str = "2024-11-05";

const ERR_METHOD_NOT_FOUND: i64 = -32601;
const ERR_TOOL: i64 = -32602;
const ERR_PARSE: i64 = -32700;

/// Reads newline-delimited requests from stdin and writes responses to
/// stdout until EOF. Notifications get no response.
pub async fn serve_stdio(app: Arc<App>) {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(stdin);
    let mut line = String::new();

    tracing::info!(target: "nopea::rpc", "tool server listening on stdio");
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(target: "nopea::rpc", error = %e, "stdin read failed");
                break;
            }
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(response) = dispatch_message(&app, trimmed).await {
            let mut bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
            bytes.push(b'\n');
            if stdout.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    }
}

/// Parses and dispatches one message. Returns None for notifications.
pub async fn dispatch_message(app: &Arc<App>, raw: &str) -> Option<Value> {
    let request: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            return Some(error_response(
                Value::Null,
                ERR_PARSE,
                format!("parse error: {e}"),
            ));
        }
    };

    let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = request.get("id").cloned();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    // Notifications carry no id and expect no response.
    if method.starts_with("notifications/") {
        return None;
    }
    let id = id.unwrap_or(Value::Null);

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {
                "name": "nopea",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        })),
        "tools/list" => Ok(json!({ "tools": tool_descriptors() })),
        "tools/call" => call_tool(app, &params).await,
        other => Err((ERR_METHOD_NOT_FOUND, format!("unknown method: {other}"))),
    };

    Some(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
        Err((code, message)) => error_response(id, code, message),
    })
}

fn error_response(id: Value, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

fn tool_descriptors() -> Vec<Value> {
    vec![
        json!({
            "name": "nopea_deploy",
            "description": "Deploy a service to Kubernetes. Strategy is auto-selected from deploy history when omitted.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "service": {"type": "string"},
                    "namespace": {"type": "string"},
                    "manifests": {"type": "array"},
                    "strategy": {"type": "string", "enum": ["direct", "canary", "blue_green"]},
                },
                "required": ["service"],
            },
        }),
        json!({
            "name": "nopea_context",
            "description": "Deploy-memory context for a service: failure patterns, dependencies, recommendations.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "service": {"type": "string"},
                    "namespace": {"type": "string"},
                },
                "required": ["service"],
            },
        }),
        json!({
            "name": "nopea_history",
            "description": "Deploy history of a service.",
            "inputSchema": {
                "type": "object",
                "properties": { "service": {"type": "string"} },
                "required": ["service"],
            },
        }),
        json!({
            "name": "nopea_health",
            "description": "Status of every live service agent.",
            "inputSchema": { "type": "object", "properties": {} },
        }),
        json!({
            "name": "nopea_explain",
            "description": "Most recent post-deploy report, optionally filtered by service.",
            "inputSchema": {
                "type": "object",
                "properties": { "service": {"type": "string"} },
            },
        }),
    ]
}

async fn call_tool(app: &Arc<App>, params: &Value) -> Result<Value, (i64, String)> {
    let name = params
        .get("name")
        .and_then(|n| n.as_str())
        .ok_or_else(|| (ERR_TOOL, "missing tool name".to_string()))?;
    let args = params.get("arguments").cloned().unwrap_or(json!({}));

    let text = match name {
        "nopea_deploy" => run_deploy(app, &args).await?,
        "nopea_context" => {
            let service = required_str(&args, "service")?;
            let namespace = args
                .get("namespace")
                .and_then(|v| v.as_str())
                .unwrap_or("default");
            let context = app.memory.get_deploy_context(&service, namespace).await;
            serde_json::to_string_pretty(&context).unwrap_or_default()
        }
        "nopea_history" => {
            let service = required_str(&args, "service")?;
            let deployments = app.cache.list_deployments(&service);
            if deployments.is_empty() {
                format!("no recorded deploys for '{service}'")
            } else {
                deployments
                    .iter()
                    .map(|d| {
                        format!(
                            "{} {} strategy={} duration={}ms verified={}",
                            d.deploy_id, d.status, d.strategy, d.duration_ms, d.verified
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "nopea_health" => {
            let agents = app.supervisor.health().await;
            if agents.is_empty() {
                "no live agents".to_string()
            } else {
                serde_json::to_string_pretty(&agents).unwrap_or_default()
            }
        }
        "nopea_explain" => explain(app, &args),
        other => return Err((ERR_TOOL, format!("unknown tool: {other}"))),
    };

    Ok(json!({
        "content": [{ "type": "text", "text": text }],
    }))
}

fn required_str(args: &Value, key: &str) -> Result<String, (i64, String)> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| (ERR_TOOL, format!("'{key}' is required")))
}

async fn run_deploy(app: &Arc<App>, args: &Value) -> Result<String, (i64, String)> {
    let service = required_str(args, "service")?;
    let mut spec = DeploySpec::new(&service);
    if let Some(namespace) = args.get("namespace").and_then(|v| v.as_str()) {
        spec.namespace = namespace.to_string();
    }
    if let Some(manifests) = args.get("manifests").and_then(|v| v.as_array()) {
        spec.manifests = manifests.clone();
    }
    if let Some(strategy) = args.get("strategy").and_then(|v| v.as_str()) {
        spec.strategy = Some(nopea_core::orchestrator::parse_strategy_lenient(strategy));
    }

    let result = app.supervisor.deploy(&service, spec).await;
    let mut text = format!(
        "deploy {}: {} ({} strategy, {} manifests, {}ms, verified={})",
        result.deploy_id,
        result.status,
        result.strategy,
        result.manifest_count,
        result.duration_ms,
        result.verified,
    );
    if let Some(error) = &result.error {
        text.push_str(&format!("\nerror: {error}"));
    }
    Ok(text)
}

fn explain(app: &Arc<App>, args: &Value) -> String {
    let service = args.get("service").and_then(|v| v.as_str());
    let occurrences = nopea_core::occurrence::read_occurrences(Path::new(&app.config.state_dir));
    let found = occurrences.into_iter().find(|occ| match service {
        Some(service) => occ["deploy_data"]["service"].as_str() == Some(service),
        None => true,
    });
    match found {
        Some(occ) => serde_json::to_string_pretty(&occ).unwrap_or_default(),
        None => "no deploy reports recorded yet".to_string(),
    }
}
