//! nopea entry point: deploy CLI plus the HTTP API and the JSON-RPC tool
//! server, all over one shared application context.

mod http;
mod rpc;

use clap::{Parser, Subcommand};
use nopea_core::{AgentSupervisor, Cache, CdEventsEmitter, MockKubeClient, Orchestrator};
use nopea_memory::{MemoryHandle, MemoryService, SnapshotStore};
use nopea_shared::{DeploySpec, NopeaConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nopea", version, about = "Kubernetes deploy orchestrator that learns from history")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a deploy.
    Deploy {
        /// JSON file holding a deploy spec or a manifest array.
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,
        #[arg(short = 's', long)]
        service: Option<String>,
        #[arg(short = 'n', long)]
        namespace: Option<String>,
        /// direct | canary | blue_green (unknown values fall back to direct).
        #[arg(long)]
        strategy: Option<String>,
    },
    /// Show the agent status for a service.
    Status {
        service: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the deploy-memory context for a service.
    Context {
        service: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the deploy history of a service.
    History {
        service: String,
        #[arg(long)]
        json: bool,
    },
    /// Show knowledge-graph statistics.
    Memory {
        #[arg(long)]
        json: bool,
    },
    /// Start the HTTP API and serve indefinitely.
    Serve,
    /// Serve the JSON-RPC tool interface over stdio lines.
    Rpc,
}

/// Shared application context for every surface.
pub struct App {
    pub config: NopeaConfig,
    pub cache: Arc<Cache>,
    pub memory: MemoryHandle,
    pub orchestrator: Arc<Orchestrator>,
    pub supervisor: AgentSupervisor,
}

impl App {
    pub fn build(config: NopeaConfig) -> Arc<Self> {
        let cache = Arc::new(Cache::new());
        let memory = MemoryService::spawn(Arc::clone(&cache) as Arc<dyn SnapshotStore>);

        if config.k8s_mode != "mock" {
            tracing::warn!(
                target: "nopea::gateway",
                mode = %config.k8s_mode,
                "no external K8s client registered for this mode; using the in-memory mock"
            );
        }
        let kube = Arc::new(MockKubeClient::new());

        let mut orchestrator = Orchestrator::new(kube, Arc::clone(&cache))
            .with_memory(memory.clone())
            .with_canary_threshold(config.canary_confidence_threshold)
            .with_state_dir(config.state_dir.as_str());
        if let Some(endpoint) = &config.cdevents_endpoint {
            tracing::info!(target: "nopea::gateway", endpoint = %endpoint, "CDEvents emission enabled");
            orchestrator = orchestrator.with_cdevents(CdEventsEmitter::new(endpoint.clone()));
        }
        let orchestrator = Arc::new(orchestrator);

        if config.cluster_enabled {
            tracing::info!(
                target: "nopea::gateway",
                "cluster mode requested; running single-node (registry replication not configured)"
            );
        }

        let supervisor = AgentSupervisor::with_idle_timeout(
            Arc::clone(&orchestrator),
            Arc::clone(&cache),
            Duration::from_secs(config.agent_idle_timeout_secs),
        );

        Arc::new(Self {
            config,
            cache,
            memory,
            orchestrator,
            supervisor,
        })
    }
}

/// Builds a deploy spec from an optional JSON file plus CLI overrides.
/// The file may be a full spec object or a bare manifest array.
fn spec_from_args(
    file: Option<&PathBuf>,
    service: Option<String>,
    namespace: Option<String>,
    strategy: Option<String>,
) -> Result<DeploySpec, String> {
    let mut spec = match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).map_err(|e| format!("invalid JSON in deploy file: {e}"))?;
            match value {
                serde_json::Value::Array(manifests) => {
                    let mut spec = DeploySpec::new("");
                    spec.manifests = manifests;
                    spec
                }
                object => serde_json::from_value(object.clone()).or_else(|_| {
                    // An object without a service is still usable when -s is
                    // given; treat it as a single manifest.
                    Ok::<DeploySpec, String>(DeploySpec::new("").with_manifests(vec![object]))
                })?,
            }
        }
        None => DeploySpec::new(""),
    };

    if let Some(service) = service {
        spec.service = service;
    }
    if let Some(namespace) = namespace {
        spec.namespace = namespace;
    }
    if let Some(strategy) = strategy {
        spec.strategy = Some(nopea_core::orchestrator::parse_strategy_lenient(&strategy));
    }
    if spec.service.trim().is_empty() {
        return Err("a service name is required (use -s or put \"service\" in the file)".to_string());
    }
    Ok(spec)
}

fn print_value(value: &serde_json::Value, json: bool) {
    if json {
        println!("{}", serde_json::to_string(value).unwrap_or_default());
    } else {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = match NopeaConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config load failed: {e}");
            std::process::exit(1);
        }
    };
    let app = App::build(config);

    let exit = run_command(cli.command, app).await;
    std::process::exit(exit);
}

async fn run_command(command: Command, app: Arc<App>) -> i32 {
    match command {
        Command::Deploy {
            file,
            service,
            namespace,
            strategy,
        } => {
            let spec = match spec_from_args(file.as_ref(), service, namespace, strategy) {
                Ok(spec) => spec,
                Err(e) => {
                    eprintln!("{e}");
                    return 1;
                }
            };
            let service = spec.service.clone();
            let result = app.supervisor.deploy(&service, spec).await;
            let ok = result.status == nopea_shared::DeployStatus::Completed;
            print_value(&serde_json::to_value(&result).unwrap_or_default(), false);
            if ok {
                0
            } else {
                1
            }
        }
        Command::Status { service, json } => match app.supervisor.status(&service).await {
            Some(status) => {
                print_value(&serde_json::to_value(&status).unwrap_or_default(), json);
                0
            }
            None => match app.cache.get_service_state(&service) {
                Some(state) => {
                    print_value(&serde_json::to_value(&state).unwrap_or_default(), json);
                    0
                }
                None => {
                    eprintln!("not_found: no agent or state for '{service}'");
                    1
                }
            },
        },
        Command::Context {
            service,
            namespace,
            json,
        } => {
            let namespace = namespace.unwrap_or_else(|| "default".to_string());
            let context = app.memory.get_deploy_context(&service, &namespace).await;
            print_value(&serde_json::to_value(&context).unwrap_or_default(), json);
            0
        }
        Command::History { service, json } => {
            let deployments = app.cache.list_deployments(&service);
            let value = serde_json::json!({
                "service": service,
                "deployments": deployments,
            });
            print_value(&value, json);
            0
        }
        Command::Memory { json } => {
            let stats = app.memory.stats().await;
            let value = serde_json::json!({
                "nodes": stats.nodes,
                "relationships": stats.relationships,
            });
            print_value(&value, json);
            0
        }
        Command::Serve => {
            let port = app.config.api_port;
            match http::serve(app, port).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("http server failed: {e}");
                    1
                }
            }
        }
        Command::Rpc => {
            rpc::serve_stdio(app).await;
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_requires_a_service() {
        assert!(spec_from_args(None, None, None, None).is_err());
        let spec = spec_from_args(None, Some("web".to_string()), None, None).unwrap();
        assert_eq!(spec.service, "web");
        assert_eq!(spec.namespace, "default");
    }

    #[test]
    fn manifest_array_file_becomes_a_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(
            &path,
            r#"[{"kind": "ConfigMap", "metadata": {"name": "c"}}]"#,
        )
        .unwrap();
        let spec = spec_from_args(
            Some(&path),
            Some("web".to_string()),
            Some("prod".to_string()),
            Some("canary".to_string()),
        )
        .unwrap();
        assert_eq!(spec.manifests.len(), 1);
        assert_eq!(spec.namespace, "prod");
        assert_eq!(spec.strategy, Some(nopea_shared::Strategy::Canary));
    }

    #[test]
    fn full_spec_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        std::fs::write(
            &path,
            r#"{"service": "web", "namespace": "prod", "manifests": []}"#,
        )
        .unwrap();
        let spec = spec_from_args(Some(&path), None, None, None).unwrap();
        assert_eq!(spec.service, "web");
        assert_eq!(spec.namespace, "prod");
    }

    #[test]
    fn unknown_strategy_flag_coerces_to_direct() {
        let spec = spec_from_args(None, Some("web".to_string()), None, Some("yolo".to_string()))
            .unwrap();
        assert_eq!(spec.strategy, Some(nopea_shared::Strategy::Direct));
    }
}
