//! Global application configuration. Load from TOML or env.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the gateway and the deploy core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NopeaConfig {
    /// HTTP listener port for the API.
    pub api_port: u16,
    /// K8s collaborator selection: "mock" runs the in-memory client. Real
    /// client handles are injected programmatically by the embedding binary.
    pub k8s_mode: String,
    /// Optional CDEvents sink URL; enables async event emission when set.
    #[serde(default)]
    pub cdevents_endpoint: Option<String>,
    /// Enables registry/supervisor replication. Accepted and logged; the
    /// single-node behavior is identical.
    #[serde(default)]
    pub cluster_enabled: bool,
    /// Failure-pattern confidence above which an unset strategy is promoted
    /// to canary.
    pub canary_confidence_threshold: f64,
    /// Seconds an idle agent with an empty queue lingers before stopping.
    pub agent_idle_timeout_secs: u64,
    /// Base directory for persisted state (`{state_dir}/.nopea/`).
    pub state_dir: String,
}

impl Default for NopeaConfig {
    fn default() -> Self {
        Self {
            api_port: 4000,
            k8s_mode: "mock".to_string(),
            cdevents_endpoint: None,
            cluster_enabled: false,
            canary_confidence_threshold: 0.15,
            agent_idle_timeout_secs: 900,
            state_dir: ".".to_string(),
        }
    }
}

impl NopeaConfig {
    /// Load config from file and environment. Precedence: env `NOPEA_CONFIG`
    /// path > `config/nopea.toml` > defaults; `NOPEA__*` env vars override.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("NOPEA_CONFIG").unwrap_or_else(|_| "config/nopea".to_string());
        let builder = config::Config::builder()
            .set_default("api_port", 4000_i64)?
            .set_default("k8s_mode", "mock")?
            .set_default("cluster_enabled", false)?
            .set_default("canary_confidence_threshold", 0.15_f64)?
            .set_default("agent_idle_timeout_secs", 900_i64)?
            .set_default("state_dir", ".")?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("NOPEA").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}
