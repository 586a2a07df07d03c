//! Shared types used across all nopea crates.

mod config;
mod error;
pub mod id;
mod types;

pub use config::NopeaConfig;
pub use error::DeployError;
pub use types::{
    ActiveSlot, DeployOptions, DeployOutcome, DeployResult, DeploySpec, DeployStatus, Strategy,
    DEFAULT_CANARY_STEPS, DEFAULT_NAMESPACE, DEFAULT_TIMEOUT_MS,
};
