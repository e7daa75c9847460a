//! The configuration document: Argobots substrate and transport setup
//! in a single document, parsed as JSON or YAML via `serde_json` +
//! `serde_yaml`.

mod validate;

pub use validate::{validate, ConfigError};

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_progress_pool() -> String {
    "__primary__".to_string()
}
fn default_rpc_pool() -> String {
    "__primary__".to_string()
}
fn default_timeout_ub() -> u64 {
    100
}
fn default_handle_cache_size() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MargoConfig {
    #[serde(default = "default_progress_pool")]
    pub progress_pool: String,
    #[serde(default = "default_rpc_pool")]
    pub rpc_pool: String,
    #[serde(default = "default_timeout_ub")]
    pub progress_timeout_ub_msec: u64,
    #[serde(default)]
    pub progress_spindown_msec: u64,
    #[serde(default = "default_handle_cache_size")]
    pub handle_cache_size: usize,
    #[serde(default)]
    pub enable_abt_profiling: bool,
    #[serde(default)]
    pub mercury: MercuryConfig,
    #[serde(default)]
    pub argobots: ArgobotsConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Default for MargoConfig {
    fn default() -> Self {
        Self {
            progress_pool: default_progress_pool(),
            rpc_pool: default_rpc_pool(),
            progress_timeout_ub_msec: default_timeout_ub(),
            progress_spindown_msec: 0,
            handle_cache_size: default_handle_cache_size(),
            enable_abt_profiling: false,
            mercury: MercuryConfig::default(),
            argobots: ArgobotsConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgobotsConfig {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub xstreams: Vec<XstreamConfig>,
    pub abt_mem_max_num_stacks: Option<usize>,
    pub abt_thread_stacksize: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub kind: PoolKindConfig,
    #[serde(default)]
    pub access: AccessConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKindConfig {
    #[default]
    #[serde(rename = "blocking-FIFO")]
    BlockingFifo,
    #[serde(rename = "FIFO")]
    Fifo,
    RandomWorkStealing,
    PriorityBlocking,
    External,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessConfig {
    Private,
    Spsc,
    Mpsc,
    Spmc,
    #[default]
    Mpmc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XstreamConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub cpubind: Option<i32>,
    #[serde(default)]
    pub affinity: Vec<i32>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(rename = "type", default)]
    pub kind: SchedulerKind,
    #[serde(default)]
    pub pools: Vec<PoolRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Default,
    Basic,
    Prio,
    Randws,
    #[default]
    BasicWait,
}

/// A pool reference by index into `argobots.pools` or by name —
/// order in a scheduler's `pools` list is significant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoolRef {
    Index(usize),
    Name(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MercuryConfig {
    pub address: Option<String>,
    #[serde(default)]
    pub listening: bool,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl MargoConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("reading {}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Reads `MARGO_CONFIG_PATH` if set, else the default.
    pub fn from_env_or_default() -> Result<Self, ConfigError> {
        match std::env::var("MARGO_CONFIG_PATH") {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }
}
