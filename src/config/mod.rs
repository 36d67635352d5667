pub mod cache;
pub mod identity;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::CapabilityKind;
use crate::topology::TopologyOptions;

pub use cache::ConfigCache;
pub use identity::{AgentIdentity, AgentRole};

pub const MAX_WORKERS: usize = 10;

static NON_ALNUM_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("Invalid project name regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HiveConfig {
    pub workspace: WorkspaceConfig,
    pub redis: RedisConfig,
    pub agents: AgentsConfig,
    pub monitoring: MonitoringConfig,
    pub host_mcps: HostMcpsConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    pub network: NetworkConfig,
    pub worktrees: WorktreesConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_prefix: Option<String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            name: "my-project".to_string(),
            container_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    /// Port published on the host for the shared store.
    pub port: u16,
    /// Namespace for every key and channel.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "redis".to_string(),
            port: 6380,
            key_prefix: "hive".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentsConfig {
    pub queen: QueenConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueenConfig {
    pub model: String,
    pub dockerfile: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

impl Default for QueenConfig {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            dockerfile: "docker/Dockerfile.node".to_string(),
            env: BTreeMap::new(),
            ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub model: String,
    pub dockerfile: String,
    pub poll_interval_seconds: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// "host:container" mappings; host ports shift by one per drone.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ports_per_drone: BTreeMap<usize, Vec<String>>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 2,
            model: "sonnet".to_string(),
            dockerfile: "docker/Dockerfile.node".to_string(),
            poll_interval_seconds: 1,
            env: BTreeMap::new(),
            ports: Vec::new(),
            ports_per_drone: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub interval_seconds: u64,
}

impl MonitorSettings {
    pub fn queen() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
        }
    }

    pub fn worker() -> Self {
        Self {
            enabled: true,
            interval_seconds: 1,
        }
    }
}

/// Monitor settings as written in `hive.yaml`; unset fields keep the role's
/// default.
#[derive(Debug, Default, Deserialize)]
struct PartialMonitorSettings {
    enabled: Option<bool>,
    interval_seconds: Option<u64>,
}

impl PartialMonitorSettings {
    fn over(self, base: MonitorSettings) -> MonitorSettings {
        MonitorSettings {
            enabled: self.enabled.unwrap_or(base.enabled),
            interval_seconds: self.interval_seconds.unwrap_or(base.interval_seconds),
        }
    }
}

fn queen_monitor<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<MonitorSettings, D::Error> {
    Ok(PartialMonitorSettings::deserialize(deserializer)?.over(MonitorSettings::queen()))
}

fn worker_monitor<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<MonitorSettings, D::Error> {
    Ok(PartialMonitorSettings::deserialize(deserializer)?.over(MonitorSettings::worker()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    #[serde(deserialize_with = "queen_monitor")]
    pub queen: MonitorSettings,
    #[serde(deserialize_with = "worker_monitor")]
    pub worker: MonitorSettings,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            queen: MonitorSettings::queen(),
            worker: MonitorSettings::worker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostMcpConfig {
    pub enabled: bool,
    /// Falls back to the kind's default port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Browser engine; only read for playwright.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    pub headless: bool,
}

impl Default for HostMcpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: None,
            browser: None,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostMcpsConfig {
    pub playwright: HostMcpConfig,
    pub ios: HostMcpConfig,
    pub clipboard: HostMcpConfig,
}

impl HostMcpsConfig {
    pub fn get(&self, kind: CapabilityKind) -> &HostMcpConfig {
        match kind {
            CapabilityKind::Playwright => &self.playwright,
            CapabilityKind::Ios => &self.ios,
            CapabilityKind::Clipboard => &self.clipboard,
        }
    }

    pub fn port(&self, kind: CapabilityKind) -> u16 {
        self.get(kind).port.unwrap_or_else(|| kind.default_port())
    }

    pub fn enabled_kinds(&self) -> Vec<CapabilityKind> {
        CapabilityKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).enabled)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreesConfig {
    /// Defaults to `~/hive-worktrees`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    pub branch_namespace: String,
}

impl Default for WorktreesConfig {
    fn default() -> Self {
        Self {
            root: None,
            branch_namespace: "hive".to_string(),
        }
    }
}

impl WorktreesConfig {
    pub fn resolved_root(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("hive-worktrees"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 18800,
        }
    }
}

impl HiveConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: HiveConfig = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Falls back to defaults when the file is missing or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Ignoring {} and using defaults: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace.name.trim().is_empty() {
            return Err(ConfigError::Invalid("workspace.name is required".to_string()));
        }
        if self.redis.port < 1024 {
            return Err(ConfigError::Invalid(
                "redis.port must be between 1024 and 65535".to_string(),
            ));
        }
        if self.agents.workers.count > MAX_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "agents.workers.count must be at most {}",
                MAX_WORKERS
            )));
        }
        if self.redis.key_prefix.is_empty() || self.redis.key_prefix.contains(':') {
            return Err(ConfigError::Invalid(
                "redis.key_prefix must be non-empty and must not contain ':'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn container_prefix(&self) -> String {
        match &self.workspace.container_prefix {
            Some(prefix) if !prefix.is_empty() => prefix.clone(),
            _ => sanitize_project_name(&self.workspace.name),
        }
    }

    /// Drone identities for the configured worker count: `drone-1..drone-n`.
    pub fn drone_names(&self) -> Vec<String> {
        (1..=self.agents.workers.count)
            .map(|i| format!("drone-{}", i))
            .collect()
    }

    /// Variables written to `.env.generated` for the container runtime.
    pub fn generate_env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("WORKSPACE_NAME".to_string(), self.workspace.name.clone());
        if !self.agents.queen.model.is_empty() {
            env.insert("QUEEN_MODEL".to_string(), self.agents.queen.model.clone());
        }
        if !self.agents.workers.model.is_empty() {
            env.insert("WORKER_MODEL".to_string(), self.agents.workers.model.clone());
        }
        if self.agents.workers.poll_interval_seconds > 0 {
            env.insert(
                "POLL_INTERVAL".to_string(),
                self.agents.workers.poll_interval_seconds.to_string(),
            );
        }
        env.insert("REDIS_EXTERNAL_PORT".to_string(), self.redis.port.to_string());
        env.insert(
            "QUEEN_MONITORING_ENABLED".to_string(),
            self.monitoring.queen.enabled.to_string(),
        );
        env.insert(
            "QUEEN_MONITORING_INTERVAL".to_string(),
            self.monitoring.queen.interval_seconds.to_string(),
        );
        env.insert(
            "WORKER_MONITORING_ENABLED".to_string(),
            self.monitoring.worker.enabled.to_string(),
        );
        env.insert(
            "WORKER_MONITORING_INTERVAL".to_string(),
            self.monitoring.worker.interval_seconds.to_string(),
        );
        env
    }

    pub fn write_env_generated(&self, hive_dir: &Path) -> Result<PathBuf, ConfigError> {
        let mut content = String::from("# Generated from hive.yaml; regenerated on every start\n\n");
        for (key, value) in self.generate_env_vars() {
            content.push_str(&format!("{}={}\n", key, value));
        }
        fs::create_dir_all(hive_dir)?;
        let path = hive_dir.join(".env.generated");
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn topology_options(&self) -> TopologyOptions {
        let mut network_env = self.network.env.clone();
        for kind in self.host_mcps.enabled_kinds() {
            network_env.insert(
                kind.port_env_var().to_string(),
                self.host_mcps.port(kind).to_string(),
            );
        }

        TopologyOptions {
            worker_count: self.agents.workers.count,
            store_port: self.redis.port,
            container_prefix: self.container_prefix(),
            queen_dockerfile: self.agents.queen.dockerfile.clone(),
            worker_dockerfile: self.agents.workers.dockerfile.clone(),
            queen_ports: self.agents.queen.ports.clone(),
            worker_ports: self.agents.workers.ports.clone(),
            ports_per_drone: self.agents.workers.ports_per_drone.clone(),
            extra_volumes: self.volumes.clone(),
            extra_hosts: self.network.extra_hosts.clone(),
            network_env,
            ca_cert_path: self.network.ca_cert.clone(),
            poll_interval_seconds: self.agents.workers.poll_interval_seconds,
        }
    }
}

/// Lowercase, runs of anything but `[a-z0-9]` collapsed to `-`, trimmed and
/// capped at 20 characters. Empty input becomes `hive`.
pub fn sanitize_project_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let replaced = NON_ALNUM_REGEX.replace_all(&lowered, "-");
    let mut sanitized = replaced.trim_matches('-').to_string();
    if sanitized.len() > 20 {
        sanitized.truncate(20);
        sanitized = sanitized.trim_end_matches('-').to_string();
    }
    if sanitized.is_empty() {
        "hive".to_string()
    } else {
        sanitized
    }
}
