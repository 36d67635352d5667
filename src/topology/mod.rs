//! Container topology for a hive: one queen, one shared store and N drones.
//!
//! `build` produces the typed topology; `Topology::render` serializes it as
//! docker-compose YAML. Both are deterministic for a given input.

use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use thiserror::Error;

pub const STORE_SERVICE: &str = "redis";
pub const QUEEN_SERVICE: &str = "queen";
pub const NETWORK_NAME: &str = "hive-network";
pub const TOOLS_VOLUME: &str = "tools-cache";
pub const PNPM_VOLUME: &str = "pnpm-store";

const STORE_IMAGE: &str = "redis:7-alpine";
const STORE_CONTAINER_PORT: u16 = 6379;
const DEFAULT_DOCKERFILE: &str = "docker/Dockerfile.node";
const CA_CERT_TARGET: &str = "/usr/local/share/ca-certificates/hive-ca.crt";

pub fn drone_service_name(index: usize) -> String {
    format!("drone-{}", index)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyOptions {
    pub worker_count: usize,
    /// Host port the shared store is published on.
    pub store_port: u16,
    pub container_prefix: String,
    pub queen_dockerfile: String,
    pub worker_dockerfile: String,
    /// Compose-style `host:container` mappings.
    pub queen_ports: Vec<String>,
    /// Applied to every drone with the host side shifted by `index - 1`.
    pub worker_ports: Vec<String>,
    /// Replaces `worker_ports` for the given drone index.
    pub ports_per_drone: BTreeMap<usize, Vec<String>>,
    pub extra_volumes: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub network_env: BTreeMap<String, String>,
    pub ca_cert_path: Option<String>,
    pub poll_interval_seconds: u64,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            worker_count: 0,
            store_port: 6380,
            container_prefix: "hive".to_string(),
            queen_dockerfile: DEFAULT_DOCKERFILE.to_string(),
            worker_dockerfile: DEFAULT_DOCKERFILE.to_string(),
            queen_ports: Vec::new(),
            worker_ports: Vec::new(),
            ports_per_drone: BTreeMap::new(),
            extra_volumes: Vec::new(),
            extra_hosts: Vec::new(),
            network_env: BTreeMap::new(),
            ca_cert_path: None,
            poll_interval_seconds: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("Failed to render compose file: {0}")]
    Render(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    pub context: String,
    pub dockerfile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Healthcheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
}

/// One compose service. Fields serialize in declaration order; the name
/// becomes the service's key instead.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Service {
    #[serde(skip)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    pub container_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<Healthcheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub project: String,
    /// Store first, then queen, then drones in index order.
    pub services: Vec<Service>,
    pub volumes: Vec<String>,
    pub network: String,
}

/// Compose YAML for `worker_count` drones with every other option defaulted.
pub fn generate(worker_count: usize) -> Result<String, TopologyError> {
    generate_with_options(&TopologyOptions {
        worker_count,
        ..TopologyOptions::default()
    })
}

pub fn generate_with_options(options: &TopologyOptions) -> Result<String, TopologyError> {
    build(options).render()
}

pub fn build(options: &TopologyOptions) -> Topology {
    let mut services = Vec::with_capacity(options.worker_count + 2);
    services.push(store_service(options));
    services.push(agent_service(options, QUEEN_SERVICE, None));
    for index in 1..=options.worker_count {
        let name = drone_service_name(index);
        services.push(agent_service(options, &name, Some(index)));
    }

    Topology {
        project: options.container_prefix.clone(),
        services,
        volumes: vec![TOOLS_VOLUME.to_string(), PNPM_VOLUME.to_string()],
        network: NETWORK_NAME.to_string(),
    }
}

fn store_service(options: &TopologyOptions) -> Service {
    Service {
        name: STORE_SERVICE.to_string(),
        image: Some(STORE_IMAGE.to_string()),
        container_name: format!("{}-{}", options.container_prefix, STORE_SERVICE),
        command: vec![
            "redis-server".to_string(),
            "--appendonly".to_string(),
            "yes".to_string(),
        ],
        ports: vec![format!("{}:{}", options.store_port, STORE_CONTAINER_PORT)],
        networks: vec![NETWORK_NAME.to_string()],
        healthcheck: Some(Healthcheck {
            test: vec!["CMD".to_string(), "redis-cli".to_string(), "ping".to_string()],
            interval: "5s".to_string(),
            timeout: "3s".to_string(),
            retries: 5,
        }),
        restart: Some("unless-stopped".to_string()),
        ..Service::default()
    }
}

fn agent_service(options: &TopologyOptions, name: &str, drone_index: Option<usize>) -> Service {
    let (role, dockerfile) = match drone_index {
        None => ("queen", &options.queen_dockerfile),
        Some(_) => ("worker", &options.worker_dockerfile),
    };

    let mut environment = BTreeMap::new();
    environment.insert("AGENT_ROLE".to_string(), role.to_string());
    environment.insert("AGENT_ID".to_string(), name.to_string());
    environment.insert("REDIS_HOST".to_string(), STORE_SERVICE.to_string());
    environment.insert("REDIS_PORT".to_string(), STORE_CONTAINER_PORT.to_string());
    environment.insert("WORKSPACE_DIR".to_string(), "/workspace".to_string());
    if drone_index.is_some() {
        environment.insert(
            "POLL_INTERVAL".to_string(),
            options.poll_interval_seconds.to_string(),
        );
    }
    for (key, value) in &options.network_env {
        environment.insert(key.clone(), value.clone());
    }

    let mut volumes = vec![
        format!("./workspaces/{}:/workspace", name),
        "../.git:/workspace-git".to_string(),
        format!("{}:/home/agent/.hive-tools", TOOLS_VOLUME),
        format!("{}:/home/agent/.pnpm-store", PNPM_VOLUME),
    ];
    volumes.extend(options.extra_volumes.iter().cloned());
    if let Some(ca_cert) = &options.ca_cert_path {
        volumes.push(format!("{}:{}:ro", ca_cert, CA_CERT_TARGET));
        environment.insert("NODE_EXTRA_CA_CERTS".to_string(), CA_CERT_TARGET.to_string());
    }

    let ports = match drone_index {
        None => options.queen_ports.clone(),
        Some(index) => match options.ports_per_drone.get(&index) {
            Some(ports) => ports.clone(),
            None => options
                .worker_ports
                .iter()
                .map(|mapping| shift_host_port(mapping, index - 1))
                .collect(),
        },
    };

    Service {
        name: name.to_string(),
        build: Some(BuildSpec {
            context: ".".to_string(),
            dockerfile: dockerfile.clone(),
        }),
        container_name: format!("{}-{}", options.container_prefix, name),
        environment,
        ports,
        volumes,
        depends_on: vec![STORE_SERVICE.to_string()],
        extra_hosts: options.extra_hosts.clone(),
        networks: vec![NETWORK_NAME.to_string()],
        ..Service::default()
    }
}

/// `"13000:3000"` shifted by 2 is `"13002:3000"`. Mappings without a numeric
/// host side are returned unchanged.
fn shift_host_port(mapping: &str, offset: usize) -> String {
    let Some((host, container)) = mapping.split_once(':') else {
        return mapping.to_string();
    };
    match host.parse::<usize>() {
        Ok(port) if port + offset <= u16::MAX as usize => format!("{}:{}", port + offset, container),
        _ => mapping.to_string(),
    }
}

impl Topology {
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn drone_names(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| s.name.starts_with("drone-"))
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn render(&self) -> Result<String, TopologyError> {
        let document = ComposeFile {
            name: &self.project,
            services: ServiceMap(&self.services),
            volumes: self.volumes.iter().map(|v| (v.as_str(), EmptyMap {})).collect(),
            networks: BTreeMap::from([(self.network.as_str(), Network { driver: "bridge" })]),
        };
        let body = serde_yaml::to_string(&document)?;
        Ok(format!("# Generated by hive. Regenerated on every start.\n{}", body))
    }
}

#[derive(Serialize)]
struct ComposeFile<'a> {
    name: &'a str,
    services: ServiceMap<'a>,
    volumes: BTreeMap<&'a str, EmptyMap>,
    networks: BTreeMap<&'a str, Network>,
}

/// Services keyed by name, kept in build order.
struct ServiceMap<'a>(&'a [Service]);

impl Serialize for ServiceMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for service in self.0 {
            map.serialize_entry(&service.name, service)?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct EmptyMap {}

#[derive(Serialize)]
struct Network {
    driver: &'static str,
}
