//! Service topology and its compose manifest.
//!
//! `ServiceTopology::from_config` builds the typed topology from the
//! environment configuration alone, so re-rendering after a configuration
//! change is always a pure function of `.env`. `to_yaml` is the only place
//! that knows the compose file format.
//!
//! The manifest carries no secrets: every service reads `.env` through
//! `env_file`, and the one secret needed on a command line (the Redis
//! password) is compose-interpolated from `.env` at `up` time.

use crate::env_file::EnvironmentConfig;
use crate::error::{DeployError, Result};
use crate::paths::{DATA_DIR, DB_INIT_FILE, ENV_FILE, LOCAL_FILES_DIR};
use crate::types::{RestartPolicy, ServiceRole};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const N8N_IMAGE: &str = "docker.n8n.io/n8nio/n8n";
pub const POSTGRES_IMAGE: &str = "postgres:16-alpine";
pub const REDIS_IMAGE: &str = "redis:7-alpine";
pub const NETWORK: &str = "n8n-network";
pub const PROJECT_NAME: &str = "n8n";
pub const POSTGRES_VOLUME: &str = "postgres_data";
pub const REDIS_VOLUME: &str = "redis_data";
/// Uid/gid of the `node` user in the n8n image
pub const APP_UID: u32 = 1000;
/// Workers serve `/healthz` on the default queue health-check port
const WORKER_HEALTH_PORT: u16 = 5678;

/// Health probe run inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    /// Shell command (`CMD-SHELL`)
    pub command: String,
    pub interval_secs: u32,
    pub timeout_secs: u32,
    pub retries: u32,
    pub start_period_secs: u32,
}

/// Storage attached to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Named volume managed by Docker
    Volume { name: &'static str, target: &'static str },
    /// Path relative to the installation directory
    Bind {
        source: &'static str,
        target: &'static str,
        read_only: bool,
    },
}

impl Mount {
    fn render(&self) -> String {
        match self {
            Mount::Volume { name, target } => format!("{}:{}", name, target),
            Mount::Bind {
                source,
                target,
                read_only,
            } => {
                let mut spec = format!("./{}:{}", source, target);
                if *read_only {
                    spec.push_str(":ro");
                }
                spec
            }
        }
    }
}

/// Port published on the loopback interface only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackPort {
    pub host: u16,
    pub container: u16,
}

/// One service of the topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub role: ServiceRole,
    pub image: String,
    pub command: Option<String>,
    pub restart: RestartPolicy,
    pub ports: Vec<LoopbackPort>,
    pub mounts: Vec<Mount>,
    pub health: HealthProbe,
    /// Services that must be healthy before this one starts
    pub depends_on: Vec<ServiceRole>,
    /// Replica count for the replicated template, `None` for singletons
    pub replicas: Option<u32>,
}

/// Declarative description of the whole deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTopology {
    services: Vec<ServiceSpec>,
}

impl ServiceTopology {
    /// Build the topology described by `config`
    pub fn from_config(config: &EnvironmentConfig) -> Self {
        let queue = config.execution_mode.uses_workers();
        let mut services = vec![postgres(config)];
        if queue {
            services.push(redis());
        }
        services.push(main(config, queue));
        if queue {
            services.push(worker(config));
        }
        Self { services }
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn service(&self, role: ServiceRole) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.role == role)
    }

    pub fn roles(&self) -> Vec<ServiceRole> {
        self.services.iter().map(|s| s.role).collect()
    }

    /// Declared worker replica count (0 when there is no worker service)
    pub fn worker_replicas(&self) -> u32 {
        self.service(ServiceRole::Worker)
            .and_then(|s| s.replicas)
            .unwrap_or(0)
    }

    /// Group services into start-up tiers by their dependency edges.
    ///
    /// Every service of tier `n` depends only on services of tiers `< n`.
    pub fn start_tiers(&self) -> Result<Vec<Vec<ServiceRole>>> {
        let declared: BTreeSet<ServiceRole> = self.roles().into_iter().collect();
        let mut pending: BTreeMap<ServiceRole, BTreeSet<ServiceRole>> = BTreeMap::new();
        for spec in &self.services {
            let deps: BTreeSet<ServiceRole> = spec.depends_on.iter().copied().collect();
            if let Some(missing) = deps.iter().find(|d| !declared.contains(d)) {
                return Err(DeployError::state(format!(
                    "{} depends on undeclared service {}",
                    spec.role, missing
                )));
            }
            pending.insert(spec.role, deps);
        }

        let mut tiers = Vec::new();
        while !pending.is_empty() {
            let ready: Vec<ServiceRole> = pending
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(role, _)| *role)
                .collect();
            if ready.is_empty() {
                return Err(DeployError::state(
                    "service dependencies form a cycle".to_string(),
                ));
            }
            for role in &ready {
                pending.remove(role);
            }
            for deps in pending.values_mut() {
                for role in &ready {
                    deps.remove(role);
                }
            }
            tiers.push(ready);
        }
        Ok(tiers)
    }

    /// Serialize as a compose manifest
    pub fn to_yaml(&self) -> Result<String> {
        let file = ComposeFile::from(self);
        let body = serde_yaml::to_string(&file)?;
        Ok(format!(
            "# Generated by n8n-provision from {}. Re-rendered on every configuration change.\n{}",
            ENV_FILE, body
        ))
    }
}

fn postgres(config: &EnvironmentConfig) -> ServiceSpec {
    ServiceSpec {
        role: ServiceRole::Database,
        image: POSTGRES_IMAGE.to_string(),
        command: None,
        restart: RestartPolicy::UnlessStopped,
        ports: vec![LoopbackPort {
            host: config.postgres_host_port,
            container: 5432,
        }],
        mounts: vec![
            Mount::Volume {
                name: POSTGRES_VOLUME,
                target: "/var/lib/postgresql/data",
            },
            Mount::Bind {
                source: DB_INIT_FILE,
                target: "/docker-entrypoint-initdb.d/init-data.sh",
                read_only: true,
            },
        ],
        health: HealthProbe {
            command: "pg_isready -h localhost -U $${POSTGRES_USER} -d $${POSTGRES_DB}".to_string(),
            interval_secs: 5,
            timeout_secs: 5,
            retries: 10,
            start_period_secs: 10,
        },
        depends_on: vec![],
        replicas: None,
    }
}

fn redis() -> ServiceSpec {
    ServiceSpec {
        role: ServiceRole::Queue,
        image: REDIS_IMAGE.to_string(),
        command: Some(
            "redis-server --appendonly yes --requirepass ${QUEUE_BULL_REDIS_PASSWORD}".to_string(),
        ),
        restart: RestartPolicy::UnlessStopped,
        ports: vec![],
        mounts: vec![Mount::Volume {
            name: REDIS_VOLUME,
            target: "/data",
        }],
        health: HealthProbe {
            command: "redis-cli --no-auth-warning -a \"$${QUEUE_BULL_REDIS_PASSWORD}\" ping | grep -q PONG"
                .to_string(),
            interval_secs: 5,
            timeout_secs: 5,
            retries: 10,
            start_period_secs: 5,
        },
        depends_on: vec![],
        replicas: None,
    }
}

fn app_mounts() -> Vec<Mount> {
    vec![
        Mount::Bind {
            source: DATA_DIR,
            target: "/home/node/.n8n",
            read_only: false,
        },
        Mount::Bind {
            source: LOCAL_FILES_DIR,
            target: "/files",
            read_only: false,
        },
    ]
}

fn backing_services(queue: bool) -> Vec<ServiceRole> {
    if queue {
        vec![ServiceRole::Database, ServiceRole::Queue]
    } else {
        vec![ServiceRole::Database]
    }
}

fn n8n_image(config: &EnvironmentConfig) -> String {
    format!("{}:{}", N8N_IMAGE, config.n8n_version)
}

fn main(config: &EnvironmentConfig, queue: bool) -> ServiceSpec {
    ServiceSpec {
        role: ServiceRole::Main,
        image: n8n_image(config),
        command: None,
        restart: RestartPolicy::UnlessStopped,
        ports: vec![LoopbackPort {
            host: config.n8n_port,
            container: config.n8n_port,
        }],
        mounts: app_mounts(),
        health: HealthProbe {
            command: format!(
                "wget --spider -q http://localhost:{}/healthz || exit 1",
                config.n8n_port
            ),
            interval_secs: 15,
            timeout_secs: 10,
            retries: 5,
            start_period_secs: 60,
        },
        depends_on: backing_services(queue),
        replicas: None,
    }
}

fn worker(config: &EnvironmentConfig) -> ServiceSpec {
    ServiceSpec {
        role: ServiceRole::Worker,
        image: n8n_image(config),
        command: Some(format!("worker --concurrency={}", config.worker_concurrency)),
        restart: RestartPolicy::UnlessStopped,
        ports: vec![],
        mounts: app_mounts(),
        health: HealthProbe {
            command: format!(
                "wget --spider -q http://localhost:{}/healthz || exit 1",
                WORKER_HEALTH_PORT
            ),
            interval_secs: 15,
            timeout_secs: 10,
            retries: 5,
            start_period_secs: 60,
        },
        depends_on: backing_services(true),
        replicas: Some(config.worker_replicas),
    }
}

// ============================================================================
// Compose file format
// ============================================================================

#[derive(Serialize)]
struct ComposeFile {
    name: &'static str,
    services: BTreeMap<String, ComposeService>,
    networks: BTreeMap<&'static str, ComposeNetwork>,
    volumes: BTreeMap<&'static str, ComposeVolume>,
}

#[derive(Serialize)]
struct ComposeService {
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    restart: RestartPolicy,
    env_file: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    networks: Vec<&'static str>,
    healthcheck: ComposeHealthcheck,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    depends_on: BTreeMap<String, ComposeDependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deploy: Option<ComposeDeploy>,
    logging: ComposeLogging,
}

#[derive(Serialize)]
struct ComposeHealthcheck {
    test: Vec<String>,
    interval: String,
    timeout: String,
    retries: u32,
    start_period: String,
}

#[derive(Serialize)]
struct ComposeDependency {
    condition: &'static str,
}

#[derive(Serialize)]
struct ComposeDeploy {
    replicas: u32,
}

#[derive(Serialize)]
struct ComposeLogging {
    driver: &'static str,
    options: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
struct ComposeNetwork {
    driver: &'static str,
}

#[derive(Serialize)]
struct ComposeVolume {}

impl From<&ServiceSpec> for ComposeService {
    fn from(spec: &ServiceSpec) -> Self {
        Self {
            image: spec.image.clone(),
            command: spec.command.clone(),
            restart: spec.restart,
            env_file: vec![ENV_FILE],
            ports: spec
                .ports
                .iter()
                .map(|p| format!("127.0.0.1:{}:{}", p.host, p.container))
                .collect(),
            volumes: spec.mounts.iter().map(Mount::render).collect(),
            networks: vec![NETWORK],
            healthcheck: ComposeHealthcheck {
                test: vec!["CMD-SHELL".to_string(), spec.health.command.clone()],
                interval: format!("{}s", spec.health.interval_secs),
                timeout: format!("{}s", spec.health.timeout_secs),
                retries: spec.health.retries,
                start_period: format!("{}s", spec.health.start_period_secs),
            },
            depends_on: spec
                .depends_on
                .iter()
                .map(|role| {
                    (
                        role.service_name().to_string(),
                        ComposeDependency {
                            condition: "service_healthy",
                        },
                    )
                })
                .collect(),
            deploy: spec.replicas.map(|replicas| ComposeDeploy { replicas }),
            logging: ComposeLogging {
                driver: "json-file",
                options: BTreeMap::from([("max-size", "10m"), ("max-file", "3")]),
            },
        }
    }
}

impl From<&ServiceTopology> for ComposeFile {
    fn from(topology: &ServiceTopology) -> Self {
        let services = topology
            .services
            .iter()
            .map(|spec| (spec.role.service_name().to_string(), ComposeService::from(spec)))
            .collect();

        let mut volumes = BTreeMap::new();
        for spec in &topology.services {
            for mount in &spec.mounts {
                if let Mount::Volume { name, .. } = mount {
                    volumes.insert(*name, ComposeVolume {});
                }
            }
        }

        Self {
            name: PROJECT_NAME,
            services,
            networks: BTreeMap::from([(NETWORK, ComposeNetwork { driver: "bridge" })]),
            volumes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_file::sample_config;
    use crate::types::ExecutionMode;
    use serde_yaml::Value;

    fn rendered(config: &EnvironmentConfig) -> Value {
        let yaml = ServiceTopology::from_config(config).to_yaml().unwrap();
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn test_queue_topology_has_four_services() {
        let topo = ServiceTopology::from_config(&sample_config());
        assert_eq!(
            topo.roles(),
            vec![
                ServiceRole::Database,
                ServiceRole::Queue,
                ServiceRole::Main,
                ServiceRole::Worker
            ]
        );
        assert_eq!(topo.worker_replicas(), 1);
    }

    #[test]
    fn test_start_tiers_respect_dependencies() {
        let tiers = ServiceTopology::from_config(&sample_config())
            .start_tiers()
            .unwrap();
        assert_eq!(
            tiers,
            vec![
                vec![ServiceRole::Database, ServiceRole::Queue],
                vec![ServiceRole::Main, ServiceRole::Worker],
            ]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut topo = ServiceTopology::from_config(&sample_config());
        topo.services[0].depends_on = vec![ServiceRole::Main];
        assert!(topo.start_tiers().is_err());
    }

    #[test]
    fn test_manifest_contains_no_secrets() {
        let config = sample_config();
        let yaml = ServiceTopology::from_config(&config).to_yaml().unwrap();
        for secret in [
            &config.postgres_password,
            &config.app_db_password,
            &config.encryption_key,
            &config.redis_password,
        ] {
            assert!(!yaml.contains(secret.as_str()));
        }
        assert!(yaml.contains("${QUEUE_BULL_REDIS_PASSWORD}"));
    }

    #[test]
    fn test_ports_bound_to_loopback() {
        let doc = rendered(&sample_config());
        assert_eq!(
            doc["services"]["n8n"]["ports"][0].as_str(),
            Some("127.0.0.1:5678:5678")
        );
        assert_eq!(
            doc["services"]["postgres"]["ports"][0].as_str(),
            Some("127.0.0.1:5432:5432")
        );
        assert!(doc["services"]["redis"]["ports"].is_null());
    }

    #[test]
    fn test_worker_literals() {
        let mut config = sample_config();
        config.worker_concurrency = 7;
        config.worker_replicas = 3;
        config.n8n_version = "1.64.2".to_string();
        let doc = rendered(&config);
        let worker = &doc["services"]["n8n-worker"];
        assert_eq!(worker["command"].as_str(), Some("worker --concurrency=7"));
        assert_eq!(worker["deploy"]["replicas"].as_u64(), Some(3));
        assert_eq!(
            worker["image"].as_str(),
            Some("docker.n8n.io/n8nio/n8n:1.64.2")
        );
        assert_eq!(
            worker["depends_on"]["postgres"]["condition"].as_str(),
            Some("service_healthy")
        );
    }

    #[test]
    fn test_every_service_has_healthcheck_and_log_limits() {
        let doc = rendered(&sample_config());
        let services = doc["services"].as_mapping().unwrap();
        assert_eq!(services.len(), 4);
        for (_, svc) in services {
            assert_eq!(svc["healthcheck"]["test"][0].as_str(), Some("CMD-SHELL"));
            assert_eq!(svc["logging"]["options"]["max-size"].as_str(), Some("10m"));
            assert_eq!(svc["restart"].as_str(), Some("unless-stopped"));
            assert_eq!(svc["networks"][0].as_str(), Some(NETWORK));
            assert_eq!(svc["env_file"][0].as_str(), Some(".env"));
        }
        assert!(doc["volumes"]["postgres_data"].is_mapping());
        assert!(doc["volumes"]["redis_data"].is_mapping());
    }

    #[test]
    fn test_healthcheck_escapes_container_variables() {
        let doc = rendered(&sample_config());
        let test = doc["services"]["postgres"]["healthcheck"]["test"][1]
            .as_str()
            .unwrap();
        assert!(test.contains("$${POSTGRES_USER}"));
    }

    #[test]
    fn test_regular_mode_drops_queue_and_workers() {
        let mut config = sample_config();
        config.execution_mode = ExecutionMode::Regular;
        config.worker_replicas = 0;
        let topo = ServiceTopology::from_config(&config);
        assert_eq!(topo.roles(), vec![ServiceRole::Database, ServiceRole::Main]);
        assert_eq!(
            topo.start_tiers().unwrap(),
            vec![vec![ServiceRole::Database], vec![ServiceRole::Main]]
        );
        let doc = rendered(&config);
        assert!(doc["volumes"]["redis_data"].is_null());
    }
}
