use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::deployment::cloud::reserve::ReserveConfig;
use crate::error::OrchestratorError;

/// Which deployment provider backs kernel creation. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentKind {
    LocalProcess,
    Container,
    Cloud,
}

impl FromStr for DeploymentKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local-process" | "local" => Ok(DeploymentKind::LocalProcess),
            "container" | "local-docker" | "docker" => Ok(DeploymentKind::Container),
            "cloud" | "aws-ecs" | "ecs" => Ok(DeploymentKind::Cloud),
            other => Err(OrchestratorError::Validation(format!(
                "unknown deployment '{other}'"
            ))),
        }
    }
}

impl DeploymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentKind::LocalProcess => "local-process",
            DeploymentKind::Container => "container",
            DeploymentKind::Cloud => "cloud",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub deployment: DeploymentKind,
    /// How long a detached kernel lingers before it is shut down.
    pub detach_grace: Duration,
    /// Upper bound on how long a ticket waits for its history entry to be created.
    pub history_wait: Duration,
    /// Capacity of the per-session event channel.
    pub event_capacity: usize,
    /// Interval of the daemon's reserve housekeeping (flush + rebalance).
    pub housekeeping_interval: Duration,
    pub local: LocalProcessConfig,
    pub container: ContainerConfig,
    pub cloud: CloudConfig,
    pub gateway: GatewayConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentKind::LocalProcess,
            detach_grace: Duration::from_secs(60),
            history_wait: Duration::from_secs(5),
            event_capacity: 1024,
            housekeeping_interval: Duration::from_secs(30),
            local: LocalProcessConfig::default(),
            container: ContainerConfig::default(),
            cloud: CloudConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `STAGEHAND_*` environment variables.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), with keys the process environment
    /// leaves unset taken from the `.env` file at `path` when it exists.
    pub fn from_env_and_file(path: &Path) -> Result<Self, OrchestratorError> {
        Self::from_file_and_lookup(path, |key| std::env::var(key).ok())
    }

    pub fn from_file_and_lookup(
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let file = read_env_file(path)?;
        Self::from_lookup(|key| lookup(key).or_else(|| file.get(key).cloned()))
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, OrchestratorError> {
        let mut config = Self::default();
        if let Some(kind) = lookup("STAGEHAND_DEPLOYMENT") {
            config.deployment = kind.parse()?;
        }
        if let Some(ms) = lookup("STAGEHAND_DETACH_GRACE_MS") {
            config.detach_grace = Duration::from_millis(parse_number(&ms, "STAGEHAND_DETACH_GRACE_MS")?);
        }
        if let Some(program) = lookup("STAGEHAND_LOCAL_RUNTIME") {
            config.local = LocalProcessConfig::with_program(&program);
        }
        if let Some(cluster) = lookup("STAGEHAND_CLUSTER") {
            config.cloud.cluster = cluster;
        }
        if let Some(launch) = lookup("STAGEHAND_LAUNCH_TYPE") {
            config.cloud.launch_type = launch.parse()?;
        }
        if let Some(api) = lookup("STAGEHAND_CLUSTER_API") {
            config.cloud.api_endpoint = api;
        }
        if let Some(group) = lookup("STAGEHAND_SECURITY_GROUP") {
            config.cloud.security_group = group;
        }
        if let Some(max) = lookup("STAGEHAND_MAX_KERNELS") {
            config.cloud.reserve.max_kernels = parse_number(&max, "STAGEHAND_MAX_KERNELS")?;
        }
        if let Some(shares) = lookup("STAGEHAND_RESERVE") {
            config.cloud.reserve.shares = parse_shares(&shares)?;
        }
        if let Some(flag) = lookup("STAGEHAND_FS_ENABLED") {
            config.cloud.filesystem_enabled = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(url) = lookup("STAGEHAND_HELPER_URL") {
            config.gateway.helper_url = url;
        }
        Ok(config)
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, OrchestratorError> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let bad_file = |e: dotenvy::Error| {
        OrchestratorError::Validation(format!("load {}: {e}", path.display()))
    };
    for item in dotenvy::from_path_iter(path).map_err(bad_file)? {
        let (key, val) = item.map_err(bad_file)?;
        vars.insert(key, val);
    }
    Ok(vars)
}

fn parse_number<T: FromStr>(raw: &str, key: &str) -> Result<T, OrchestratorError> {
    raw.trim().parse().map_err(|_| {
        OrchestratorError::Validation(format!("{key} must be a number in range, got '{raw}'"))
    })
}

/// Parse `ir=6,python3=4` into a share table.
pub fn parse_shares(raw: &str) -> Result<BTreeMap<String, u32>, OrchestratorError> {
    let mut shares = BTreeMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, count) = part.split_once('=').ok_or_else(|| {
            OrchestratorError::Validation(format!("reserve share '{part}' is not name=count"))
        })?;
        let count = count.trim().parse::<u32>().map_err(|_| {
            OrchestratorError::Validation(format!("reserve share '{part}' has a bad count"))
        })?;
        shares.insert(name.trim().to_string(), count);
    }
    Ok(shares)
}

/// A command line that starts one runtime process speaking NDJSON on stdio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LocalProcessConfig {
    /// Runtime name (`ir`, `python3`) to the command that starts it.
    pub commands: BTreeMap<String, RuntimeCommand>,
}

impl LocalProcessConfig {
    pub fn with_program(program: &str) -> Self {
        let commands = ["ir", "python3"]
            .into_iter()
            .map(|runtime| {
                (
                    runtime.to_string(),
                    RuntimeCommand {
                        program: program.to_string(),
                        args: vec!["--runtime".into(), runtime.into()],
                    },
                )
            })
            .collect();
        Self { commands }
    }
}

impl Default for LocalProcessConfig {
    fn default() -> Self {
        Self::with_program("stagehand-runtime")
    }
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub docker_bin: String,
    pub network: String,
    pub helper_container: String,
    pub helper_image: String,
    pub helper_ports: Vec<u16>,
    /// Ports each kernel container exposes, in shell/iopub/stdin/control/hb order.
    pub kernel_ports: Vec<u16>,
    /// Runtime name to container image.
    pub images: BTreeMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            network: "stagehand-kernel-bridge".into(),
            helper_container: "stagehand-runtime-helper".into(),
            helper_image: "stagehand/runtime-helper".into(),
            helper_ports: vec![8888, 8889],
            kernel_ports: (5000..=5004).collect(),
            images: BTreeMap::from([
                ("ir".to_string(), "stagehand/irkernel".to_string()),
                ("python3".to_string(), "stagehand/ipykernel".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchType {
    Fargate,
    Ec2,
}

impl LaunchType {
    /// Only serverless launches keep warm reserves.
    pub fn supports_prewarm(&self) -> bool {
        matches!(self, LaunchType::Fargate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchType::Fargate => "FARGATE",
            LaunchType::Ec2 => "EC2",
        }
    }
}

impl FromStr for LaunchType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fargate" => Ok(LaunchType::Fargate),
            "ec2" => Ok(LaunchType::Ec2),
            other => Err(OrchestratorError::Validation(format!(
                "unknown launch type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub cluster: String,
    pub launch_type: LaunchType,
    pub security_group: String,
    /// Base URL of the JSON gateway in front of the cluster API.
    pub api_endpoint: String,
    pub port_floor: u16,
    pub port_ceiling: u16,
    /// Container ports published per kernel; the last one serves package management.
    pub container_ports: Vec<u16>,
    pub poll_interval: Duration,
    pub reserve: ReserveConfig,
    pub filesystem_enabled: bool,
    pub images: BTreeMap<String, String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            cluster: "stagehand-kernels".into(),
            launch_type: LaunchType::Fargate,
            security_group: "stagehand-kernels".into(),
            api_endpoint: "http://127.0.0.1:4566".into(),
            port_floor: 5000,
            port_ceiling: 65000,
            container_ports: (5000..=5005).collect(),
            poll_interval: Duration::from_secs(2),
            reserve: ReserveConfig::default(),
            filesystem_enabled: false,
            images: ContainerConfig::default().images,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Helper service that turns an endpoint into a runtime connection file.
    pub helper_url: String,
    pub timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            helper_url: "http://127.0.0.1:8889/".into(),
            timeout: Duration::from_secs(30),
        }
    }
}
