//! Kernels as containers on the local container engine.
//!
//! A bridge network and a helper container (which writes runtime connection
//! files) are created once. Each kernel then gets its own container on that
//! network; its address is read back from the network and handed to the
//! helper before the runtime is connected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{DeploymentProvider, KernelRecord, KernelSummary, StartContext, response_data};
use crate::config::{ContainerConfig, DeploymentKind};
use crate::error::{OrchestratorError, Result};
use crate::runtime::{ConfigRequest, Endpoint, ExecutionResult, KernelGateway, RuntimeHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub running: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub exposed_ports: Vec<u16>,
    pub published_ports: Vec<u16>,
    pub privileged: bool,
}

/// The slice of a container engine the provider drives.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn find_network(&self, name: &str) -> Result<Option<String>>;

    async fn create_network(&self, name: &str) -> Result<String>;

    async fn find_container(&self, name: &str) -> Result<Option<ContainerState>>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// IPv4 address of `container` on `network`, without the prefix length.
    async fn container_ip(&self, network: &str, container: &str) -> Result<Option<String>>;

    async fn stop_container(&self, id: &str) -> Result<()>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;
}

/// Drives the `docker` command line.
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        tracing::debug!(bin = %self.bin, ?args, "docker");
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(|e| OrchestratorError::Backend(format!("run {}: {e}", self.bin)))?;
        if !output.status.success() {
            return Err(OrchestratorError::Backend(format!(
                "{} {} failed: {}",
                self.bin,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[derive(Debug, Deserialize)]
struct NetworkInspect {
    #[serde(rename = "Containers", default)]
    containers: HashMap<String, NetworkEndpoint>,
}

#[derive(Debug, Deserialize)]
struct NetworkEndpoint {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "IPv4Address", default)]
    ipv4: String,
}

/// Pick the address of `container` out of `docker network inspect` output.
fn ip_from_inspect(raw: &str, container: &str) -> Result<Option<String>> {
    let networks: Vec<NetworkInspect> = serde_json::from_str(raw)
        .map_err(|e| OrchestratorError::Backend(format!("decode network inspect: {e}")))?;
    Ok(networks
        .iter()
        .flat_map(|n| n.containers.iter())
        .find(|(id, ep)| ep.name == container || id.starts_with(container))
        .map(|(_, ep)| ep.ipv4.split('/').next().unwrap_or_default().to_string())
        .filter(|ip| !ip.is_empty()))
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn find_network(&self, name: &str) -> Result<Option<String>> {
        let filter = format!("name=^{name}$");
        let out = self
            .run(&args(&["network", "ls", "--filter", &filter, "--format", "{{.ID}}"]))
            .await?;
        Ok(out.lines().next().map(str::to_string))
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        self.run(&args(&["network", "create", "--driver", "bridge", name]))
            .await
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerState>> {
        let filter = format!("name=^{name}$");
        let out = self
            .run(&args(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.State}}",
            ]))
            .await?;
        Ok(out.lines().next().map(|line| {
            let (id, state) = line.split_once('\t').unwrap_or((line, ""));
            ContainerState {
                id: id.to_string(),
                running: state == "running",
            }
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut cmd = args(&["create", "--name", &spec.name, "--network", &spec.network]);
        if spec.privileged {
            cmd.push("--privileged".into());
        }
        for port in &spec.exposed_ports {
            cmd.push("--expose".into());
            cmd.push(port.to_string());
        }
        for port in &spec.published_ports {
            cmd.push("-p".into());
            cmd.push(format!("{port}:{port}"));
        }
        cmd.push(spec.image.clone());
        self.run(&cmd).await
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.run(&args(&["start", id])).await.map(|_| ())
    }

    async fn container_ip(&self, network: &str, container: &str) -> Result<Option<String>> {
        let raw = self.run(&args(&["network", "inspect", network])).await?;
        ip_from_inspect(&raw, container)
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.run(&args(&["stop", id])).await.map(|_| ())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.run(&args(&["kill", id])).await.map(|_| ())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.run(&args(&["rm", "-f", id])).await.map(|_| ())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.run(&args(&["network", "rm", name])).await.map(|_| ())
    }
}

#[derive(Debug, Clone)]
struct Infrastructure {
    network: String,
    helper_id: String,
}

struct ContainerKernel {
    container_id: String,
    ip: String,
    runtime: Arc<dyn RuntimeHandle>,
    record: KernelRecord,
}

pub struct ContainerProvider {
    engine: Arc<dyn ContainerEngine>,
    gateway: Arc<dyn KernelGateway>,
    config: ContainerConfig,
    infra: OnceCell<Infrastructure>,
    /// Keyed by runtime id.
    kernels: Mutex<HashMap<String, ContainerKernel>>,
}

impl ContainerProvider {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        gateway: Arc<dyn KernelGateway>,
        config: ContainerConfig,
    ) -> Self {
        Self {
            engine,
            gateway,
            config,
            infra: OnceCell::new(),
            kernels: Mutex::new(HashMap::new()),
        }
    }

    fn kernels(&self) -> MutexGuard<'_, HashMap<String, ContainerKernel>> {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn infrastructure(&self) -> Result<&Infrastructure> {
        self.infra.get_or_try_init(|| self.prepare()).await
    }

    async fn prepare(&self) -> Result<Infrastructure> {
        let network = match self.engine.find_network(&self.config.network).await? {
            Some(id) => id,
            None => {
                tracing::info!(network = %self.config.network, "creating kernel network");
                self.engine.create_network(&self.config.network).await?
            }
        };
        let helper_id = match self.engine.find_container(&self.config.helper_container).await? {
            Some(state) if state.running => state.id,
            Some(state) => {
                self.engine.start_container(&state.id).await?;
                state.id
            }
            None => {
                tracing::info!(helper = %self.config.helper_container, "creating runtime helper");
                let spec = ContainerSpec {
                    name: self.config.helper_container.clone(),
                    image: self.config.helper_image.clone(),
                    network: self.config.network.clone(),
                    exposed_ports: self.config.helper_ports.clone(),
                    published_ports: self.config.helper_ports.clone(),
                    privileged: true,
                };
                let id = self.engine.create_container(&spec).await?;
                self.engine.start_container(&id).await?;
                id
            }
        };
        Ok(Infrastructure { network, helper_id })
    }

    async fn remove_quietly(&self, container_id: &str) {
        if let Err(err) = self.engine.remove_container(container_id).await {
            tracing::warn!(container = container_id, error = %err, "container cleanup failed");
        }
    }
}

#[async_trait]
impl DeploymentProvider for ContainerProvider {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Container
    }

    async fn init(&self) -> Result<()> {
        self.infrastructure().await.map(|_| ())
    }

    async fn start_kernel(
        &self,
        runtime_name: &str,
        ctx: StartContext,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        self.infrastructure().await?;
        let image = self.config.images.get(runtime_name).ok_or_else(|| {
            OrchestratorError::Validation(format!("runtime '{runtime_name}' is not installed"))
        })?;
        let name = format!("stagehand-{runtime_name}-{}", Uuid::new_v4().simple());
        ctx.report(1, "creating container", json!({ "name": name }));
        let container_id = self
            .engine
            .create_container(&ContainerSpec {
                name: name.clone(),
                image: image.clone(),
                network: self.config.network.clone(),
                exposed_ports: self.config.kernel_ports.clone(),
                published_ports: Vec::new(),
                privileged: false,
            })
            .await?;

        let connected = async {
            self.engine.start_container(&container_id).await?;
            let ip = self
                .engine
                .container_ip(&self.config.network, &name)
                .await?
                .ok_or_else(|| {
                    OrchestratorError::Backend(format!("cannot get IP of kernel container {name}"))
                })?;
            ctx.report(2, "container running", json!({ "ip": ip }));
            self.gateway
                .create_config(&ConfigRequest {
                    id: container_id.clone(),
                    ip: ip.clone(),
                    kernel_name: runtime_name.to_string(),
                    ports: self.config.kernel_ports.clone(),
                })
                .await?;
            let endpoint = Endpoint {
                host: ip.clone(),
                ports: self.config.kernel_ports.clone(),
            };
            let runtime = self
                .gateway
                .connect(runtime_name, &container_id, &endpoint)
                .await?;
            Ok::<_, OrchestratorError>((ip, runtime))
        }
        .await;

        let (ip, runtime) = match connected {
            Ok(connected) => connected,
            Err(err) => {
                tracing::warn!(container = %container_id, error = %err, "kernel container failed");
                self.remove_quietly(&container_id).await;
                return Err(err);
            }
        };
        ctx.report(3, "runtime connected", json!({ "runtime_id": runtime.id() }));
        let mut record = KernelRecord::new(runtime.id(), runtime_name, &ctx, "CREATING_KERNEL");
        record.set_status("READY", Some(json!({ "container": container_id })));
        self.kernels().insert(
            runtime.id().to_string(),
            ContainerKernel {
                container_id,
                ip,
                runtime: Arc::clone(&runtime),
                record,
            },
        );
        Ok(runtime)
    }

    async fn shutdown_kernel(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<()> {
        let kernel = self.kernels().remove(runtime.id()).ok_or_else(|| {
            OrchestratorError::ResourceNotFound(format!("kernel container for {}", runtime.id()))
        })?;
        if let Err(err) = kernel.runtime.shutdown().await {
            tracing::warn!(runtime_id = %runtime.id(), error = %err, "runtime did not shut down cleanly");
        }
        self.engine.stop_container(&kernel.container_id).await?;
        self.engine.remove_container(&kernel.container_id).await
    }

    async fn install_package(
        &self,
        runtime: &Arc<dyn RuntimeHandle>,
        package: &str,
    ) -> Result<Vec<String>> {
        let endpoint = self.package_endpoint(runtime)?;
        self.gateway.install_package(&endpoint, package).await
    }

    async fn remove_package(&self, runtime: &Arc<dyn RuntimeHandle>, package: &str) -> Result<String> {
        let endpoint = self.package_endpoint(runtime)?;
        self.gateway.remove_package(&endpoint, package).await
    }

    fn on_eval(&self, runtime: &Arc<dyn RuntimeHandle>, code: &str) {
        if let Some(kernel) = self.kernels().get_mut(runtime.id()) {
            kernel.record.note("CODE", Some(json!(code)));
        }
    }

    fn on_response(&self, runtime: &Arc<dyn RuntimeHandle>, outcome: &Result<ExecutionResult>) {
        if let Some(kernel) = self.kernels().get_mut(runtime.id()) {
            kernel.record.note("RESPONSE", Some(response_data(outcome)));
        }
    }

    fn status(&self) -> Vec<KernelSummary> {
        self.kernels().values().map(|k| k.record.summary()).collect()
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let kernel = self
            .kernels()
            .remove(id)
            .ok_or_else(|| OrchestratorError::ResourceNotFound(format!("kernel {id}")))?;
        self.engine.kill_container(&kernel.container_id).await?;
        self.engine.remove_container(&kernel.container_id).await
    }

    async fn destroy(&self) -> Result<()> {
        let kernels: Vec<ContainerKernel> = self.kernels().drain().map(|(_, k)| k).collect();
        for kernel in kernels {
            let _ = kernel.runtime.shutdown().await;
            self.remove_quietly(&kernel.container_id).await;
        }
        if let Some(infra) = self.infra.get() {
            if let Err(err) = self.engine.kill_container(&infra.helper_id).await {
                tracing::debug!(error = %err, "helper already stopped");
            }
            self.remove_quietly(&infra.helper_id).await;
            self.engine.remove_network(&self.config.network).await?;
            tracing::info!(network = %infra.network, "container infrastructure removed");
        }
        Ok(())
    }
}

impl ContainerProvider {
    fn package_endpoint(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<Endpoint> {
        let kernels = self.kernels();
        let kernel = kernels.get(runtime.id()).ok_or_else(|| {
            OrchestratorError::ResourceNotFound(format!("kernel container for {}", runtime.id()))
        })?;
        Ok(Endpoint {
            host: kernel.ip.clone(),
            ports: self.config.kernel_ports.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FakeEngine, MockGateway};

    fn provider(engine: Arc<FakeEngine>, gateway: Arc<MockGateway>) -> ContainerProvider {
        ContainerProvider::new(engine, gateway, ContainerConfig::default())
    }

    #[test]
    fn parses_ip_from_network_inspect() {
        let raw = r#"[{"Name":"stagehand-kernel-bridge","Containers":{
            "abc123":{"Name":"stagehand-python3-1","IPv4Address":"172.18.0.3/16"}}}]"#;
        assert_eq!(
            ip_from_inspect(raw, "stagehand-python3-1").unwrap().as_deref(),
            Some("172.18.0.3")
        );
        assert_eq!(ip_from_inspect(raw, "missing").unwrap(), None);
    }

    #[tokio::test]
    async fn infrastructure_is_created_once() {
        let engine = Arc::new(FakeEngine::new());
        let provider = provider(engine.clone(), Arc::new(MockGateway::new()));
        provider.init().await.unwrap();
        provider.init().await.unwrap();
        assert_eq!(engine.networks_created(), 1);
        assert_eq!(engine.containers().len(), 1);
    }

    #[tokio::test]
    async fn kernel_container_lifecycle() {
        let engine = Arc::new(FakeEngine::new());
        let gateway = Arc::new(MockGateway::new());
        let provider = provider(engine.clone(), gateway.clone());
        let runtime = provider
            .start_kernel("python3", StartContext::new(None, "p1", "1"))
            .await
            .unwrap();
        assert_eq!(gateway.configs().len(), 1);
        assert_eq!(gateway.configs()[0].kernel_name, "python3");
        assert_eq!(provider.status().len(), 1);
        assert_eq!(engine.containers().len(), 2);

        provider.shutdown_kernel(&runtime).await.unwrap();
        assert!(provider.status().is_empty());
        assert_eq!(engine.containers().len(), 1);

        provider.destroy().await.unwrap();
        assert!(engine.containers().is_empty());
        assert_eq!(engine.networks_created(), 1);
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn missing_ip_removes_the_container() {
        let engine = Arc::new(FakeEngine::new());
        engine.hide_ips(true);
        let provider = provider(engine.clone(), Arc::new(MockGateway::new()));
        let err = provider
            .start_kernel("python3", StartContext::new(None, "p1", "1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::Backend(_)));
        assert_eq!(engine.containers().len(), 1);
    }
}
