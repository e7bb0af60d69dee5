//! One cloud kernel: a task on the cluster plus the runtime connected to it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use uuid::Uuid;

use super::api::{EnvVar, PortMapping, ResourceKind, RunTaskRequest, TaskDefinition};
use super::cluster::ClusterContext;
use super::Backend;
use crate::config::LaunchType;
use crate::deployment::KernelSummary;
use crate::error::{OrchestratorError, Result};
use crate::kernel::catalog::Resources;
use crate::kernel::lifecycle::{KernelLifecycle, KernelState};
use crate::runtime::{ConfigRequest, Endpoint, RuntimeHandle};
use crate::store::UserRef;
use crate::util::short_id;

const KERNEL_CONTAINER: &str = "kernel";
const RUNNING: &str = "RUNNING";
const STOPPED: &str = "STOPPED";

#[derive(Debug, Default)]
struct Placement {
    task_id: Option<String>,
    task_arn: Option<String>,
    ports: Vec<u16>,
    owner: Option<UserRef>,
    scope: Option<String>,
}

pub struct KernelTask {
    key: Uuid,
    runtime_name: String,
    resources: Resources,
    backend: Arc<Backend>,
    lifecycle: KernelLifecycle,
    placement: Mutex<Placement>,
}

impl KernelTask {
    /// Create the kernel and start provisioning it in the background.
    pub(crate) fn spawn(
        backend: Arc<Backend>,
        runtime_name: &str,
        resources: Resources,
        owner: Option<UserRef>,
    ) -> Arc<Self> {
        let task = Arc::new(Self {
            key: Uuid::new_v4(),
            runtime_name: runtime_name.to_string(),
            resources,
            backend,
            lifecycle: KernelLifecycle::new(),
            placement: Mutex::new(Placement {
                owner,
                ..Placement::default()
            }),
        });
        let provisioning = Arc::clone(&task);
        tokio::spawn(async move {
            if let Err(err) = provisioning.provision().await {
                tracing::warn!(
                    kernel = %provisioning.id(),
                    runtime = %provisioning.runtime_name,
                    error = %err,
                    "kernel provisioning failed"
                );
                provisioning.abandon().await;
                provisioning.lifecycle.fail(err);
            }
        });
        task
    }

    fn placement(&self) -> MutexGuard<'_, Placement> {
        self.placement.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Task id once the task exists, a local key before that.
    pub fn id(&self) -> String {
        self.placement()
            .task_id
            .clone()
            .unwrap_or_else(|| self.key.to_string())
    }

    pub fn matches(&self, id: &str) -> bool {
        self.key.to_string() == id || self.placement().task_id.as_deref() == Some(id)
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    pub fn resources(&self) -> Resources {
        self.resources
    }

    pub fn lifecycle(&self) -> &KernelLifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> KernelState {
        self.lifecycle.state()
    }

    pub fn is_assigned(&self) -> bool {
        self.placement().scope.is_some()
    }

    /// Hand a (possibly reserve) kernel to its user.
    pub fn assign(&self, owner: Option<UserRef>, scope: &str) {
        let mut placement = self.placement();
        if owner.is_some() {
            placement.owner = owner;
        }
        placement.scope = Some(scope.to_string());
    }

    pub fn runs(&self, runtime: &Arc<dyn RuntimeHandle>) -> bool {
        self.lifecycle
            .runtime()
            .is_some_and(|own| own.id() == runtime.id())
    }

    pub fn summary(&self) -> KernelSummary {
        let placement = self.placement();
        KernelSummary {
            id: placement
                .task_id
                .clone()
                .unwrap_or_else(|| self.key.to_string()),
            name: self.runtime_name.clone(),
            status: self.state().to_string(),
            history: self.lifecycle.history(),
            owner: placement.owner.clone(),
            scope: placement.scope.clone(),
            reserve: placement.scope.is_none(),
        }
    }

    async fn provision(&self) -> Result<()> {
        let backend = &self.backend;
        let config = &backend.config;
        let lifecycle = &self.lifecycle;

        lifecycle.advance(KernelState::RegisteringDefinition)?;
        let image = config.images.get(&self.runtime_name).ok_or_else(|| {
            OrchestratorError::Validation(format!("no image for runtime '{}'", self.runtime_name))
        })?;
        let ports = backend
            .allocator
            .find_available_ports(config.container_ports.len())
            .await?;
        self.placement().ports = ports.clone();
        let definition = backend
            .api
            .register_task_definition(&TaskDefinition {
                family: format!("stagehand-{}", self.runtime_name),
                container_name: KERNEL_CONTAINER.into(),
                image: image.clone(),
                memory_mb: self.resources.memory_mb,
                cpu_units: self.resources.cpu_units,
                port_mappings: config
                    .container_ports
                    .iter()
                    .zip(&ports)
                    .map(|(container_port, host_port)| PortMapping {
                        container_port: *container_port,
                        host_port: *host_port,
                    })
                    .collect(),
            })
            .await?;
        lifecycle.advance(KernelState::DefinitionRegistered)?;

        let filesystem = self.attach_filesystem().await?;

        lifecycle.advance(KernelState::CreatingTask)?;
        let ctx = backend.cluster.get().await?;
        let arn = self.run_task(&ctx, &definition, filesystem).await?;
        lifecycle.advance(KernelState::TaskCreated)?;
        backend
            .allocator
            .wait_for_state(&arn, ResourceKind::Task, RUNNING)
            .await?;
        lifecycle.advance(KernelState::TaskReady)?;

        backend.api.deregister_task_definition(&definition).await?;
        lifecycle.record("DEFINITION_REMOVED", Some(json!({ "definition": definition })));

        lifecycle.advance(KernelState::GettingIp)?;
        let ip = self.resolve_ip(&ctx, &arn).await?;
        let endpoint = Endpoint {
            host: ip.clone(),
            ports: ports.clone(),
        };
        lifecycle.set_endpoint(endpoint.clone())?;
        lifecycle.advance(KernelState::GotIp)?;

        lifecycle.advance(KernelState::CreatingConfig)?;
        let id = self.id();
        backend
            .gateway
            .create_config(&ConfigRequest {
                id: id.clone(),
                ip,
                kernel_name: self.runtime_name.clone(),
                ports,
            })
            .await?;
        lifecycle.advance(KernelState::ConfigReady)?;

        lifecycle.advance(KernelState::ConnectingRuntime)?;
        let runtime = backend
            .gateway
            .connect(&self.runtime_name, &id, &endpoint)
            .await?;
        lifecycle.advance(KernelState::RuntimeConnected)?;
        lifecycle.attach_runtime(runtime)?;
        lifecycle.advance(KernelState::Ready)?;
        tracing::info!(kernel = %id, runtime = %self.runtime_name, "cloud kernel ready");
        Ok(())
    }

    /// Only kernels provisioned for a known user get a filesystem.
    async fn attach_filesystem(&self) -> Result<Option<String>> {
        if !self.backend.config.filesystem_enabled {
            return Ok(None);
        }
        let Some(owner) = self.placement().owner.clone() else {
            return Ok(None);
        };
        self.lifecycle.record("GETTING_FS", None);
        let token = if owner.email.is_empty() {
            owner.id.clone()
        } else {
            owner.email.clone()
        };
        let fs_id = self.backend.filesystems.ensure(&token).await?;
        self.lifecycle.record("GOT_FS", Some(json!({ "fs": fs_id })));
        Ok(Some(fs_id))
    }

    async fn run_task(
        &self,
        ctx: &ClusterContext,
        definition: &str,
        filesystem: Option<String>,
    ) -> Result<String> {
        let launch_type = self.backend.config.launch_type;
        let folder = self.placement().owner.as_ref().map(|o| o.id.clone());
        let mut environment = Vec::new();
        if let Some(folder) = folder {
            environment.push(EnvVar {
                name: "PROJECT_FOLDER".into(),
                value: folder,
            });
        }
        if let Some(fs_id) = filesystem {
            environment.push(EnvVar {
                name: "FS_ID".into(),
                value: fs_id,
            });
        }
        let response = self
            .backend
            .api
            .run_task(&RunTaskRequest {
                cluster: ctx.cluster_arn.clone(),
                task_definition: definition.to_string(),
                launch_type: launch_type.as_str().into(),
                network: (launch_type == LaunchType::Fargate).then(|| ctx.network.clone()),
                container_name: KERNEL_CONTAINER.into(),
                environment,
            })
            .await?;
        let task = response.tasks.into_iter().next().ok_or_else(|| {
            let reason = response
                .failures
                .first()
                .map(|f| f.reason.as_str())
                .filter(|r| !r.is_empty())
                .unwrap_or("Unknown");
            OrchestratorError::Backend(format!("Task couldn't be created. Reason: {reason}"))
        })?;
        let mut placement = self.placement();
        placement.task_id = Some(short_id(&task.task_arn).to_string());
        placement.task_arn = Some(task.task_arn.clone());
        Ok(task.task_arn)
    }

    async fn resolve_ip(&self, ctx: &ClusterContext, arn: &str) -> Result<String> {
        let api = &self.backend.api;
        let task = api
            .describe_tasks(&ctx.cluster_arn, &[arn.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| OrchestratorError::ResourceNotFound(format!("task {arn}")))?;
        let ip = match self.backend.config.launch_type {
            LaunchType::Fargate => {
                let interface = task.network_interface_id().ok_or_else(|| {
                    OrchestratorError::Backend("Network interface id couldn't be found".into())
                })?;
                api.network_interface_ip(interface).await?
            }
            LaunchType::Ec2 => {
                let instance = task.container_instance_arn.as_deref().ok_or_else(|| {
                    OrchestratorError::Backend("Couldn't retrieve instance id".into())
                })?;
                api.container_instance_ip(&ctx.cluster_arn, instance).await?
            }
        };
        ip.ok_or_else(|| OrchestratorError::Backend("Couldn't retrieve ip of kernel task".into()))
    }

    /// Best-effort cleanup after a failed provisioning.
    async fn abandon(&self) {
        let (arn, ports) = {
            let mut placement = self.placement();
            (placement.task_arn.clone(), std::mem::take(&mut placement.ports))
        };
        if let Some(arn) = arn {
            if let Ok(ctx) = self.backend.cluster.get().await {
                if let Err(err) = self.backend.api.stop_task(&ctx.cluster_arn, &arn).await {
                    tracing::warn!(task = %arn, error = %err, "could not stop abandoned task");
                }
            }
        }
        self.backend.allocator.release(&ports).await;
    }

    /// Tear the kernel down. Waits for provisioning when called early and
    /// joins an in-flight teardown instead of starting a second one.
    pub async fn kill(&self) -> Result<()> {
        self.lifecycle
            .kill(|| async {
                if let Some(runtime) = self.lifecycle.runtime() {
                    if let Err(err) = runtime.shutdown().await {
                        tracing::warn!(kernel = %self.id(), error = %err, "runtime shutdown failed");
                    }
                }
                let arn = self.placement().task_arn.clone();
                let arn = arn.ok_or_else(|| {
                    OrchestratorError::Internal(format!("kernel {} has no task", self.id()))
                })?;
                let ctx = self.backend.cluster.get().await?;
                self.backend.api.stop_task(&ctx.cluster_arn, &arn).await?;
                self.backend
                    .allocator
                    .wait_for_state(&arn, ResourceKind::Task, STOPPED)
                    .await?;
                let ports = std::mem::take(&mut self.placement().ports);
                self.backend.allocator.release(&ports).await;
                tracing::info!(kernel = %self.id(), "cloud kernel stopped");
                Ok(())
            })
            .await
    }

    fn package_endpoint(&self) -> Result<Endpoint> {
        self.lifecycle.ensure_ready()?;
        self.lifecycle
            .endpoint()
            .cloned()
            .ok_or_else(|| OrchestratorError::Internal("ready kernel without endpoint".into()))
    }

    pub async fn install_package(&self, package: &str) -> Result<Vec<String>> {
        let endpoint = self.package_endpoint()?;
        self.lifecycle
            .record("INSTALL_PACKAGE", Some(json!({ "package": package })));
        let installed = self
            .backend
            .gateway
            .install_package(&endpoint, package)
            .await?;
        self.lifecycle
            .record("PACKAGES_INSTALLED", Some(json!({ "packages": installed })));
        Ok(installed)
    }

    pub async fn remove_package(&self, package: &str) -> Result<String> {
        let endpoint = self.package_endpoint()?;
        self.lifecycle
            .record("REMOVE_PACKAGE", Some(json!({ "package": package })));
        let removed = self.backend.gateway.remove_package(&endpoint, package).await?;
        self.lifecycle
            .record("PACKAGE_REMOVED", Some(json!({ "result": removed })));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudConfig;
    use crate::kernel::catalog::resources_for;
    use crate::testkit::{FakeCluster, MockGateway, test_user};

    fn backend(api: Arc<FakeCluster>, config: CloudConfig) -> Arc<Backend> {
        Arc::new(Backend::new(api, Arc::new(MockGateway::new()), config))
    }

    #[tokio::test]
    async fn provisions_through_every_state() {
        let api = Arc::new(FakeCluster::new());
        let task = KernelTask::spawn(
            backend(api.clone(), CloudConfig::default()),
            "python3",
            resources_for("1"),
            None,
        );
        task.lifecycle().wait_ready().await.unwrap();

        let states: Vec<String> = task
            .lifecycle()
            .history()
            .into_iter()
            .map(|h| h.event)
            .filter(|e| e != "DEFINITION_REMOVED")
            .collect();
        let expected: Vec<String> = KernelState::ORDER[..=12]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(states, expected);
        assert_eq!(api.calls("DeregisterTaskDefinition"), 1);
        assert!(task.matches(&task.id()));
        assert_eq!(task.summary().id, task.id());
        assert!(task.summary().reserve);
    }

    #[tokio::test]
    async fn run_task_failure_enters_error_and_frees_ports() {
        let api = Arc::new(FakeCluster::new());
        api.fail_run_task("RESOURCE:MEMORY");
        let backend = backend(api.clone(), CloudConfig::default());
        let task = KernelTask::spawn(Arc::clone(&backend), "ir", resources_for("1"), None);
        let err = task.lifecycle().wait_ready().await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Backend("Task couldn't be created. Reason: RESOURCE:MEMORY".into())
        );
        assert_eq!(task.state(), KernelState::Error);
        assert_eq!(backend.allocator.find_available_ports(1).await.unwrap(), vec![5000]);
        assert_eq!(task.kill().await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn kill_stops_the_task_once() {
        let api = Arc::new(FakeCluster::new());
        let task = KernelTask::spawn(
            backend(api.clone(), CloudConfig::default()),
            "ir",
            resources_for("1"),
            Some(test_user()),
        );
        let (a, b) = tokio::join!(task.kill(), task.kill());
        a.unwrap();
        b.unwrap();
        assert_eq!(task.state(), KernelState::Dead);
        assert_eq!(api.calls("StopTask"), 1);
    }

    #[tokio::test]
    async fn packages_are_recorded_in_history() {
        let api = Arc::new(FakeCluster::new());
        let task = KernelTask::spawn(
            backend(api, CloudConfig::default()),
            "python3",
            resources_for("1"),
            None,
        );
        assert_eq!(
            task.install_package("numpy").await.unwrap_err(),
            OrchestratorError::KernelNotReady
        );
        task.lifecycle().wait_ready().await.unwrap();
        assert_eq!(task.install_package("numpy").await.unwrap(), vec!["numpy"]);
        task.remove_package("numpy").await.unwrap();
        let events: Vec<String> = task.lifecycle().history().into_iter().map(|h| h.event).collect();
        for name in ["INSTALL_PACKAGE", "PACKAGES_INSTALLED", "REMOVE_PACKAGE", "PACKAGE_REMOVED"] {
            assert!(events.iter().any(|e| e == name), "{name} missing");
        }
    }

    #[tokio::test]
    async fn filesystem_only_for_owned_kernels() {
        let api = Arc::new(FakeCluster::new());
        let config = CloudConfig {
            filesystem_enabled: true,
            ..CloudConfig::default()
        };
        let backend = backend(api.clone(), config);
        let reserve = KernelTask::spawn(Arc::clone(&backend), "ir", resources_for("1"), None);
        reserve.lifecycle().wait_ready().await.unwrap();
        assert_eq!(api.calls("CreateFileSystem"), 0);

        let owned = KernelTask::spawn(backend, "ir", resources_for("1"), Some(test_user()));
        owned.lifecycle().wait_ready().await.unwrap();
        assert_eq!(api.calls("CreateFileSystem"), 1);
        assert!(owned.lifecycle().history().iter().any(|h| h.event == "GOT_FS"));
    }
}
