//! In-memory stand-ins for runtimes, providers and backends.
//!
//! Compiled for unit tests and, through the `test-fixtures` feature, for the
//! integration tests under `tests/`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::DeploymentKind;
use crate::deployment::cloud::api::{
    Attachment, AttachmentDetail, ClusterApi, ContainerDescription, FileSystemDescription,
    PortMapping, ResourceKind, RunTaskRequest, RunTaskResponse, SecurityGroup, TaskDefinition,
    TaskDescription, TaskFailure,
};
use crate::deployment::container::{ContainerEngine, ContainerSpec, ContainerState};
use crate::deployment::{
    DeploymentProvider, KernelRecord, KernelSummary, StartContext, response_data,
};
use crate::error::{OrchestratorError, Result};
use crate::runtime::{
    ConfigRequest, Endpoint, Execution, ExecutionEvent, ExecutionResult, KernelGateway,
    RuntimeHandle, RuntimeStatus,
};
use crate::store::UserRef;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn test_user() -> UserRef {
    UserRef {
        email: "ada@example.com".into(),
        ..UserRef::new("u1", "Ada")
    }
}

/// Echoes code back as `text/plain` output. Code starting with `raise`
/// produces an error event instead. Lines of the form `name = value` are
/// reported as globals.
pub struct MockRuntime {
    id: String,
    name: String,
    delay: Option<Duration>,
    status: watch::Sender<RuntimeStatus>,
    executed: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new(name: &str) -> Self {
        let (status, _) = watch::channel(RuntimeStatus::Idle);
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            delay: None,
            status,
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Every execution takes `delay` before it completes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn set_status(&self, status: RuntimeStatus) {
        self.status.send_replace(status);
    }
}

#[async_trait]
impl RuntimeHandle for MockRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, code: &str) -> Result<Execution> {
        if *self.status.borrow() == RuntimeStatus::Dead {
            return Err(OrchestratorError::KernelDead);
        }
        lock(&self.executed).push(code.to_string());
        let (mut sink, execution) = Execution::channel(code);
        sink.result_mut().globals = code
            .lines()
            .filter_map(|line| line.split_once(" = "))
            .map(|(name, value)| json!({ "name": name.trim(), "content": value.trim() }))
            .collect();
        let event = if code.starts_with("raise") {
            ExecutionEvent::Error(json!({ "ename": "Error", "evalue": code }))
        } else {
            ExecutionEvent::Output(json!({ "data": { "text/plain": code } }))
        };
        let delay = self.delay;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            sink.emit(event);
            sink.complete();
        });
        Ok(execution)
    }

    async fn interrupt(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.status.send_replace(RuntimeStatus::Dead);
        Ok(())
    }

    fn status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.subscribe()
    }
}

/// Provider that hands out [`MockRuntime`]s.
pub struct MockProvider {
    failure: Option<String>,
    start_delay: Option<Duration>,
    exec_delay: Option<Duration>,
    started: AtomicUsize,
    stopped: AtomicUsize,
    records: Mutex<Vec<KernelRecord>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            failure: None,
            start_delay: None,
            exec_delay: None,
            started: AtomicUsize::new(0),
            stopped: AtomicUsize::new(0),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Every start fails with a backend error carrying `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new()
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeploymentProvider for MockProvider {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::LocalProcess
    }

    async fn start_kernel(
        &self,
        runtime_name: &str,
        ctx: StartContext,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        ctx.report(1, "starting mock runtime", json!({ "runtime": runtime_name }));
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(OrchestratorError::Backend(message.clone()));
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut runtime = MockRuntime::new(runtime_name);
        if let Some(delay) = self.exec_delay {
            runtime = runtime.with_delay(delay);
        }
        let mut record = KernelRecord::new(&runtime.id, runtime_name, &ctx, "CREATING_KERNEL");
        record.set_status("READY", None);
        lock(&self.records).push(record);
        ctx.report(2, "mock runtime ready", Value::Null);
        Ok(Arc::new(runtime))
    }

    async fn shutdown_kernel(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        if let Some(record) = lock(&self.records).iter_mut().find(|r| r.id == runtime.id()) {
            record.set_status("DEAD", None);
        }
        runtime.shutdown().await
    }

    fn on_eval(&self, runtime: &Arc<dyn RuntimeHandle>, code: &str) {
        if let Some(record) = lock(&self.records).iter_mut().find(|r| r.id == runtime.id()) {
            record.note("CODE", Some(json!(code)));
        }
    }

    fn on_response(&self, runtime: &Arc<dyn RuntimeHandle>, outcome: &Result<ExecutionResult>) {
        if let Some(record) = lock(&self.records).iter_mut().find(|r| r.id == runtime.id()) {
            record.note("RESPONSE", Some(response_data(outcome)));
        }
    }

    fn status(&self) -> Vec<KernelSummary> {
        lock(&self.records).iter().map(KernelRecord::summary).collect()
    }
}

/// Gateway that records config handoffs and connects [`MockRuntime`]s.
#[derive(Default)]
pub struct MockGateway {
    configs: Mutex<Vec<ConfigRequest>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configs(&self) -> Vec<ConfigRequest> {
        lock(&self.configs).clone()
    }
}

#[async_trait]
impl KernelGateway for MockGateway {
    async fn create_config(&self, request: &ConfigRequest) -> Result<Value> {
        lock(&self.configs).push(request.clone());
        Ok(json!({ "kernel_id": request.id }))
    }

    async fn connect(
        &self,
        runtime_name: &str,
        _kernel_id: &str,
        _endpoint: &Endpoint,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        Ok(Arc::new(MockRuntime::new(runtime_name)))
    }

    async fn install_package(&self, _endpoint: &Endpoint, package: &str) -> Result<Vec<String>> {
        Ok(vec![package.to_string()])
    }

    async fn remove_package(&self, _endpoint: &Endpoint, package: &str) -> Result<String> {
        Ok(package.to_string())
    }
}

#[derive(Default)]
struct EngineState {
    networks: Vec<String>,
    networks_created: usize,
    containers: BTreeMap<String, (ContainerSpec, bool)>,
    next_id: usize,
}

/// Container engine kept in memory.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<EngineState>,
    hide_ips: AtomicBool,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `container_ip` report no address.
    pub fn hide_ips(&self, hide: bool) {
        self.hide_ips.store(hide, Ordering::SeqCst);
    }

    pub fn networks(&self) -> Vec<String> {
        lock(&self.state).networks.clone()
    }

    pub fn networks_created(&self) -> usize {
        lock(&self.state).networks_created
    }

    pub fn containers(&self) -> Vec<ContainerSpec> {
        lock(&self.state)
            .containers
            .values()
            .map(|(spec, _)| spec.clone())
            .collect()
    }

    fn missing(id: &str) -> OrchestratorError {
        OrchestratorError::Backend(format!("No such container: {id}"))
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn find_network(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.state).networks.iter().find(|n| *n == name).cloned())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.networks.push(name.to_string());
        state.networks_created += 1;
        Ok(name.to_string())
    }

    async fn find_container(&self, name: &str) -> Result<Option<ContainerState>> {
        Ok(lock(&self.state)
            .containers
            .iter()
            .find(|(_, (spec, _))| spec.name == name)
            .map(|(id, (_, running))| ContainerState {
                id: id.clone(),
                running: *running,
            }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = lock(&self.state);
        if !state.networks.contains(&spec.network) {
            return Err(OrchestratorError::Backend(format!(
                "network {} not found",
                spec.network
            )));
        }
        state.next_id += 1;
        let id = format!("c{}", state.next_id);
        state.containers.insert(id.clone(), (spec.clone(), false));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let (_, running) = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        *running = true;
        Ok(())
    }

    async fn container_ip(&self, _network: &str, container: &str) -> Result<Option<String>> {
        if self.hide_ips.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let state = lock(&self.state);
        Ok(state
            .containers
            .iter()
            .position(|(_, (spec, _))| spec.name == container)
            .map(|at| format!("172.18.0.{}", at + 2)))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        let (_, running) = state.containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        *running = false;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.stop_container(id).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        lock(&self.state)
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::missing(id))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        lock(&self.state).networks.retain(|n| n != name);
        Ok(())
    }
}

const FAKE_CLUSTER_ARN: &str = "arn:aws:ecs:local:000000000000:cluster/stagehand-kernels";

#[derive(Default)]
struct ClusterState {
    tasks: BTreeMap<String, TaskDescription>,
    definitions: BTreeMap<String, Vec<PortMapping>>,
    revision: u32,
    file_systems: Vec<(String, FileSystemDescription)>,
    mount_targets: usize,
    run_failure: Option<String>,
    hidden_polls: usize,
    calls: HashMap<&'static str, usize>,
}

impl ClusterState {
    fn bump(&mut self, action: &'static str) {
        *self.calls.entry(action).or_default() += 1;
    }
}

/// Cluster API kept in memory. Tasks are `RUNNING` as soon as they are
/// created; `hide_resource_for` delays their first sighting.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times `action` was called.
    pub fn calls(&self, action: &str) -> usize {
        lock(&self.state).calls.get(action).copied().unwrap_or(0)
    }

    /// A task started by someone else, bound to `host_ports`.
    pub fn add_running_task(&self, host_ports: &[u16]) -> String {
        let arn = task_arn();
        let task = TaskDescription {
            task_arn: arn.clone(),
            last_status: "RUNNING".into(),
            desired_status: "RUNNING".into(),
            containers: vec![ContainerDescription {
                name: "kernel".into(),
                network_bindings: host_ports
                    .iter()
                    .map(|p| PortMapping {
                        container_port: *p,
                        host_port: *p,
                    })
                    .collect(),
            }],
            ..TaskDescription::default()
        };
        lock(&self.state).tasks.insert(arn.clone(), task);
        arn
    }

    /// The next `polls` resource lookups see nothing.
    pub fn hide_resource_for(&self, polls: usize) {
        lock(&self.state).hidden_polls = polls;
    }

    pub fn fail_run_task(&self, reason: &str) {
        lock(&self.state).run_failure = Some(reason.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).run_failure = None;
    }
}

fn task_arn() -> String {
    format!(
        "arn:aws:ecs:local:000000000000:task/stagehand-kernels/{}",
        Uuid::new_v4().simple()
    )
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_clusters(&self) -> Result<Vec<String>> {
        lock(&self.state).bump("ListClusters");
        Ok(vec![FAKE_CLUSTER_ARN.to_string()])
    }

    async fn describe_security_groups(&self, group_name: &str) -> Result<Vec<SecurityGroup>> {
        lock(&self.state).bump("DescribeSecurityGroups");
        Ok(if group_name == "stagehand-kernels" {
            vec![SecurityGroup {
                group_id: "sg-1".into(),
                vpc_id: "vpc-1".into(),
            }]
        } else {
            Vec::new()
        })
    }

    async fn describe_subnets(&self, _vpc_id: &str) -> Result<Vec<String>> {
        lock(&self.state).bump("DescribeSubnets");
        Ok(vec!["subnet-a".into(), "subnet-b".into()])
    }

    async fn list_tasks(&self, _cluster: &str) -> Result<Vec<String>> {
        let mut state = lock(&self.state);
        state.bump("ListTasks");
        Ok(state
            .tasks
            .values()
            .filter(|t| t.last_status != "STOPPED")
            .map(|t| t.task_arn.clone())
            .collect())
    }

    async fn describe_tasks(&self, _cluster: &str, tasks: &[String]) -> Result<Vec<TaskDescription>> {
        let mut state = lock(&self.state);
        state.bump("DescribeTasks");
        Ok(tasks.iter().filter_map(|arn| state.tasks.get(arn).cloned()).collect())
    }

    async fn register_task_definition(&self, definition: &TaskDefinition) -> Result<String> {
        let mut state = lock(&self.state);
        state.bump("RegisterTaskDefinition");
        state.revision += 1;
        let name = format!("{}:{}", definition.family, state.revision);
        state
            .definitions
            .insert(name.clone(), definition.port_mappings.clone());
        Ok(name)
    }

    async fn deregister_task_definition(&self, definition: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.bump("DeregisterTaskDefinition");
        state.definitions.remove(definition);
        Ok(())
    }

    async fn run_task(&self, request: &RunTaskRequest) -> Result<RunTaskResponse> {
        let mut state = lock(&self.state);
        state.bump("RunTask");
        if let Some(reason) = &state.run_failure {
            return Ok(RunTaskResponse {
                tasks: Vec::new(),
                failures: vec![TaskFailure {
                    reason: reason.clone(),
                }],
            });
        }
        let bindings = state
            .definitions
            .get(&request.task_definition)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::ResourceNotFound(format!(
                    "task definition {}",
                    request.task_definition
                ))
            })?;
        let arn = task_arn();
        let task = TaskDescription {
            task_arn: arn.clone(),
            last_status: "RUNNING".into(),
            desired_status: "RUNNING".into(),
            container_instance_arn: Some(
                "arn:aws:ecs:local:000000000000:container-instance/ci-1".into(),
            ),
            containers: vec![ContainerDescription {
                name: request.container_name.clone(),
                network_bindings: bindings,
            }],
            attachments: vec![Attachment {
                kind: "ElasticNetworkInterface".into(),
                details: vec![AttachmentDetail {
                    name: "networkInterfaceId".into(),
                    value: format!("eni-{}", state.tasks.len() + 1),
                }],
            }],
        };
        state.tasks.insert(arn, task.clone());
        Ok(RunTaskResponse {
            tasks: vec![task],
            failures: Vec::new(),
        })
    }

    async fn stop_task(&self, _cluster: &str, task: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.bump("StopTask");
        let found = state
            .tasks
            .get_mut(task)
            .ok_or_else(|| OrchestratorError::ResourceNotFound(format!("task {task}")))?;
        found.last_status = "STOPPED".into();
        found.desired_status = "STOPPED".into();
        Ok(())
    }

    async fn network_interface_ip(&self, interface_id: &str) -> Result<Option<String>> {
        lock(&self.state).bump("DescribeNetworkInterface");
        let n = interface_id.trim_start_matches("eni-");
        Ok(Some(format!("54.0.0.{n}")))
    }

    async fn container_instance_ip(
        &self,
        _cluster: &str,
        _container_instance: &str,
    ) -> Result<Option<String>> {
        lock(&self.state).bump("DescribeContainerInstanceIp");
        Ok(Some("10.1.0.1".into()))
    }

    async fn describe_file_systems(&self, creation_token: &str) -> Result<Vec<FileSystemDescription>> {
        let mut state = lock(&self.state);
        state.bump("DescribeFileSystems");
        Ok(state
            .file_systems
            .iter()
            .filter(|(token, _)| token == creation_token)
            .map(|(_, fs)| fs.clone())
            .collect())
    }

    async fn create_file_system(&self, creation_token: &str) -> Result<String> {
        let mut state = lock(&self.state);
        state.bump("CreateFileSystem");
        let id = format!("fs-{}", state.file_systems.len() + 1);
        state.file_systems.push((
            creation_token.to_string(),
            FileSystemDescription {
                file_system_id: id.clone(),
                life_cycle_state: "available".into(),
            },
        ));
        Ok(id)
    }

    async fn create_mount_target(
        &self,
        file_system_id: &str,
        _subnet_id: &str,
        _security_groups: &[String],
    ) -> Result<String> {
        let mut state = lock(&self.state);
        state.bump("CreateMountTarget");
        state.mount_targets += 1;
        Ok(format!("fsmt-{file_system_id}-{}", state.mount_targets))
    }

    async fn describe_resource(
        &self,
        _cluster: &str,
        kind: ResourceKind,
        id: &str,
    ) -> Result<Option<String>> {
        let mut state = lock(&self.state);
        state.bump("DescribeResource");
        if state.hidden_polls > 0 {
            state.hidden_polls -= 1;
            return Ok(None);
        }
        match kind {
            ResourceKind::Task => state
                .tasks
                .get(id)
                .map(|t| Some(t.last_status.clone()))
                .ok_or_else(|| OrchestratorError::ResourceNotFound(format!("task {id}"))),
            ResourceKind::FileSystem | ResourceKind::MountTarget => Ok(Some("available".into())),
        }
    }
}
