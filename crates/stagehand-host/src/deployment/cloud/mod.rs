//! Kernels as tasks on a managed container cluster.
//!
//! Every kernel is a [`KernelTask`] walking the lifecycle state machine.
//! The provider keeps the table of live tasks and, on launch types that can
//! pre-warm, a pool of unassigned reserve kernels sized by [`ReserveConfig`].

pub mod allocator;
pub mod api;
pub mod cluster;
pub mod filesystem;
pub mod reserve;
pub mod task;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::OnceCell;

use self::allocator::ResourceAllocator;
use self::api::ClusterApi;
use self::cluster::ClusterConfiguration;
use self::filesystem::SharedFileSystems;
use self::reserve::{ReserveConfig, ReservePool, ReserveUpdate};
use self::task::KernelTask;
use super::{DeploymentProvider, KernelSummary, StartContext, response_data};
use crate::config::{CloudConfig, DeploymentKind};
use crate::error::{OrchestratorError, Result};
use crate::kernel::catalog::{DEFAULT_RESOURCE_CLASS, resources_for};
use crate::kernel::lifecycle::{KernelState, LifecycleEvent};
use crate::runtime::{ExecutionResult, KernelGateway, RuntimeHandle};

/// Services every cloud kernel shares.
pub(crate) struct Backend {
    pub api: Arc<dyn ClusterApi>,
    pub gateway: Arc<dyn KernelGateway>,
    pub cluster: Arc<ClusterConfiguration>,
    pub allocator: Arc<ResourceAllocator>,
    pub filesystems: SharedFileSystems,
    pub config: CloudConfig,
}

impl Backend {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        gateway: Arc<dyn KernelGateway>,
        config: CloudConfig,
    ) -> Self {
        let cluster = Arc::new(ClusterConfiguration::new(Arc::clone(&api), &config));
        let allocator = Arc::new(ResourceAllocator::new(
            Arc::clone(&api),
            Arc::clone(&cluster),
            &config,
        ));
        let filesystems =
            SharedFileSystems::new(Arc::clone(&api), Arc::clone(&cluster), Arc::clone(&allocator));
        Self {
            api,
            gateway,
            cluster,
            allocator,
            filesystems,
            config,
        }
    }
}

pub struct CloudProvider {
    backend: Arc<Backend>,
    live: Mutex<Vec<Arc<KernelTask>>>,
    reserves: Mutex<ReservePool<Arc<KernelTask>>>,
    reserve_config: Mutex<ReserveConfig>,
    initialized: OnceCell<()>,
}

impl CloudProvider {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        gateway: Arc<dyn KernelGateway>,
        config: CloudConfig,
    ) -> Self {
        let reserve_config = config.reserve.clone();
        Self {
            backend: Arc::new(Backend::new(api, gateway, config)),
            live: Mutex::new(Vec::new()),
            reserves: Mutex::new(ReservePool::new()),
            reserve_config: Mutex::new(reserve_config),
            initialized: OnceCell::new(),
        }
    }

    fn live(&self) -> MutexGuard<'_, Vec<Arc<KernelTask>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserves(&self) -> MutexGuard<'_, ReservePool<Arc<KernelTask>>> {
        self.reserves.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self) -> MutexGuard<'_, ReserveConfig> {
        self.reserve_config.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create(&self, runtime_name: &str, ctx: Option<&StartContext>) -> Arc<KernelTask> {
        let (resources, owner) = match ctx {
            Some(ctx) => (ctx.resources, ctx.owner.clone()),
            None => (resources_for(DEFAULT_RESOURCE_CLASS), None),
        };
        let task = KernelTask::spawn(Arc::clone(&self.backend), runtime_name, resources, owner);
        self.live().push(Arc::clone(&task));
        task
    }

    /// A reserve kernel of the same runtime and size, or a fresh one.
    pub fn allocate(&self, runtime_name: &str, ctx: &StartContext) -> Arc<KernelTask> {
        let reserved = self.reserves().take(runtime_name, |k| {
            k.resources() == ctx.resources && k.state() <= KernelState::Ready
        });
        let task = match reserved {
            Some(task) => {
                tracing::info!(kernel = %task.id(), runtime = runtime_name, "reserve kernel assigned");
                task
            }
            None => self.create(runtime_name, Some(ctx)),
        };
        task.assign(ctx.owner.clone(), &ctx.scope);
        self.setup_reserves();
        task
    }

    /// Top the reserve pool up to its targets. Surplus reserves stay idle.
    pub fn setup_reserves(&self) {
        if !self.backend.config.launch_type.supports_prewarm() {
            return;
        }
        let assigned = self
            .live()
            .iter()
            .filter(|k| k.is_assigned() && !k.state().is_terminal())
            .count();
        let targets = self
            .config()
            .targets(u32::try_from(assigned).unwrap_or(u32::MAX));
        let mut reserves = self.reserves();
        for (runtime_name, missing) in reserves.deficits(&targets) {
            tracing::debug!(runtime = %runtime_name, missing, "creating reserve kernels");
            for _ in 0..missing {
                let task = self.create(&runtime_name, None);
                reserves.push(&runtime_name, task);
            }
        }
    }

    fn find(&self, runtime: &Arc<dyn RuntimeHandle>) -> Option<Arc<KernelTask>> {
        self.live().iter().find(|k| k.runs(runtime)).cloned()
    }

    fn find_for_packages(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<Arc<KernelTask>> {
        self.find(runtime)
            .ok_or_else(|| OrchestratorError::ResourceNotFound("Kernel task couldn't be found".into()))
    }
}

#[async_trait]
impl DeploymentProvider for CloudProvider {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::Cloud
    }

    async fn init(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.backend.cluster.get().await?;
                self.setup_reserves();
                Ok::<_, OrchestratorError>(())
            })
            .await
            .map(|_| ())
    }

    async fn start_kernel(
        &self,
        runtime_name: &str,
        ctx: StartContext,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        self.init().await?;
        let task = self.allocate(runtime_name, &ctx);
        let lifecycle = task.lifecycle();
        let mut events = lifecycle.subscribe();
        let ready = lifecycle.wait_ready();
        tokio::pin!(ready);
        let mut finished = KernelState::ORDER
            .iter()
            .position(|s| *s == lifecycle.state())
            .unwrap_or_default() as u32;
        loop {
            tokio::select! {
                outcome = &mut ready => {
                    outcome?;
                    lifecycle.ensure_ready()?;
                    break;
                }
                Ok(event) = events.recv() => {
                    if let LifecycleEvent::State(state) = event {
                        finished += 1;
                        ctx.report(finished, state.as_str(), json!({ "kernel": task.id() }));
                    }
                }
            }
        }
        lifecycle
            .runtime()
            .ok_or_else(|| OrchestratorError::Internal("ready kernel without runtime".into()))
    }

    async fn shutdown_kernel(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<()> {
        match self.find(runtime) {
            Some(task) => task.kill().await,
            None => {
                tracing::debug!(runtime_id = %runtime.id(), "no cloud kernel runs this runtime");
                Ok(())
            }
        }
    }

    async fn install_package(
        &self,
        runtime: &Arc<dyn RuntimeHandle>,
        package: &str,
    ) -> Result<Vec<String>> {
        self.find_for_packages(runtime)?.install_package(package).await
    }

    async fn remove_package(&self, runtime: &Arc<dyn RuntimeHandle>, package: &str) -> Result<String> {
        self.find_for_packages(runtime)?.remove_package(package).await
    }

    fn on_eval(&self, runtime: &Arc<dyn RuntimeHandle>, code: &str) {
        if let Some(task) = self.find(runtime) {
            task.lifecycle().record("CODE", Some(json!(code)));
        }
    }

    fn on_response(&self, runtime: &Arc<dyn RuntimeHandle>, outcome: &Result<ExecutionResult>) {
        if let Some(task) = self.find(runtime) {
            task.lifecycle().record("RESPONSE", Some(response_data(outcome)));
        }
    }

    fn status(&self) -> Vec<KernelSummary> {
        self.live().iter().map(|k| k.summary()).collect()
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let task = self
            .live()
            .iter()
            .find(|k| k.matches(id))
            .cloned()
            .ok_or_else(|| OrchestratorError::ResourceNotFound(format!("kernel {id}")))?;
        self.reserves().prune(|k| !Arc::ptr_eq(k, &task));
        task.kill().await
    }

    /// Drop finished kernels, then replenish the reserve.
    async fn flush(&self) -> Result<()> {
        let finished = |k: &Arc<KernelTask>| k.state().is_terminal();
        let dropped = {
            let mut live = self.live();
            let before = live.len();
            live.retain(|k| !finished(k));
            before - live.len()
        };
        self.reserves().prune(|k| !finished(k));
        tracing::debug!(dropped, "flushed cloud kernels");
        self.setup_reserves();
        Ok(())
    }

    fn reserve_config(&self) -> Option<ReserveConfig> {
        Some(self.config().clone())
    }

    async fn set_reserve_config(&self, update: ReserveUpdate) -> Result<ReserveConfig> {
        let config = {
            let mut config = self.config();
            config.apply(&update);
            config.clone()
        };
        tracing::info!(max_kernels = config.max_kernels, shares = ?config.shares, "reserve config updated");
        self.setup_reserves();
        Ok(config)
    }

    /// Stop the reserve kernels; assigned ones are released by their sessions.
    async fn destroy(&self) -> Result<()> {
        let reserves: Vec<Arc<KernelTask>> = self.reserves().drain().collect();
        for (task, outcome) in reserves
            .iter()
            .zip(join_all(reserves.iter().map(|task| task.kill())).await)
        {
            if let Err(err) = outcome {
                tracing::warn!(kernel = %task.id(), error = %err, "reserve kernel did not stop");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchType;
    use crate::testkit::{FakeCluster, MockGateway, test_user};
    use std::collections::BTreeMap;

    fn provider(api: Arc<FakeCluster>, reserve: &[(&str, u32)]) -> CloudProvider {
        let config = CloudConfig {
            reserve: ReserveConfig {
                max_kernels: 10,
                shares: reserve.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            },
            ..CloudConfig::default()
        };
        CloudProvider::new(api, Arc::new(MockGateway::new()), config)
    }

    fn ctx() -> StartContext {
        StartContext::new(Some(test_user()), "p1", "1")
    }

    #[tokio::test]
    async fn start_kernel_without_reserve_creates_one() {
        let api = Arc::new(FakeCluster::new());
        let provider = provider(api.clone(), &[]);
        let runtime = provider.start_kernel("python3", ctx()).await.unwrap();
        let status = provider.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, "READY");
        assert_eq!(status[0].scope.as_deref(), Some("p1"));
        assert!(!status[0].reserve);

        provider.shutdown_kernel(&runtime).await.unwrap();
        assert_eq!(provider.status()[0].status, "DEAD");
        provider.flush().await.unwrap();
        assert!(provider.status().is_empty());
    }

    #[tokio::test]
    async fn evaluations_land_in_the_task_history() {
        let api = Arc::new(FakeCluster::new());
        let provider = provider(api.clone(), &[]);
        let runtime = provider.start_kernel("python3", ctx()).await.unwrap();
        provider.on_eval(&runtime, "1 + 1");
        provider.on_response(&runtime, &Ok(ExecutionResult::for_code("1 + 1")));

        let history = &provider.status()[0].history;
        let code = history.iter().find(|e| e.event == "CODE").unwrap();
        assert_eq!(code.data, Some(json!("1 + 1")));
        assert!(history.iter().any(|e| e.event == "RESPONSE"));
    }

    #[tokio::test]
    async fn reserve_kernels_are_reused_and_replenished() {
        let api = Arc::new(FakeCluster::new());
        let provider = provider(api.clone(), &[("ir", 1)]);
        provider.init().await.unwrap();
        assert_eq!(provider.status().len(), 1);
        let reserve_id = provider.status()[0].id.clone();

        provider.start_kernel("ir", ctx()).await.unwrap();
        let status = provider.status();
        assert_eq!(status.len(), 2);
        let assigned: Vec<_> = status.iter().filter(|k| !k.reserve).collect();
        assert_eq!(assigned.len(), 1);
        assert!(provider.live()[0].matches(&reserve_id));
        assert!(provider.live()[0].is_assigned());
    }

    #[tokio::test]
    async fn ec2_keeps_no_reserve() {
        let api = Arc::new(FakeCluster::new());
        let config = CloudConfig {
            launch_type: LaunchType::Ec2,
            reserve: ReserveConfig {
                max_kernels: 10,
                shares: BTreeMap::from([("ir".to_string(), 3)]),
            },
            ..CloudConfig::default()
        };
        let provider = CloudProvider::new(api.clone(), Arc::new(MockGateway::new()), config);
        provider.init().await.unwrap();
        assert!(provider.status().is_empty());
        provider.start_kernel("ir", ctx()).await.unwrap();
        assert_eq!(provider.status().len(), 1);
    }

    #[tokio::test]
    async fn reserve_config_updates_trigger_setup() {
        let api = Arc::new(FakeCluster::new());
        let provider = provider(api.clone(), &[]);
        provider.init().await.unwrap();
        assert!(provider.status().is_empty());
        let config = provider
            .set_reserve_config(ReserveUpdate {
                max_kernels: None,
                shares: BTreeMap::from([("python3".to_string(), 2)]),
            })
            .await
            .unwrap();
        assert_eq!(config.shares["python3"], 2);
        assert_eq!(provider.status().len(), 2);
        assert!(provider.status().iter().all(|k| k.reserve));
    }

    #[tokio::test]
    async fn kill_by_id_and_unknown_id() {
        let api = Arc::new(FakeCluster::new());
        let provider = provider(api.clone(), &[]);
        provider.start_kernel("ir", ctx()).await.unwrap();
        let id = provider.status()[0].id.clone();
        provider.kill(&id).await.unwrap();
        assert_eq!(provider.status()[0].status, "DEAD");
        assert!(matches!(
            provider.kill("nope").await,
            Err(OrchestratorError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn killed_reserve_is_never_assigned() {
        let api = Arc::new(FakeCluster::new());
        let provider = provider(api.clone(), &[("ir", 1)]);
        provider.init().await.unwrap();
        let reserve = Arc::clone(&provider.live()[0]);
        reserve.lifecycle().wait_ready().await.unwrap();

        provider.kill(&reserve.id()).await.unwrap();
        assert_eq!(reserve.state(), KernelState::Dead);
        assert_eq!(provider.reserves().len("ir"), 0);

        let runtime = provider.start_kernel("ir", ctx()).await.unwrap();
        assert!(!reserve.runs(&runtime));
        let assigned = provider
            .live()
            .iter()
            .find(|k| k.runs(&runtime))
            .cloned()
            .unwrap();
        assert_eq!(assigned.state(), KernelState::Ready);
        assert!(assigned.is_assigned());
    }

    #[tokio::test]
    async fn dead_assigned_kernels_do_not_shrink_the_reserve() {
        let api = Arc::new(FakeCluster::new());
        let provider = CloudProvider::new(
            api.clone(),
            Arc::new(MockGateway::new()),
            CloudConfig {
                reserve: ReserveConfig {
                    max_kernels: 2,
                    shares: BTreeMap::from([("ir".to_string(), 2)]),
                },
                ..CloudConfig::default()
            },
        );
        provider.init().await.unwrap();
        let runtime = provider.start_kernel("ir", ctx()).await.unwrap();
        assert_eq!(provider.reserves().len("ir"), 1);

        provider.shutdown_kernel(&runtime).await.unwrap();
        provider.setup_reserves();
        // Budget is back to two while the dead kernel still sits in the table.
        assert_eq!(provider.reserves().len("ir"), 2);
    }

    #[tokio::test]
    async fn failed_reserve_is_skipped_and_flushed() {
        let api = Arc::new(FakeCluster::new());
        api.fail_run_task("capacity");
        let provider = provider(api.clone(), &[("ir", 1)]);
        provider.init().await.unwrap();
        let reserve = Arc::clone(&provider.live()[0]);
        assert!(reserve.lifecycle().wait_ready().await.is_err());

        api.clear_failures();
        provider.flush().await.unwrap();
        assert_eq!(provider.status().len(), 1);
        assert!(!provider.live()[0].matches(&reserve.id()));
    }
}
