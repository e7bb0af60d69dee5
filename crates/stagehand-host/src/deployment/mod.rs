//! Deployment providers: where kernels physically run.
//!
//! One provider is picked at startup from [`OrchestratorConfig::deployment`].
//! Everything above this layer only sees [`DeploymentProvider`].

pub mod cloud;
pub mod container;
pub mod local_process;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::{DeploymentKind, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::jobs::JobProgress;
use crate::kernel::catalog::{Resources, resources_for};
use crate::kernel::lifecycle::HistoryEvent;
use crate::runtime::{ExecutionResult, HttpKernelGateway, KernelGateway, RuntimeHandle};
use crate::store::UserRef;
use crate::util::now_wallclock_ns;

pub use cloud::reserve::{ReserveConfig, ReserveUpdate};
pub use cloud::CloudProvider;
pub use container::{ContainerEngine, ContainerProvider, DockerCli};
pub use local_process::LocalProcessProvider;

/// Who a kernel is for and how big it should be.
#[derive(Clone)]
pub struct StartContext {
    pub kernel_id: Uuid,
    pub owner: Option<UserRef>,
    pub scope: String,
    pub resources: Resources,
    pub progress: Option<JobProgress>,
}

impl StartContext {
    pub fn new(owner: Option<UserRef>, scope: &str, resource_class: &str) -> Self {
        Self {
            kernel_id: Uuid::new_v4(),
            owner,
            scope: scope.to_string(),
            resources: resources_for(resource_class),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: JobProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn report(&self, finished: u32, message: &str, data: Value) {
        if let Some(progress) = &self.progress {
            progress.report(finished, message, data);
        }
    }
}

/// Monitoring view of one kernel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub history: Vec<HistoryEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<UserRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub reserve: bool,
}

/// Status record kept by providers that have no lifecycle state machine.
#[derive(Debug, Clone)]
pub(crate) struct KernelRecord {
    pub id: String,
    pub runtime: String,
    pub owner: Option<UserRef>,
    pub scope: String,
    pub status: String,
    pub history: Vec<HistoryEvent>,
}

impl KernelRecord {
    pub fn new(id: &str, runtime: &str, ctx: &StartContext, status: &str) -> Self {
        let mut record = Self {
            id: id.to_string(),
            runtime: runtime.to_string(),
            owner: ctx.owner.clone(),
            scope: ctx.scope.clone(),
            status: String::new(),
            history: Vec::new(),
        };
        record.set_status(status, None);
        record
    }

    pub fn set_status(&mut self, status: &str, data: Option<Value>) {
        self.status = status.to_string();
        self.note(status, data);
    }

    /// History entry that leaves the status alone.
    pub fn note(&mut self, event: &str, data: Option<Value>) {
        self.history.push(HistoryEvent {
            event: event.to_string(),
            data,
            at_ns: now_wallclock_ns(),
        });
    }

    pub fn summary(&self) -> KernelSummary {
        KernelSummary {
            id: self.id.clone(),
            name: self.runtime.clone(),
            status: self.status.clone(),
            history: self.history.clone(),
            owner: self.owner.clone(),
            scope: Some(self.scope.clone()),
            reserve: false,
        }
    }
}

/// History payload of a finished evaluation.
pub(crate) fn response_data(outcome: &Result<ExecutionResult>) -> Value {
    match outcome {
        Ok(result) => json!({
            "output": result.output,
            "error": result.error,
            "stderr": result.stderr,
        }),
        Err(err) => json!({ "failed": err.to_string() }),
    }
}

fn no_package_management() -> OrchestratorError {
    OrchestratorError::Unsupported("deployment driver doesn't support package management".into())
}

#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    fn kind(&self) -> DeploymentKind;

    /// One-time backend setup. Safe to call repeatedly.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Provision a runtime for `runtime_name` and return a connected handle.
    async fn start_kernel(
        &self,
        runtime_name: &str,
        ctx: StartContext,
    ) -> Result<Arc<dyn RuntimeHandle>>;

    async fn shutdown_kernel(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<()>;

    async fn install_package(
        &self,
        _runtime: &Arc<dyn RuntimeHandle>,
        _package: &str,
    ) -> Result<Vec<String>> {
        Err(no_package_management())
    }

    async fn remove_package(
        &self,
        _runtime: &Arc<dyn RuntimeHandle>,
        _package: &str,
    ) -> Result<String> {
        Err(no_package_management())
    }

    /// Note code about to be evaluated on `runtime` in its kernel history.
    fn on_eval(&self, _runtime: &Arc<dyn RuntimeHandle>, _code: &str) {}

    /// Note the outcome of an evaluation on `runtime`.
    fn on_response(&self, _runtime: &Arc<dyn RuntimeHandle>, _outcome: &Result<ExecutionResult>) {}

    fn status(&self) -> Vec<KernelSummary>;

    async fn kill(&self, id: &str) -> Result<()> {
        Err(OrchestratorError::Unsupported(format!(
            "{} deployment cannot kill kernel {id}",
            self.kind().as_str()
        )))
    }

    /// Drop finished kernels from the provider's tables.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn reserve_config(&self) -> Option<ReserveConfig> {
        None
    }

    async fn set_reserve_config(&self, _update: ReserveUpdate) -> Result<ReserveConfig> {
        Err(OrchestratorError::Unsupported(format!(
            "{} deployment keeps no reserve",
            self.kind().as_str()
        )))
    }

    /// Release backend-wide resources on process exit.
    async fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the provider named by the configuration.
pub fn build_provider(config: &OrchestratorConfig) -> Result<Arc<dyn DeploymentProvider>> {
    tracing::info!(deployment = config.deployment.as_str(), "selecting deployment provider");
    Ok(match config.deployment {
        DeploymentKind::LocalProcess => Arc::new(LocalProcessProvider::new(config.local.clone())),
        DeploymentKind::Container => {
            let gateway: Arc<dyn KernelGateway> = Arc::new(HttpKernelGateway::new(&config.gateway)?);
            let engine: Arc<dyn ContainerEngine> =
                Arc::new(DockerCli::new(&config.container.docker_bin));
            Arc::new(ContainerProvider::new(engine, gateway, config.container.clone()))
        }
        DeploymentKind::Cloud => {
            let gateway: Arc<dyn KernelGateway> = Arc::new(HttpKernelGateway::new(&config.gateway)?);
            let api = Arc::new(cloud::api::GatewayClusterApi::new(
                &config.cloud.api_endpoint,
                config.gateway.timeout,
            )?);
            Arc::new(CloudProvider::new(api, gateway, config.cloud.clone()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_each_provider_kind() {
        let mut config = OrchestratorConfig::default();
        for kind in [
            DeploymentKind::LocalProcess,
            DeploymentKind::Container,
            DeploymentKind::Cloud,
        ] {
            config.deployment = kind;
            let provider = build_provider(&config).unwrap();
            assert_eq!(provider.kind(), kind);
        }
    }

    #[test]
    fn record_tracks_status_history() {
        let ctx = StartContext::new(None, "p1", "3");
        assert_eq!(ctx.resources.memory_mb, 3800);
        let mut record = KernelRecord::new("k1", "python3", &ctx, "CREATING_KERNEL");
        record.set_status("READY", None);
        let summary = record.summary();
        assert_eq!(summary.status, "READY");
        assert_eq!(summary.history.len(), 2);
        assert_eq!(summary.scope.as_deref(), Some("p1"));
    }
}
