//! Wires the provider, registry and session manager into one handle.

use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::deployment::{DeploymentProvider, build_provider};
use crate::error::Result;
use crate::jobs::JobQueue;
use crate::queue::QueueConfig;
use crate::registry::KernelRegistry;
use crate::session::SessionManager;
use crate::store::{MemoryStore, SessionStore};

/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub provider: Arc<dyn DeploymentProvider>,
    pub jobs: Arc<JobQueue>,
    pub registry: Arc<KernelRegistry>,
    pub sessions: Arc<SessionManager>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn DeploymentProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let jobs = Arc::new(JobQueue::new());
        let registry = Arc::new(KernelRegistry::new(
            Arc::clone(&provider),
            Arc::clone(&jobs),
            config.detach_grace,
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            Arc::clone(&registry),
            QueueConfig::from(&config),
        ));
        Self {
            config,
            provider,
            jobs,
            registry,
            sessions,
        }
    }

    /// Provider picked by `config.deployment`, sessions kept in memory.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let provider = build_provider(&config)?;
        Ok(Self::new(config, provider, Arc::new(MemoryStore::new())))
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.sessions.store()
    }

    /// Tear everything down: sessions, then kernels, then the backend.
    pub async fn shutdown(&self) {
        self.sessions.shutdown_all().await;
        self.registry.shutdown_all().await;
        if let Err(err) = self.provider.destroy().await {
            tracing::warn!(error = %err, "provider teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeploymentKind;
    use crate::testkit::MockProvider;

    #[tokio::test]
    async fn shutdown_stops_attached_kernels() {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            provider.clone(),
            Arc::new(MemoryStore::new()),
        );
        let queue = orchestrator.sessions.get_or_create("s1", None);
        queue.attach_kernel("Python", None).await.unwrap();
        assert_eq!(provider.started(), 1);

        orchestrator.shutdown().await;
        assert!(orchestrator.sessions.sessions().is_empty());
        assert_eq!(provider.stopped(), 1);
    }

    #[test]
    fn from_config_uses_configured_deployment() {
        let orchestrator = Orchestrator::from_config(OrchestratorConfig::default()).unwrap();
        assert_eq!(orchestrator.provider.kind(), DeploymentKind::LocalProcess);
    }
}
