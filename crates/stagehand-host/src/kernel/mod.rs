//! Session-facing kernel: one interactive runtime of a given type, shared by
//! every session of a scope.

pub mod catalog;
pub mod lifecycle;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{OnceCell, broadcast, watch};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::deployment::{DeploymentProvider, StartContext};
use crate::error::{ErrorReport, OrchestratorError, Result};
use crate::jobs::{JobEvent, JobQueue};
use crate::runtime::{Execution, MarkupRuntime, RuntimeHandle, RuntimeStatus};
use crate::store::UserRef;
use crate::util::now_wallclock_ns;

use self::catalog::{KernelSpec, resources_for};

const KERNEL_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelStatus {
    Initialization,
    Starting,
    Idle,
    Busy,
    Restarting,
    ShuttingDown,
    Dead,
    Error,
}

impl From<RuntimeStatus> for KernelStatus {
    fn from(status: RuntimeStatus) -> Self {
        match status {
            RuntimeStatus::Starting => KernelStatus::Starting,
            RuntimeStatus::Idle => KernelStatus::Idle,
            RuntimeStatus::Busy => KernelStatus::Busy,
            RuntimeStatus::Restarting => KernelStatus::Restarting,
            RuntimeStatus::Dead => KernelStatus::Dead,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelEvent {
    Status(KernelStatus),
    CreationProgress {
        finished: u32,
        message: String,
        data: Value,
    },
    CreationFailed(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelInfo {
    pub id: Uuid,
    pub language: &'static str,
    pub status: KernelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub struct Kernel {
    id: Uuid,
    spec: &'static KernelSpec,
    owner: Option<UserRef>,
    scope: String,
    resource_class: String,
    provider: Arc<dyn DeploymentProvider>,
    jobs: Arc<JobQueue>,
    runtime: OnceLock<Arc<dyn RuntimeHandle>>,
    init: OnceCell<Result<()>>,
    init_started: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: OnceCell<Result<()>>,
    status: watch::Sender<KernelStatus>,
    events: broadcast::Sender<KernelEvent>,
    last_activity_ns: AtomicU64,
    status_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("scope", &self.scope)
            .field("resource_class", &self.resource_class)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub fn new(
        spec: &'static KernelSpec,
        owner: Option<UserRef>,
        scope: &str,
        resource_class: &str,
        provider: Arc<dyn DeploymentProvider>,
        jobs: Arc<JobQueue>,
    ) -> Self {
        let (status, _) = watch::channel(KernelStatus::Initialization);
        let (events, _) = broadcast::channel(KERNEL_EVENT_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            spec,
            owner,
            scope: scope.to_string(),
            resource_class: resource_class.to_string(),
            provider,
            jobs,
            runtime: OnceLock::new(),
            init: OnceCell::new(),
            init_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown: OnceCell::new(),
            status,
            events,
            last_activity_ns: AtomicU64::new(now_wallclock_ns()),
            status_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &'static KernelSpec {
        self.spec
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn owner(&self) -> Option<&UserRef> {
        self.owner.as_ref()
    }

    pub fn status(&self) -> KernelStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    pub fn last_activity_ns(&self) -> u64 {
        self.last_activity_ns.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_ns.store(now_wallclock_ns(), Ordering::Relaxed);
    }

    fn set_status(&self, next: KernelStatus) {
        let closing = self.shutting_down.load(Ordering::SeqCst);
        if closing
            && !matches!(
                next,
                KernelStatus::ShuttingDown | KernelStatus::Dead | KernelStatus::Error
            )
        {
            return;
        }
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            let _ = self.events.send(KernelEvent::Status(next));
        }
    }

    /// Start the kernel. Concurrent and repeated calls share one creation.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.init_started.store(true, Ordering::SeqCst);
        self.init.get_or_init(|| self.create()).await.clone()
    }

    async fn create(self: &Arc<Self>) -> Result<()> {
        if let Some(kind) = self.spec.markup {
            let runtime: Arc<dyn RuntimeHandle> = Arc::new(MarkupRuntime::new(kind));
            let _ = self.runtime.set(runtime);
            self.set_status(KernelStatus::Idle);
            return Ok(());
        }
        let runtime_name = self.spec.runtime.ok_or_else(|| {
            OrchestratorError::Internal(format!("kernel {} has no runtime", self.spec.name))
        })?;
        self.set_status(KernelStatus::Initialization);

        let provider = Arc::clone(&self.provider);
        let mut ctx = StartContext::new(self.owner.clone(), &self.scope, &self.resource_class);
        ctx.kernel_id = self.id;
        let payload = json!({
            "kernel": self.spec.name,
            "scope": self.scope,
            "user": self.owner.as_ref().map(|u| u.id.clone()),
            "resources": resources_for(&self.resource_class),
        });
        let mut job = self.jobs.submit("create-kernel", payload, move |progress| async move {
            provider
                .start_kernel(runtime_name, ctx.with_progress(progress))
                .await
        });

        let mut job_events = job.events();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match job_events.recv().await {
                    Ok(JobEvent::Progress {
                        finished,
                        message,
                        data,
                    }) => {
                        let _ = events.send(KernelEvent::CreationProgress {
                            finished,
                            message,
                            data,
                        });
                    }
                    Ok(JobEvent::Failed(report)) => {
                        let _ = events.send(KernelEvent::CreationFailed(report));
                        break;
                    }
                    Ok(JobEvent::Complete) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
        });

        match job.wait().await {
            Ok(runtime) => {
                tracing::info!(kernel_id = %self.id, runtime_id = %runtime.id(), kernel = self.spec.name, "kernel ready");
                let _ = self.runtime.set(Arc::clone(&runtime));
                self.set_status(KernelStatus::Idle);
                self.watch_runtime(runtime);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(kernel_id = %self.id, error = %err, "kernel creation failed");
                self.set_status(KernelStatus::Error);
                Err(err)
            }
        }
    }

    fn watch_runtime(self: &Arc<Self>, runtime: Arc<dyn RuntimeHandle>) {
        let weak: Weak<Kernel> = Arc::downgrade(self);
        let mut status = runtime.status();
        let task = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let next = KernelStatus::from(*status.borrow_and_update());
                let Some(kernel) = weak.upgrade() else { break };
                kernel.set_status(next);
            }
        });
        *self.status_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn runtime(&self) -> Result<&Arc<dyn RuntimeHandle>> {
        match self.runtime.get() {
            Some(runtime) if !self.shutting_down.load(Ordering::SeqCst) => Ok(runtime),
            Some(_) => Err(OrchestratorError::KernelDead),
            None if self.status() == KernelStatus::Error => Err(OrchestratorError::KernelDead),
            None => Err(OrchestratorError::KernelNotReady),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.runtime().is_ok()
    }

    /// Start evaluating `code`. Non-markup evaluations are noted in the
    /// provider's kernel history when they start and when they complete.
    pub async fn eval(&self, code: &str) -> Result<Execution> {
        let runtime = self.runtime()?;
        self.touch();
        if self.spec.is_markup() {
            return runtime.execute(code).await;
        }
        self.provider.on_eval(runtime, code);
        let execution = runtime.execute(code).await?;
        let provider = Arc::clone(&self.provider);
        let runtime = Arc::clone(runtime);
        Ok(execution.on_complete(move |outcome| provider.on_response(&runtime, outcome)))
    }

    pub async fn interrupt(&self) -> Result<()> {
        self.runtime()?.interrupt().await
    }

    fn reject_markup_packages(&self) -> Result<()> {
        if self.spec.is_markup() {
            return Err(OrchestratorError::Unsupported(format!(
                "There is no package manager for {}",
                self.spec.name
            )));
        }
        Ok(())
    }

    pub async fn install_package(&self, package: &str) -> Result<Vec<String>> {
        self.reject_markup_packages()?;
        let runtime = self.runtime()?;
        self.touch();
        self.provider.install_package(runtime, package).await
    }

    pub async fn remove_package(&self, package: &str) -> Result<String> {
        self.reject_markup_packages()?;
        let runtime = self.runtime()?;
        self.touch();
        self.provider.remove_package(runtime, package).await
    }

    pub fn detect_packages(&self, code: &str) -> BTreeSet<String> {
        self.spec.detect_packages(code)
    }

    /// Shut the kernel down once. Waits for a pending creation to finish first.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        self.shutdown.get_or_init(|| self.teardown()).await.clone()
    }

    async fn teardown(self: &Arc<Self>) -> Result<()> {
        self.set_status(KernelStatus::ShuttingDown);
        self.shutting_down.store(true, Ordering::SeqCst);
        let created = if self.init_started.load(Ordering::SeqCst) {
            self.init().await.is_ok()
        } else {
            false
        };
        if let Some(task) = self
            .status_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let result = match (created, self.runtime.get()) {
            (true, Some(runtime)) if self.spec.is_markup() => runtime.shutdown().await,
            (true, Some(runtime)) => self.provider.shutdown_kernel(runtime).await,
            _ => Ok(()),
        };
        if let Err(err) = &result {
            tracing::warn!(kernel_id = %self.id, error = %err, "kernel shutdown failed");
        }
        self.set_status(KernelStatus::Dead);
        tracing::info!(kernel_id = %self.id, kernel = self.spec.name, "kernel shut down");
        result
    }

    pub fn info(&self, include_details: bool) -> KernelInfo {
        let details = include_details.then(|| {
            json!({
                "runtime_id": self.runtime.get().map(|r| r.id().to_string()),
                "runtime": self.spec.runtime,
                "scope": self.scope,
                "owner": self.owner.as_ref().map(|u| u.id.clone()),
                "resource_class": self.resource_class,
                "last_activity_ns": self.last_activity_ns(),
                "deployment": self.provider.kind().as_str(),
            })
        });
        KernelInfo {
            id: self.id,
            language: self.spec.name,
            status: self.status(),
            details,
        }
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Some(task) = self
            .status_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::LocalProcessProvider;
    use crate::testkit::MockProvider;

    fn kernel(name: &str, provider: Arc<dyn DeploymentProvider>) -> Arc<Kernel> {
        Arc::new(Kernel::new(
            catalog::lookup(name).unwrap(),
            Some(UserRef::new("u1", "Ada")),
            "p1",
            "1",
            provider,
            Arc::new(JobQueue::new()),
        ))
    }

    #[tokio::test]
    async fn eval_before_init_is_not_ready() {
        let k = kernel("Python", Arc::new(MockProvider::new()));
        assert!(matches!(k.eval("1").await, Err(OrchestratorError::KernelNotReady)));
    }

    #[tokio::test]
    async fn init_is_shared_and_reports_progress() {
        let provider = Arc::new(MockProvider::new());
        let k = kernel("Python", provider.clone());
        let mut events = k.subscribe();
        let (a, b) = tokio::join!(k.init(), k.init());
        a.unwrap();
        b.unwrap();
        assert_eq!(provider.started(), 1);
        assert_eq!(k.status(), KernelStatus::Idle);

        let mut saw_progress = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, KernelEvent::CreationProgress { .. }) {
                saw_progress = true;
            }
        }
        assert!(saw_progress);

        let result = k.eval("print('x')").await.unwrap().wait().await.unwrap();
        assert_eq!(result.code, "print('x')");
    }

    #[tokio::test]
    async fn failed_creation_emits_creation_failed() {
        let provider = Arc::new(MockProvider::failing("no capacity"));
        let k = kernel("R", provider);
        let mut events = k.subscribe();
        assert!(k.init().await.is_err());
        assert_eq!(k.status(), KernelStatus::Error);
        let mut failed = false;
        while let Ok(event) = events.recv().await {
            if matches!(event, KernelEvent::CreationFailed(_)) {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(matches!(k.eval("1").await, Err(OrchestratorError::KernelDead)));
    }

    #[tokio::test]
    async fn shutdown_runs_once() {
        let provider = Arc::new(MockProvider::new());
        let k = kernel("Python", provider.clone());
        k.init().await.unwrap();
        let (a, b) = tokio::join!(k.shutdown(), k.shutdown());
        a.unwrap();
        b.unwrap();
        assert_eq!(provider.stopped(), 1);
        assert_eq!(k.status(), KernelStatus::Dead);
        assert!(matches!(k.eval("1").await, Err(OrchestratorError::KernelDead)));
    }

    #[tokio::test]
    async fn evaluations_are_noted_in_provider_history() {
        let provider = Arc::new(MockProvider::new());
        let k = kernel("Python", provider.clone());
        k.init().await.unwrap();
        k.eval("x = 2").await.unwrap().wait().await.unwrap();

        let history = &provider.status()[0].history;
        let code = history.iter().find(|e| e.event == "CODE").unwrap();
        assert_eq!(code.data, Some(json!("x = 2")));
        let response = history.iter().find(|e| e.event == "RESPONSE").unwrap();
        assert_eq!(response.data.as_ref().unwrap()["output"][0]["data"]["text/plain"], "x = 2");
    }

    #[tokio::test]
    async fn markup_kernels_run_in_process() {
        let k = kernel("Markdown", Arc::new(LocalProcessProvider::default()));
        k.init().await.unwrap();
        let result = k.eval("**bold**").await.unwrap().wait().await.unwrap();
        assert!(result.output[0]["data"]["text/html"]
            .as_str()
            .unwrap()
            .contains("<strong>bold</strong>"));
        assert!(matches!(
            k.install_package("x").await,
            Err(OrchestratorError::Unsupported(_))
        ));
        k.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn info_includes_details_on_request() {
        let k = kernel("HTML", Arc::new(MockProvider::new()));
        assert!(k.info(false).details.is_none());
        let info = k.info(true);
        assert_eq!(info.language, "HTML");
        assert_eq!(info.details.unwrap()["scope"], "p1");
    }
}
