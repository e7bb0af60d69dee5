//! Kernels as child processes of the orchestrator, talking NDJSON on stdio.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::json;
use tokio::process::{Child, Command};

use super::{DeploymentProvider, KernelRecord, KernelSummary, StartContext, response_data};
use crate::config::{DeploymentKind, LocalProcessConfig};
use crate::error::{OrchestratorError, Result};
use crate::runtime::{ExecutionResult, NdjsonRuntime, RuntimeHandle};

struct LocalKernel {
    record: KernelRecord,
    child: Option<Child>,
}

#[derive(Default)]
pub struct LocalProcessProvider {
    config: LocalProcessConfig,
    /// Keyed by runtime id.
    kernels: Mutex<HashMap<String, LocalKernel>>,
    /// Starts that have not produced a runtime yet (or failed), kept for status.
    pending: Mutex<Vec<KernelRecord>>,
}

impl LocalProcessProvider {
    pub fn new(config: LocalProcessConfig) -> Self {
        Self {
            config,
            kernels: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn kernels(&self) -> MutexGuard<'_, HashMap<String, LocalKernel>> {
        self.kernels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, Vec<KernelRecord>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_pending_status(&self, id: &str, status: &str, data: Option<serde_json::Value>) {
        if let Some(record) = self.pending().iter_mut().find(|r| r.id == id) {
            record.set_status(status, data);
        }
    }
}

#[async_trait]
impl DeploymentProvider for LocalProcessProvider {
    fn kind(&self) -> DeploymentKind {
        DeploymentKind::LocalProcess
    }

    async fn start_kernel(
        &self,
        runtime_name: &str,
        ctx: StartContext,
    ) -> Result<Arc<dyn RuntimeHandle>> {
        let command = self.config.commands.get(runtime_name).ok_or_else(|| {
            OrchestratorError::Validation(format!("runtime '{runtime_name}' is not installed"))
        })?;
        let pending_id = ctx.kernel_id.to_string();
        self.pending()
            .push(KernelRecord::new(&pending_id, runtime_name, &ctx, "CREATING_KERNEL"));
        ctx.report(1, "starting runtime process", json!({ "program": command.program }));

        let spawned = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let err = OrchestratorError::Backend(format!(
                    "spawn '{}' for {runtime_name}: {e}",
                    command.program
                ));
                self.set_pending_status(&pending_id, "ERROR", Some(json!(err.to_string())));
                return Err(err);
            }
        };
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.set_pending_status(&pending_id, "ERROR", None);
            return Err(OrchestratorError::Internal("runtime process without stdio".into()));
        };

        let runtime = match NdjsonRuntime::start(runtime_name, stdout, stdin).await {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = child.start_kill();
                self.set_pending_status(&pending_id, "ERROR", Some(json!(err.to_string())));
                return Err(err);
            }
        };
        let runtime_id = runtime.id().to_string();
        let mut record = {
            let mut pending = self.pending();
            match pending.iter().position(|r| r.id == pending_id) {
                Some(at) => pending.remove(at),
                None => KernelRecord::new(&pending_id, runtime_name, &ctx, "CREATING_KERNEL"),
            }
        };
        record.id = runtime_id.clone();
        record.set_status("READY", Some(json!({ "pid": child.id() })));
        ctx.report(2, "runtime ready", json!({ "runtime_id": runtime_id }));
        tracing::info!(runtime = runtime_name, runtime_id = %runtime_id, pid = ?child.id(), "local runtime started");
        self.kernels().insert(
            runtime_id,
            LocalKernel {
                record,
                child: Some(child),
            },
        );
        Ok(Arc::new(runtime))
    }

    async fn shutdown_kernel(&self, runtime: &Arc<dyn RuntimeHandle>) -> Result<()> {
        let child = {
            let mut kernels = self.kernels();
            let kernel = kernels.get_mut(runtime.id()).ok_or_else(|| {
                OrchestratorError::ResourceNotFound(format!("local kernel {}", runtime.id()))
            })?;
            kernel.record.set_status("SHUTTING_DOWN", None);
            kernel.child.take()
        };
        let graceful = runtime.shutdown().await;
        if let Some(mut child) = child {
            if graceful.is_err() {
                let _ = child.start_kill();
            }
            if let Err(e) = child.wait().await {
                tracing::warn!(runtime_id = %runtime.id(), error = %e, "waiting for runtime process failed");
            }
        }
        if let Some(kernel) = self.kernels().get_mut(runtime.id()) {
            kernel.record.set_status("DEAD", None);
        }
        graceful
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
        let mut summaries: Vec<KernelSummary> =
            self.kernels().values().map(|k| k.record.summary()).collect();
        summaries.extend(self.pending().iter().map(KernelRecord::summary));
        summaries
    }

    async fn kill(&self, id: &str) -> Result<()> {
        let child = {
            let mut kernels = self.kernels();
            let kernel = kernels
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::ResourceNotFound(format!("local kernel {id}")))?;
            kernel.record.set_status("SHUTTING_DOWN", None);
            kernel.child.take()
        };
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(kernel) = self.kernels().get_mut(id) {
            kernel.record.set_status("DEAD", None);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.kernels().retain(|_, k| k.record.status != "DEAD");
        self.pending().retain(|r| r.status != "ERROR");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let children: Vec<Child> = self
            .kernels()
            .values_mut()
            .filter_map(|k| k.child.take())
            .collect();
        for mut child in children {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::RuntimeCommand;
    use std::collections::BTreeMap;

    /// Shell stand-in for a runtime: acks everything and echoes executes.
    const FAKE_RUNTIME: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"op":"execute"'*)
      printf '{"id":"%s","type":"output","content":{"text":"hi"}}\n{"id":"%s","type":"done"}\n' "$id" "$id" ;;
    *'"op":"shutdown"'*)
      printf '{"id":"%s","type":"ack"}\n' "$id"; exit 0 ;;
    *)
      printf '{"id":"%s","type":"ack","content":{}}\n' "$id" ;;
  esac
done
"#;

    fn provider() -> LocalProcessProvider {
        LocalProcessProvider::new(LocalProcessConfig {
            commands: BTreeMap::from([(
                "python3".to_string(),
                RuntimeCommand {
                    program: "sh".into(),
                    args: vec!["-c".into(), FAKE_RUNTIME.into()],
                },
            )]),
        })
    }

    #[tokio::test]
    async fn spawns_evaluates_and_stops() {
        let provider = provider();
        let runtime = provider
            .start_kernel("python3", StartContext::new(None, "p1", "1"))
            .await
            .unwrap();
        let status = provider.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status, "READY");

        let result = runtime.execute("anything").await.unwrap().wait().await.unwrap();
        assert_eq!(result.output.len(), 1);

        provider.shutdown_kernel(&runtime).await.unwrap();
        assert_eq!(provider.status()[0].status, "DEAD");
        provider.flush().await.unwrap();
        assert!(provider.status().is_empty());
    }

    #[tokio::test]
    async fn unknown_runtime_is_a_validation_error() {
        let err = provider()
            .start_kernel("ir", StartContext::new(None, "p1", "1"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn default_provider_keeps_no_reserve() {
        let provider = LocalProcessProvider::default();
        assert!(provider.reserve_config().is_none());
        assert!(matches!(
            provider.install_package(&provider_runtime(), "numpy").await,
            Err(OrchestratorError::Unsupported(_))
        ));
    }

    fn provider_runtime() -> Arc<dyn RuntimeHandle> {
        Arc::new(crate::runtime::MarkupRuntime::new(
            crate::runtime::markup::MarkupKind::Html,
        ))
    }
}
