//! Daemon mode: keeps the orchestrator alive and serves control requests.
//!
//! The select loop
//! 1. runs reserve housekeeping on a fixed tick
//! 2. applies control messages
//! 3. handles graceful shutdown
//!
//! Requests that wait on kernels (attach, eval, kill) run on their own task so
//! a slow provision never stalls the loop.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::deployment::{KernelSummary, ReserveConfig, ReserveUpdate};
use crate::error::Result;
use crate::kernel::KernelInfo;
use crate::kernel::catalog::KernelSpecInfo;
use crate::orchestrator::Orchestrator;
use crate::runtime::ExecutionResult;
use crate::store::UserRef;

/// Control message for the daemon, usually produced by the `ControlServer`.
#[derive(Debug)]
pub enum ControlMsg {
    Kernels {
        resp: oneshot::Sender<Result<Vec<KernelSummary>>>,
    },
    KillKernel {
        id: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Flush {
        resp: oneshot::Sender<Result<()>>,
    },
    GetReserveConfig {
        resp: oneshot::Sender<Result<Option<ReserveConfig>>>,
    },
    SetReserveConfig {
        update: ReserveUpdate,
        resp: oneshot::Sender<Result<ReserveConfig>>,
    },
    Sessions {
        resp: oneshot::Sender<Result<Vec<SessionSummary>>>,
    },
    Attach {
        session: String,
        kernel: String,
        user: Option<UserRef>,
        resp: oneshot::Sender<Result<KernelInfo>>,
    },
    Eval {
        session: String,
        kernel: String,
        code: String,
        user: Option<UserRef>,
        resp: oneshot::Sender<Result<ExecutionResult>>,
    },
    DetachSession {
        session: String,
        resp: oneshot::Sender<Result<bool>>,
    },
    Catalog {
        resp: oneshot::Sender<Result<Vec<KernelSpecInfo>>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
        /// Propagates shutdown to the control server listener.
        shutdown_tx: broadcast::Sender<()>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session: String,
    pub pinned: bool,
    pub kernels: BTreeMap<String, KernelInfo>,
}

pub struct OrchestratorDaemon {
    orchestrator: Orchestrator,
    control_rx: mpsc::Receiver<ControlMsg>,
    shutdown_rx: broadcast::Receiver<()>,
    control_server: Option<JoinHandle<()>>,
}

impl OrchestratorDaemon {
    pub fn new(
        orchestrator: Orchestrator,
        control_rx: mpsc::Receiver<ControlMsg>,
        shutdown_rx: broadcast::Receiver<()>,
        control_server: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            orchestrator,
            control_rx,
            shutdown_rx,
            control_server,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Run until a shutdown message or signal arrives, then tear the
    /// orchestrator down.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            deployment = self.orchestrator.provider.kind().as_str(),
            "orchestrator daemon started"
        );
        // The backend may come up later; housekeeping retries reserve setup.
        if let Err(err) = self.orchestrator.provider.init().await {
            tracing::warn!(error = %err, "deployment init failed");
        }

        let period = self.orchestrator.config.housekeeping_interval;
        let mut housekeeping = tokio::time::interval_at(Instant::now() + period, period);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut control_open = true;

        loop {
            tokio::select! {
                _ = housekeeping.tick() => {
                    if let Err(err) = self.orchestrator.provider.flush().await {
                        tracing::warn!(error = %err, "reserve housekeeping failed");
                    }
                }

                msg = self.control_rx.recv(), if control_open => {
                    match msg {
                        Some(cmd) => {
                            let should_stop = matches!(cmd, ControlMsg::Shutdown { .. });
                            self.apply_control(cmd);
                            if should_stop {
                                tracing::info!("shutdown requested via control channel");
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("control channel closed");
                            control_open = false;
                        }
                    }
                }

                _ = self.shutdown_rx.recv() => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.orchestrator.shutdown().await;
        tracing::info!("orchestrator daemon stopped");
        if let Some(handle) = self.control_server.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    fn apply_control(&self, cmd: ControlMsg) {
        let orchestrator = &self.orchestrator;
        match cmd {
            ControlMsg::Kernels { resp } => {
                let _ = resp.send(Ok(orchestrator.provider.status()));
            }
            ControlMsg::GetReserveConfig { resp } => {
                let _ = resp.send(Ok(orchestrator.provider.reserve_config()));
            }
            ControlMsg::Sessions { resp } => {
                let _ = resp.send(Ok(session_summaries(orchestrator)));
            }
            ControlMsg::Catalog { resp } => {
                let _ = resp.send(Ok(orchestrator.registry.all()));
            }
            ControlMsg::KillKernel { id, resp } => {
                let provider = orchestrator.provider.clone();
                tokio::spawn(async move {
                    tracing::info!(kernel_id = %id, "kill requested");
                    let _ = resp.send(provider.kill(&id).await);
                });
            }
            ControlMsg::Flush { resp } => {
                let provider = orchestrator.provider.clone();
                tokio::spawn(async move {
                    let _ = resp.send(provider.flush().await);
                });
            }
            ControlMsg::SetReserveConfig { update, resp } => {
                let provider = orchestrator.provider.clone();
                tokio::spawn(async move {
                    let _ = resp.send(provider.set_reserve_config(update).await);
                });
            }
            ControlMsg::Attach {
                session,
                kernel,
                user,
                resp,
            } => {
                let sessions = orchestrator.sessions.clone();
                tokio::spawn(async move {
                    let queue = sessions.get_or_create(&session, user.as_ref());
                    let res = queue
                        .attach_kernel(&kernel, user)
                        .await
                        .map(|kernel| kernel.info(true));
                    let _ = resp.send(res);
                });
            }
            ControlMsg::Eval {
                session,
                kernel,
                code,
                user,
                resp,
            } => {
                let sessions = orchestrator.sessions.clone();
                tokio::spawn(async move {
                    let queue = sessions.get_or_create(&session, user.as_ref());
                    let _ = resp.send(queue.eval_code(&kernel, &code, user).await);
                });
            }
            ControlMsg::DetachSession { session, resp } => {
                let sessions = orchestrator.sessions.clone();
                tokio::spawn(async move {
                    let _ = resp.send(Ok(sessions.detach(&session).await));
                });
            }
            ControlMsg::Shutdown { resp, shutdown_tx } => {
                let _ = shutdown_tx.send(());
                let _ = resp.send(Ok(()));
            }
        }
    }
}

fn session_summaries(orchestrator: &Orchestrator) -> Vec<SessionSummary> {
    orchestrator
        .sessions
        .sessions()
        .into_iter()
        .filter_map(|session| {
            let queue = orchestrator.sessions.get(&session)?;
            Some(SessionSummary {
                pinned: queue.stays_alive(),
                kernels: queue.kernel_infos(false),
                session,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::store::MemoryStore;
    use crate::testkit::MockProvider;

    fn daemon() -> (OrchestratorDaemon, mpsc::Sender<ControlMsg>, broadcast::Sender<()>, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            provider.clone(),
            Arc::new(MemoryStore::new()),
        );
        let (control_tx, control_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let daemon = OrchestratorDaemon::new(orchestrator, control_rx, shutdown_rx, None);
        (daemon, control_tx, shutdown_tx, provider)
    }

    #[tokio::test]
    async fn evaluates_and_shuts_down() {
        let (mut daemon, control_tx, shutdown_tx, provider) = daemon();
        let running = tokio::spawn(async move { daemon.run().await });

        let (tx, rx) = oneshot::channel();
        control_tx
            .send(ControlMsg::Eval {
                session: "s1".into(),
                kernel: "Python".into(),
                code: "1 + 1".into(),
                user: None,
                resp: tx,
            })
            .await
            .unwrap();
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.output[0]["data"]["text/plain"], "1 + 1");

        let (tx, rx) = oneshot::channel();
        control_tx.send(ControlMsg::Sessions { resp: tx }).await.unwrap();
        let sessions = rx.await.unwrap().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].kernels.contains_key("Python"));

        let (tx, rx) = oneshot::channel();
        control_tx
            .send(ControlMsg::Shutdown {
                resp: tx,
                shutdown_tx: shutdown_tx.clone(),
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(provider.stopped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_stops_the_loop() {
        let (mut daemon, _control_tx, shutdown_tx, _) = daemon();
        let running = tokio::spawn(async move { daemon.run().await });
        tokio::time::sleep(Duration::from_secs(120)).await;
        shutdown_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn local_deployment_keeps_no_reserve() {
        let (mut daemon, control_tx, shutdown_tx, _) = daemon();
        let running = tokio::spawn(async move { daemon.run().await });

        let (tx, rx) = oneshot::channel();
        control_tx.send(ControlMsg::GetReserveConfig { resp: tx }).await.unwrap();
        assert_eq!(rx.await.unwrap().unwrap(), None);

        let (tx, rx) = oneshot::channel();
        control_tx
            .send(ControlMsg::SetReserveConfig {
                update: ReserveUpdate::default(),
                resp: tx,
            })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_err());

        shutdown_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
