//! Shared helpers for the integration tests.
//!
//! Each test binary compiles this module on its own, so some helpers look
//! unused in a given file.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stagehand_host::config::OrchestratorConfig;
use stagehand_host::deployment::DeploymentProvider;
use stagehand_host::queue::SessionEvent;
use stagehand_host::{MemoryStore, Orchestrator};
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Orchestrator over `provider` with an inspectable in-memory store.
pub fn orchestrator(provider: Arc<dyn DeploymentProvider>) -> (Orchestrator, Arc<MemoryStore>) {
    orchestrator_with(OrchestratorConfig::default(), provider)
}

pub fn orchestrator_with(
    config: OrchestratorConfig,
    provider: Arc<dyn DeploymentProvider>,
) -> (Orchestrator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(config, provider, store.clone());
    (orchestrator, store)
}

/// Receive events until one matches `pred`. Panics on timeout.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Names of task events until `count` terminal ones have been seen.
pub async fn collect_terminal(
    events: &mut broadcast::Receiver<SessionEvent>,
    count: usize,
) -> Vec<(String, &'static str)> {
    let mut seen = Vec::new();
    while seen.len() < count {
        let event = wait_for_event(events, |event| {
            matches!(
                event,
                SessionEvent::TaskFinished { .. } | SessionEvent::TaskFailed { .. }
            )
        })
        .await;
        if let SessionEvent::TaskFinished { entry } | SessionEvent::TaskFailed { entry } = &event {
            seen.push((entry.name.clone(), event.name()));
        }
    }
    seen
}

/// Poll until the control socket file shows up.
pub async fn wait_for_socket(path: &Path) {
    for _ in 0..100 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("control socket never appeared at {}", path.display());
}
