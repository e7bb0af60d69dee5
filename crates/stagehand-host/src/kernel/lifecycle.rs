//! Provisioning state machine of a cloud kernel.
//!
//! States advance strictly in declaration order. `Error` can be entered from
//! any state that is not terminal. Every transition is appended to the
//! kernel history and broadcast to observers before `advance` returns.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::error::{ErrorReport, OrchestratorError, Result};
use crate::runtime::{Endpoint, RuntimeHandle};
use crate::util::now_wallclock_ns;

const LIFECYCLE_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KernelState {
    Init,
    RegisteringDefinition,
    DefinitionRegistered,
    CreatingTask,
    TaskCreated,
    TaskReady,
    GettingIp,
    GotIp,
    CreatingConfig,
    ConfigReady,
    ConnectingRuntime,
    RuntimeConnected,
    Ready,
    ShuttingDown,
    Dead,
    Error,
}

impl KernelState {
    pub const ORDER: [KernelState; 15] = [
        KernelState::Init,
        KernelState::RegisteringDefinition,
        KernelState::DefinitionRegistered,
        KernelState::CreatingTask,
        KernelState::TaskCreated,
        KernelState::TaskReady,
        KernelState::GettingIp,
        KernelState::GotIp,
        KernelState::CreatingConfig,
        KernelState::ConfigReady,
        KernelState::ConnectingRuntime,
        KernelState::RuntimeConnected,
        KernelState::Ready,
        KernelState::ShuttingDown,
        KernelState::Dead,
    ];

    /// The only state `advance` accepts from `self`.
    pub fn next(self) -> Option<KernelState> {
        let at = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(at + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, KernelState::Dead | KernelState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KernelState::Init => "INIT",
            KernelState::RegisteringDefinition => "REGISTERING_DEFINITION",
            KernelState::DefinitionRegistered => "DEFINITION_REGISTERED",
            KernelState::CreatingTask => "CREATING_TASK",
            KernelState::TaskCreated => "TASK_CREATED",
            KernelState::TaskReady => "TASK_READY",
            KernelState::GettingIp => "GETTING_IP",
            KernelState::GotIp => "GOT_IP",
            KernelState::CreatingConfig => "CREATING_CONFIG",
            KernelState::ConfigReady => "CONFIG_READY",
            KernelState::ConnectingRuntime => "CONNECTING_RUNTIME",
            KernelState::RuntimeConnected => "RUNTIME_CONNECTED",
            KernelState::Ready => "READY",
            KernelState::ShuttingDown => "SHUTTING_DOWN",
            KernelState::Dead => "DEAD",
            KernelState::Error => "ERROR",
        }
    }
}

impl fmt::Display for KernelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub at_ns: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    State(KernelState),
    Note(HistoryEvent),
    Error(ErrorReport),
}

struct Inner {
    history: Vec<HistoryEvent>,
    last_error: Option<OrchestratorError>,
}

pub struct KernelLifecycle {
    inner: Mutex<Inner>,
    state: watch::Sender<KernelState>,
    events: broadcast::Sender<LifecycleEvent>,
    endpoint: OnceLock<Endpoint>,
    runtime: OnceLock<Arc<dyn RuntimeHandle>>,
}

impl Default for KernelLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelLifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(KernelState::Init);
        let (events, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                history: vec![HistoryEvent {
                    event: KernelState::Init.as_str().into(),
                    data: None,
                    at_ns: now_wallclock_ns(),
                }],
                last_error: None,
            }),
            state,
            events,
            endpoint: OnceLock::new(),
            runtime: OnceLock::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> KernelState {
        *self.state.borrow()
    }

    pub fn history(&self) -> Vec<HistoryEvent> {
        self.inner().history.clone()
    }

    pub fn last_error(&self) -> Option<OrchestratorError> {
        self.inner().last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Move to `next`, which must directly follow the current state.
    pub fn advance(&self, next: KernelState) -> Result<()> {
        let mut inner = self.inner();
        let current = self.state();
        if current.next() != Some(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        self.enter(&mut inner, next, None);
        Ok(())
    }

    /// Enter `Error`. Ignored once the kernel is already terminal.
    pub fn fail(&self, err: OrchestratorError) {
        let mut inner = self.inner();
        let current = self.state();
        if current.is_terminal() {
            tracing::debug!(state = %current, error = %err, "error after terminal state ignored");
            return;
        }
        let report = ErrorReport::from(&err);
        let data = serde_json::to_value(&report).ok();
        inner.last_error = Some(err);
        self.enter(&mut inner, KernelState::Error, data);
        let _ = self.events.send(LifecycleEvent::Error(report));
    }

    fn enter(&self, inner: &mut Inner, state: KernelState, data: Option<Value>) {
        inner.history.push(HistoryEvent {
            event: state.as_str().into(),
            data,
            at_ns: now_wallclock_ns(),
        });
        self.state.send_replace(state);
        let _ = self.events.send(LifecycleEvent::State(state));
    }

    /// Append a history entry that is not a state change.
    pub fn record(&self, event: &str, data: Option<Value>) {
        let note = HistoryEvent {
            event: event.to_string(),
            data,
            at_ns: now_wallclock_ns(),
        };
        self.inner().history.push(note.clone());
        let _ = self.events.send(LifecycleEvent::Note(note));
    }

    fn error_or_dead(&self) -> OrchestratorError {
        self.last_error().unwrap_or(OrchestratorError::KernelDead)
    }

    /// Resolves once the kernel has been `Ready` (later states count too);
    /// fails if provisioning ended in `Error`.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|s| *s >= KernelState::Ready)
            .await
            .map(|s| *s)
            .map_err(|_| OrchestratorError::Internal("lifecycle dropped".into()))?;
        if reached == KernelState::Error {
            return Err(self.error_or_dead());
        }
        Ok(())
    }

    pub async fn wait_dead(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let reached = state
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| OrchestratorError::Internal("lifecycle dropped".into()))?;
        if reached == KernelState::Error {
            return Err(self.error_or_dead());
        }
        Ok(())
    }

    /// Pending until the kernel enters `Error`.
    pub async fn wait_error(&self) -> OrchestratorError {
        let mut state = self.state.subscribe();
        if state.wait_for(|s| *s == KernelState::Error).await.is_err() {
            return OrchestratorError::Internal("lifecycle dropped".into());
        }
        self.error_or_dead()
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        self.endpoint
            .set(endpoint)
            .map_err(|_| OrchestratorError::Internal("kernel endpoint already set".into()))
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.get()
    }

    /// Only valid right after `RuntimeConnected` has been entered.
    pub fn attach_runtime(&self, runtime: Arc<dyn RuntimeHandle>) -> Result<()> {
        if self.state() != KernelState::RuntimeConnected {
            return Err(OrchestratorError::InvalidTransition {
                from: self.state().to_string(),
                to: "runtime attached".into(),
            });
        }
        self.runtime
            .set(runtime)
            .map_err(|_| OrchestratorError::Internal("kernel runtime already attached".into()))
    }

    pub fn runtime(&self) -> Option<Arc<dyn RuntimeHandle>> {
        self.runtime.get().cloned()
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            KernelState::Ready => Ok(()),
            KernelState::ShuttingDown | KernelState::Dead => Err(OrchestratorError::KernelDead),
            KernelState::Error => Err(self.error_or_dead()),
            _ => Err(OrchestratorError::KernelNotReady),
        }
    }

    /// Claim the `Ready -> ShuttingDown` step. Returns false when another
    /// caller already owns the teardown (or it finished).
    fn claim_shutdown(&self) -> Result<bool> {
        let mut inner = self.inner();
        match self.state() {
            KernelState::Ready => {
                self.enter(&mut inner, KernelState::ShuttingDown, None);
                Ok(true)
            }
            KernelState::ShuttingDown | KernelState::Dead => Ok(false),
            KernelState::Error => Err(inner
                .last_error
                .clone()
                .unwrap_or(OrchestratorError::KernelDead)),
            other => Err(OrchestratorError::InvalidTransition {
                from: other.to_string(),
                to: KernelState::ShuttingDown.to_string(),
            }),
        }
    }

    /// Tear the kernel down exactly once. A kill before `Ready` waits for
    /// provisioning to finish; a kill during teardown waits for `Dead`.
    pub async fn kill<F, Fut>(&self, teardown: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.wait_ready().await?;
        if !self.claim_shutdown()? {
            return self.wait_dead().await;
        }
        match teardown().await {
            Ok(()) => self.advance(KernelState::Dead),
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }
}
