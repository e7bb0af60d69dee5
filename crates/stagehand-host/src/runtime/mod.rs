//! Contract between the orchestrator and a running compute runtime.
//!
//! A runtime evaluates code and streams what it produces. The orchestrator
//! needs only five things from it: start (handled by whoever connects),
//! evaluate, interrupt, shut down and a status signal.

pub mod gateway;
pub mod markup;
pub mod ndjson;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{OrchestratorError, Result};

pub use gateway::{ConfigRequest, HttpKernelGateway, KernelGateway};
pub use markup::MarkupRuntime;
pub use ndjson::NdjsonRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeStatus {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

/// Network location of a runtime. Set once per kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub ports: Vec<u16>,
}

/// One piece of streamed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Output(Value),
    Error(Value),
    Stderr(String),
}

impl ExecutionEvent {
    /// Content events carry display data; stderr is a raw stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, ExecutionEvent::Stderr(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub code: String,
    pub output: Vec<Value>,
    pub error: Vec<Value>,
    pub stderr: Vec<String>,
    #[serde(default)]
    pub globals: Vec<Value>,
    #[serde(default)]
    pub dependencies: Vec<Value>,
}

impl ExecutionResult {
    pub fn for_code(code: &str) -> Self {
        Self {
            code: code.to_string(),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Output(v) => self.output.push(v.clone()),
            ExecutionEvent::Error(v) => self.error.push(v.clone()),
            ExecutionEvent::Stderr(s) => self.stderr.push(s.clone()),
        }
    }
}

/// Producer side of an [`Execution`].
pub struct ExecutionSink {
    events: mpsc::UnboundedSender<ExecutionEvent>,
    done: oneshot::Sender<Result<ExecutionResult>>,
    result: ExecutionResult,
}

impl ExecutionSink {
    pub fn emit(&mut self, event: ExecutionEvent) {
        self.result.apply(&event);
        let _ = self.events.send(event);
    }

    pub fn result_mut(&mut self) -> &mut ExecutionResult {
        &mut self.result
    }

    pub fn complete(self) {
        let _ = self.done.send(Ok(self.result));
    }

    pub fn fail(self, err: OrchestratorError) {
        let _ = self.done.send(Err(err));
    }
}

type CompletionHook = Box<dyn FnOnce(&Result<ExecutionResult>) + Send>;

/// A running evaluation: a stream of output events followed by a result.
pub struct Execution {
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
    done: oneshot::Receiver<Result<ExecutionResult>>,
    partial: ExecutionResult,
    completion: Option<CompletionHook>,
}

impl Execution {
    pub fn channel(code: &str) -> (ExecutionSink, Execution) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let sink = ExecutionSink {
            events: events_tx,
            done: done_tx,
            result: ExecutionResult::for_code(code),
        };
        let execution = Execution {
            events: events_rx,
            done: done_rx,
            partial: ExecutionResult::for_code(code),
            completion: None,
        };
        (sink, execution)
    }

    /// Run `hook` with the outcome once the execution has been driven to the end.
    pub fn on_complete(
        mut self,
        hook: impl FnOnce(&Result<ExecutionResult>) + Send + 'static,
    ) -> Self {
        self.completion = Some(Box::new(hook));
        self
    }

    /// Run `on_event` for every event with the output accumulated so far, then
    /// return the final result.
    pub async fn drive(
        mut self,
        mut on_event: impl FnMut(&ExecutionEvent, &ExecutionResult),
    ) -> Result<ExecutionResult> {
        while let Some(event) = self.events.recv().await {
            self.partial.apply(&event);
            on_event(&event, &self.partial);
        }
        let outcome = self
            .done
            .await
            .map_err(|_| OrchestratorError::Runtime("execution abandoned by runtime".into()))
            .and_then(|result| result);
        if let Some(hook) = self.completion.take() {
            hook(&outcome);
        }
        outcome
    }

    pub async fn wait(self) -> Result<ExecutionResult> {
        self.drive(|_, _| {}).await
    }
}

#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Runtime name (`python3`, `ir`, `markdown`).
    fn name(&self) -> &str;

    async fn execute(&self, code: &str) -> Result<Execution>;

    async fn interrupt(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    fn status(&self) -> watch::Receiver<RuntimeStatus>;
}

impl fmt::Debug for dyn RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}
