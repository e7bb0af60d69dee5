//! Per-session task queue.
//!
//! Every session-mutating operation becomes a ticket. Tickets run strictly one
//! at a time in submission order on a single executor task. Each ticket's
//! history entry is written by a second task that applies creations and
//! status updates in the order they were produced, so an update never lands
//! before the creation of its entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, ErrorReport, OrchestratorError, Result};
use crate::kernel::catalog::DEFAULT_RESOURCE_CLASS;
use crate::kernel::{Kernel, KernelEvent, KernelInfo};
use crate::registry::KernelRegistry;
use crate::runtime::{ExecutionEvent, ExecutionResult};
use crate::store::{
    Cell, HistoryEntry, MoveDirection, NewHistoryEntry, SessionStore, TicketStatus, UserRef,
};

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub history_wait: Duration,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_wait: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

impl From<&OrchestratorConfig> for QueueConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            history_wait: config.history_wait,
            event_capacity: config.event_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    TaskQueued {
        entry: HistoryEntry,
    },
    TaskStarted {
        entry: HistoryEntry,
    },
    TaskFinished {
        entry: HistoryEntry,
    },
    TaskFailed {
        entry: HistoryEntry,
    },
    Error {
        report: ErrorReport,
    },
    KernelStatus {
        kernel: String,
        info: KernelInfo,
    },
    KernelCreationProgress {
        kernel: String,
        finished: u32,
        message: String,
        data: Value,
    },
    KernelCreationFailed {
        kernel: String,
        report: ErrorReport,
    },
    KernelDetached {
        kernel: String,
    },
    CellOutput {
        cell: Cell,
    },
    Console {
        kernel: String,
        output: ExecutionEvent,
    },
    SetGlobals {
        globals: Vec<Value>,
    },
    HistoryCleared,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::TaskQueued { .. } => "task-queued",
            SessionEvent::TaskStarted { .. } => "task-started",
            SessionEvent::TaskFinished { .. } => "task-finished",
            SessionEvent::TaskFailed { .. } => "task-failed",
            SessionEvent::Error { .. } => "error",
            SessionEvent::KernelStatus { .. } => "kernel-status",
            SessionEvent::KernelCreationProgress { .. } => "kernel-creation-progress",
            SessionEvent::KernelCreationFailed { .. } => "kernel-creation-failed",
            SessionEvent::KernelDetached { .. } => "kernel-detached",
            SessionEvent::CellOutput { .. } => "cell-output",
            SessionEvent::Console { .. } => "console",
            SessionEvent::SetGlobals { .. } => "set-globals",
            SessionEvent::HistoryCleared => "history-cleared",
        }
    }

    /// Ticket the event belongs to, for task events.
    pub fn ticket_id(&self) -> Option<Uuid> {
        match self {
            SessionEvent::TaskQueued { entry }
            | SessionEvent::TaskStarted { entry }
            | SessionEvent::TaskFinished { entry }
            | SessionEvent::TaskFailed { entry } => Some(entry.ticket_id),
            _ => None,
        }
    }
}

enum Admission {
    Run,
    Reject,
}

type Job = Box<dyn FnOnce(Admission) -> BoxFuture<'static, Result<()>> + Send>;

struct Ticket {
    id: Uuid,
    name: String,
    recorded: oneshot::Receiver<()>,
    job: Job,
}

/// Caller side of a submitted ticket.
pub struct TicketHandle<T> {
    id: Uuid,
    reply: oneshot::Receiver<Result<T>>,
}

impl<T> TicketHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn wait(self) -> Result<T> {
        self.reply
            .await
            .map_err(|_| OrchestratorError::Internal("ticket abandoned by executor".into()))?
    }
}

enum HistoryCommand {
    Create {
        entry: NewHistoryEntry,
        recorded: oneshot::Sender<()>,
    },
    Update {
        ticket_id: Uuid,
        status: TicketStatus,
        error: Option<ErrorReport>,
    },
}

struct AttachedKernel {
    kernel: Arc<Kernel>,
    scope: String,
    listener: JoinHandle<()>,
}

pub struct SessionQueue {
    session: String,
    store: Arc<dyn SessionStore>,
    registry: Arc<KernelRegistry>,
    tickets: Mutex<Option<mpsc::UnboundedSender<Ticket>>>,
    history: mpsc::UnboundedSender<HistoryCommand>,
    events: broadcast::Sender<SessionEvent>,
    kernels: Mutex<BTreeMap<String, AttachedKernel>>,
    evaluating: Mutex<BTreeSet<String>>,
    closed: Arc<AtomicBool>,
    executor: Mutex<Option<JoinHandle<()>>>,
    stay_alive: AtomicBool,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionQueue {
    pub fn new(
        session: &str,
        store: Arc<dyn SessionStore>,
        registry: Arc<KernelRegistry>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (ticket_tx, ticket_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_history_writer(
            session.to_string(),
            Arc::clone(&store),
            history_rx,
            events.clone(),
        ));
        let executor = tokio::spawn(run_executor(
            session.to_string(),
            ticket_rx,
            history_tx.clone(),
            Arc::clone(&closed),
            config.history_wait,
        ));

        Arc::new(Self {
            session: session.to_string(),
            store,
            registry,
            tickets: Mutex::new(Some(ticket_tx)),
            history: history_tx,
            events,
            kernels: Mutex::new(BTreeMap::new()),
            evaluating: Mutex::new(BTreeSet::new()),
            closed,
            executor: Mutex::new(Some(executor)),
            stay_alive: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Every event of this session (the `*` stream).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_stay_alive(&self, pinned: bool) {
        self.stay_alive.store(pinned, Ordering::SeqCst);
    }

    pub fn stays_alive(&self) -> bool {
        self.stay_alive.load(Ordering::SeqCst)
    }

    /// Queue `worker`. The ticket is in the queue when this returns; the
    /// handle resolves with the worker's result.
    pub fn submit<T, F, Fut>(
        &self,
        name: &str,
        payload: Value,
        user: Option<UserRef>,
        worker: F,
    ) -> TicketHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        let handle = TicketHandle {
            id,
            reply: reply_rx,
        };

        let tickets = guard(&self.tickets);
        let Some(sender) = tickets.as_ref() else {
            let _ = reply_tx.send(Err(OrchestratorError::QueueClosed));
            return handle;
        };

        let (recorded_tx, recorded_rx) = oneshot::channel();
        let _ = self.history.send(HistoryCommand::Create {
            entry: NewHistoryEntry {
                ticket_id: id,
                name: name.to_string(),
                payload,
                user,
            },
            recorded: recorded_tx,
        });

        let job: Job = Box::new(move |admission| {
            Box::pin(async move {
                let outcome = match admission {
                    Admission::Run => worker().await,
                    Admission::Reject => Err(OrchestratorError::QueueClosed),
                };
                let status = match &outcome {
                    Ok(_) => Ok(()),
                    Err(err) => Err(err.clone()),
                };
                let _ = reply_tx.send(outcome);
                status
            })
        });
        let ticket = Ticket {
            id,
            name: name.to_string(),
            recorded: recorded_rx,
            job,
        };
        if let Err(mpsc::error::SendError(ticket)) = sender.send(ticket) {
            // Executor is gone; fail the ticket in place.
            let _ = self.history.send(HistoryCommand::Update {
                ticket_id: ticket.id,
                status: TicketStatus::Failed,
                error: Some(ErrorReport::from(&OrchestratorError::QueueClosed)),
            });
            tokio::spawn((ticket.job)(Admission::Reject));
        }
        handle
    }

    /// Queue `worker` and wait for its result.
    pub async fn enqueue<T, F, Fut>(
        &self,
        name: &str,
        payload: Value,
        user: Option<UserRef>,
        worker: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(name, payload, user, worker).wait().await
    }

    pub fn kernel(&self, kernel_type: &str) -> Option<Arc<Kernel>> {
        guard(&self.kernels)
            .get(kernel_type)
            .map(|attached| Arc::clone(&attached.kernel))
    }

    pub fn attached_kernels(&self) -> Vec<String> {
        guard(&self.kernels).keys().cloned().collect()
    }

    pub fn evaluating_cells(&self) -> Vec<String> {
        guard(&self.evaluating).iter().cloned().collect()
    }

    fn watch_kernel(&self, kernel_type: &str, kernel: &Arc<Kernel>) -> JoinHandle<()> {
        let mut updates = kernel.subscribe();
        let events = self.events.clone();
        let kernel = Arc::clone(kernel);
        let kernel_type = kernel_type.to_string();
        tokio::spawn(async move {
            loop {
                let event = match updates.recv().await {
                    Ok(KernelEvent::Status(_)) => SessionEvent::KernelStatus {
                        kernel: kernel_type.clone(),
                        info: kernel.info(false),
                    },
                    Ok(KernelEvent::CreationProgress {
                        finished,
                        message,
                        data,
                    }) => SessionEvent::KernelCreationProgress {
                        kernel: kernel_type.clone(),
                        finished,
                        message,
                        data,
                    },
                    Ok(KernelEvent::CreationFailed(report)) => SessionEvent::KernelCreationFailed {
                        kernel: kernel_type.clone(),
                        report,
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let _ = events.send(event);
            }
        })
    }

    fn submit_attach(
        self: &Arc<Self>,
        kernel_type: &str,
        user: Option<UserRef>,
    ) -> TicketHandle<Arc<Kernel>> {
        let this = Arc::clone(self);
        let kernel_type = kernel_type.to_string();
        let payload = json!({ "language": kernel_type });
        let owner = user.clone();
        self.submit("attachKernel", payload, user, move || async move {
            if let Some(kernel) = this.kernel(&kernel_type) {
                kernel.init().await?;
                return Ok(kernel);
            }
            let scope = this.store.scope_of(&this.session).await?;
            let class = match &owner {
                Some(user) => this.store.resource_class(user).await?,
                None => DEFAULT_RESOURCE_CLASS.to_string(),
            };
            let kernel = this.registry.attach(&kernel_type, owner, &scope, &class)?;
            let listener = this.watch_kernel(&kernel_type, &kernel);
            guard(&this.kernels).insert(
                kernel_type.clone(),
                AttachedKernel {
                    kernel: Arc::clone(&kernel),
                    scope: scope.clone(),
                    listener,
                },
            );
            if let Err(err) = kernel.init().await {
                if let Some(attached) = guard(&this.kernels).remove(&kernel_type) {
                    attached.listener.abort();
                }
                this.registry.evict(&kernel_type, &scope, &kernel);
                let _ = kernel.shutdown().await;
                return Err(err);
            }
            Ok(kernel)
        })
    }

    pub async fn attach_kernel(
        self: &Arc<Self>,
        kernel_type: &str,
        user: Option<UserRef>,
    ) -> Result<Arc<Kernel>> {
        self.submit_attach(kernel_type, user).wait().await
    }

    /// Release the session's hold on a kernel without queueing. The registry
    /// shuts it down once the detach grace expires.
    pub fn shutdown_kernel(&self, kernel_type: &str) -> bool {
        let Some(attached) = guard(&self.kernels).remove(kernel_type) else {
            return false;
        };
        attached.listener.abort();
        self.registry.detach(kernel_type, &attached.scope);
        self.emit(SessionEvent::KernelDetached {
            kernel: kernel_type.to_string(),
        });
        tracing::debug!(session = %self.session, kernel = kernel_type, "kernel released");
        true
    }

    fn submit_detach(self: &Arc<Self>, kernel_type: &str, user: Option<UserRef>) -> TicketHandle<String> {
        let this = Arc::clone(self);
        let kernel_type = kernel_type.to_string();
        let payload = json!({ "language": kernel_type });
        self.submit("detachKernel", payload, user, move || async move {
            this.shutdown_kernel(&kernel_type);
            Ok(kernel_type)
        })
    }

    pub async fn detach_kernel(self: &Arc<Self>, kernel_type: &str, user: Option<UserRef>) -> Result<String> {
        self.submit_detach(kernel_type, user).wait().await
    }

    pub async fn restart_kernel(
        self: &Arc<Self>,
        kernel_type: &str,
        user: Option<UserRef>,
    ) -> Result<Arc<Kernel>> {
        let detached = self.submit_detach(kernel_type, user.clone());
        let attached = self.submit_attach(kernel_type, user);
        detached.wait().await?;
        attached.wait().await
    }

    pub async fn detach_all_kernels(self: &Arc<Self>, user: Option<UserRef>) -> Result<Vec<String>> {
        let handles: Vec<TicketHandle<String>> = self
            .attached_kernels()
            .iter()
            .map(|kernel_type| self.submit_detach(kernel_type, user.clone()))
            .collect();
        let mut detached = Vec::with_capacity(handles.len());
        for handle in handles {
            detached.push(handle.wait().await?);
        }
        Ok(detached)
    }

    pub async fn interrupt_kernel(&self, kernel_type: &str) -> Result<()> {
        let kernel = self.kernel(kernel_type).ok_or(OrchestratorError::KernelNotReady)?;
        kernel.interrupt().await
    }

    /// Run code right away on an attached, ready kernel. Output is streamed
    /// as console events.
    pub async fn run_code(&self, kernel_type: &str, code: &str) -> Result<ExecutionResult> {
        let kernel = self
            .kernel(kernel_type)
            .filter(|kernel| kernel.is_ready())
            .ok_or(OrchestratorError::KernelNotReady)?;
        let execution = kernel.eval(code).await?;
        execution
            .drive(|event, _| {
                self.emit(SessionEvent::Console {
                    kernel: kernel_type.to_string(),
                    output: event.clone(),
                })
            })
            .await
    }

    /// Attach the kernel if needed, then evaluate `code` on it.
    pub async fn eval_code(
        self: &Arc<Self>,
        kernel_type: &str,
        code: &str,
        user: Option<UserRef>,
    ) -> Result<ExecutionResult> {
        let attached = self.submit_attach(kernel_type, user.clone());
        let this = Arc::clone(self);
        let language = kernel_type.to_string();
        let source = code.to_string();
        let evaluated = self.submit(
            "evalCode",
            json!({ "language": kernel_type, "code": code }),
            user,
            move || async move {
                let kernel = this.kernel(&language).ok_or(OrchestratorError::KernelDead)?;
                let execution = kernel.eval(&source).await?;
                execution
                    .drive(|event, _| {
                        this.emit(SessionEvent::Console {
                            kernel: language.clone(),
                            output: event.clone(),
                        })
                    })
                    .await
            },
        );
        let (attached, evaluated) = tokio::join!(attached.wait(), evaluated.wait());
        attached?;
        evaluated
    }

    /// Export the scope's project variables into `kernel`'s environment.
    async fn prepare_environment(&self, kernel: &Kernel) -> Result<()> {
        let scope = self.store.scope_of(&self.session).await?;
        let variables = self.store.project_variables(&scope).await?;
        if let Some(code) = kernel.spec().env_setup(&variables) {
            kernel.eval(&code).await?.wait().await?;
        }
        Ok(())
    }

    /// Replace the session globals of `language` with what its kernel just
    /// reported, keeping those of other languages.
    async fn merge_globals(&self, language: &str, reported: Vec<Value>) -> Result<()> {
        let mut globals: Vec<Value> = self
            .store
            .globals(&self.session)
            .await?
            .into_iter()
            .filter(|global| global.get("language").and_then(Value::as_str) != Some(language))
            .collect();
        globals.extend(reported.into_iter().filter(|g| !g.is_null()).map(|mut global| {
            if let Value::Object(fields) = &mut global {
                fields
                    .entry("language")
                    .or_insert_with(|| Value::from(language));
            }
            global
        }));
        self.store.set_globals(&self.session, globals.clone()).await?;
        self.emit(SessionEvent::SetGlobals { globals });
        Ok(())
    }

    /// Store `code` in the cell, evaluate it on the cell's kernel and save the
    /// outputs. Project variables are exported first; the globals the kernel
    /// reports afterwards replace that language's session globals. Partial
    /// outputs are emitted as `CellOutput` events.
    pub async fn eval_cell(
        self: &Arc<Self>,
        cell_id: &str,
        code: &str,
        user: Option<UserRef>,
    ) -> Result<Cell> {
        let language = self.store.cell(&self.session, cell_id).await?.language;
        let attached = self.submit_attach(&language, user.clone());
        let this = Arc::clone(self);
        let cell_id = cell_id.to_string();
        let source = code.to_string();
        let payload = json!({ "cell": cell_id, "language": language });
        let evaluated = self.submit("evalCell", payload, user, move || async move {
            let mut cell = this
                .store
                .update_cell_code(&this.session, &cell_id, &source)
                .await?;
            let kernel = this.kernel(&cell.language).ok_or(OrchestratorError::KernelDead)?;
            guard(&this.evaluating).insert(cell_id.clone());
            let outcome = async {
                this.prepare_environment(&kernel).await?;
                let execution = kernel.eval(&source).await?;
                execution
                    .drive(|_, partial| {
                        let mut snapshot = cell.clone();
                        snapshot.output = partial.output.clone();
                        snapshot.error = partial.error.clone();
                        snapshot.stderr = partial.stderr.clone();
                        this.emit(SessionEvent::CellOutput { cell: snapshot });
                    })
                    .await
            }
            .await;
            guard(&this.evaluating).remove(&cell_id);
            let result = outcome?;
            let mut dependencies = kernel.detect_packages(&source);
            dependencies.extend(
                result
                    .dependencies
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string),
            );
            cell.dependencies = dependencies.into_iter().collect();
            cell.output = result.output;
            cell.error = result.error;
            cell.stderr = result.stderr;
            cell.evaluated = true;
            let cell = this.store.save_cell(&this.session, cell).await?;
            this.merge_globals(&cell.language, result.globals).await?;
            Ok(cell)
        });
        let (attached, evaluated) = tokio::join!(attached.wait(), evaluated.wait());
        attached?;
        evaluated
    }

    pub async fn create_cell(
        self: &Arc<Self>,
        language: &str,
        index: Option<usize>,
        user: Option<UserRef>,
    ) -> Result<Cell> {
        let this = Arc::clone(self);
        let language = language.to_string();
        let payload = json!({ "language": language, "index": index });
        self.enqueue("createCell", payload, user, move || async move {
            this.store.create_cell(&this.session, &language, index).await
        })
        .await
    }

    pub async fn delete_cell(self: &Arc<Self>, cell_id: &str, user: Option<UserRef>) -> Result<Cell> {
        let this = Arc::clone(self);
        let cell_id = cell_id.to_string();
        let payload = json!({ "cell": cell_id });
        self.enqueue("deleteCell", payload, user, move || async move {
            this.store.delete_cell(&this.session, &cell_id).await
        })
        .await
    }

    pub async fn save_cell_code(
        self: &Arc<Self>,
        cell_id: &str,
        code: &str,
        user: Option<UserRef>,
    ) -> Result<Cell> {
        let this = Arc::clone(self);
        let cell_id = cell_id.to_string();
        let code = code.to_string();
        let payload = json!({ "cell": cell_id });
        self.enqueue("saveCellCode", payload, user, move || async move {
            this.store.update_cell_code(&this.session, &cell_id, &code).await
        })
        .await
    }

    pub async fn set_cell_props(
        self: &Arc<Self>,
        cell_id: &str,
        props: Map<String, Value>,
        user: Option<UserRef>,
    ) -> Result<Cell> {
        let this = Arc::clone(self);
        let cell_id = cell_id.to_string();
        let payload = json!({ "cell": cell_id, "props": props });
        self.enqueue("setCellProps", payload, user, move || async move {
            this.store.set_cell_props(&this.session, &cell_id, props).await
        })
        .await
    }

    /// Swap a cell with the one above or below it.
    pub async fn move_cell(
        self: &Arc<Self>,
        cell_id: &str,
        direction: MoveDirection,
        user: Option<UserRef>,
    ) -> Result<()> {
        let this = Arc::clone(self);
        let cell_id = cell_id.to_string();
        let payload = json!({ "cell": cell_id, "direction": direction });
        self.enqueue("moveCell", payload, user, move || async move {
            this.store.move_cell(&this.session, &cell_id, direction).await
        })
        .await
    }

    /// Move a cell to `index`, counted from 1.
    pub async fn move_cell_to(
        self: &Arc<Self>,
        cell_id: &str,
        index: usize,
        user: Option<UserRef>,
    ) -> Result<()> {
        let this = Arc::clone(self);
        let cell_id = cell_id.to_string();
        let payload = json!({ "cell": cell_id, "index": index });
        self.enqueue("moveCellTo", payload, user, move || async move {
            this.store.move_cell_to(&this.session, &cell_id, index).await
        })
        .await
    }

    pub async fn clear_history(self: &Arc<Self>, user: Option<UserRef>) -> Result<()> {
        let this = Arc::clone(self);
        self.enqueue("clearHistory", json!({}), user, move || async move {
            this.store.clear_history(&this.session).await?;
            this.emit(SessionEvent::HistoryCleared);
            Ok(())
        })
        .await
    }

    pub fn kernel_infos(&self, include_details: bool) -> BTreeMap<String, KernelInfo> {
        guard(&self.kernels)
            .iter()
            .map(|(kernel_type, attached)| (kernel_type.clone(), attached.kernel.info(include_details)))
            .collect()
    }

    /// Attach every kernel type already registered for this session's scope.
    pub async fn init_kernels(self: &Arc<Self>, user: Option<UserRef>) -> Result<Vec<String>> {
        let scope = self.store.scope_of(&self.session).await?;
        let types = self.registry.attached_types(&scope);
        let handles: Vec<TicketHandle<Arc<Kernel>>> = types
            .iter()
            .map(|kernel_type| self.submit_attach(kernel_type, user.clone()))
            .collect();
        for handle in handles {
            handle.wait().await?;
        }
        Ok(types)
    }

    /// Stop accepting tickets, fail the ones still queued, wait for the one
    /// in flight and release every attached kernel.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        guard(&self.tickets).take();
        let executor = guard(&self.executor).take();
        if let Some(executor) = executor {
            let _ = executor.await;
        }
        for kernel_type in self.attached_kernels() {
            self.shutdown_kernel(&kernel_type);
        }
        tracing::info!(session = %self.session, "session queue shut down");
    }
}

async fn run_executor(
    session: String,
    mut tickets: mpsc::UnboundedReceiver<Ticket>,
    history: mpsc::UnboundedSender<HistoryCommand>,
    closed: Arc<AtomicBool>,
    history_wait: Duration,
) {
    while let Some(ticket) = tickets.recv().await {
        if tokio::time::timeout(history_wait, ticket.recorded).await.is_err() {
            tracing::warn!(session = %session, ticket = %ticket.id, "history entry still pending, starting anyway");
        }
        if closed.load(Ordering::SeqCst) {
            let _ = (ticket.job)(Admission::Reject).await;
            let _ = history.send(HistoryCommand::Update {
                ticket_id: ticket.id,
                status: TicketStatus::Failed,
                error: Some(ErrorReport::from(&OrchestratorError::QueueClosed)),
            });
            continue;
        }

        let _ = history.send(HistoryCommand::Update {
            ticket_id: ticket.id,
            status: TicketStatus::Started,
            error: None,
        });
        tracing::debug!(session = %session, ticket = %ticket.id, name = %ticket.name, "ticket started");
        let outcome = match tokio::spawn((ticket.job)(Admission::Run)).await {
            Ok(outcome) => outcome,
            Err(join) => Err(OrchestratorError::Internal(format!("worker aborted: {join}"))),
        };
        let (status, error) = match outcome {
            Ok(()) => (TicketStatus::Finished, None),
            Err(err) => {
                tracing::debug!(session = %session, ticket = %ticket.id, name = %ticket.name, error = %err, "ticket failed");
                (TicketStatus::Failed, Some(ErrorReport::from(&err)))
            }
        };
        let _ = history.send(HistoryCommand::Update {
            ticket_id: ticket.id,
            status,
            error,
        });
    }
}

async fn run_history_writer(
    session: String,
    store: Arc<dyn SessionStore>,
    mut commands: mpsc::UnboundedReceiver<HistoryCommand>,
    events: broadcast::Sender<SessionEvent>,
) {
    // Ticket id -> whether its entry exists in the store.
    let mut entries: HashMap<Uuid, bool> = HashMap::new();
    while let Some(command) = commands.recv().await {
        match command {
            HistoryCommand::Create { entry, recorded } => {
                let ticket_id = entry.ticket_id;
                match store.add_history_entry(&session, entry).await {
                    Ok(created) => {
                        entries.insert(ticket_id, true);
                        let _ = events.send(SessionEvent::TaskQueued { entry: created });
                    }
                    Err(err) => {
                        entries.insert(ticket_id, false);
                        let _ = events.send(SessionEvent::Error {
                            report: ErrorReport::wrap("Error on creating a history entry", &err),
                        });
                    }
                }
                let _ = recorded.send(());
            }
            HistoryCommand::Update {
                ticket_id,
                status,
                error,
            } => {
                let exists = match entries.get(&ticket_id) {
                    Some(exists) => *exists,
                    None => {
                        let _ = events.send(SessionEvent::Error {
                            report: ErrorReport::new(
                                ErrorKind::Internal,
                                format!("Error on history update: no entry for ticket {ticket_id}"),
                            ),
                        });
                        continue;
                    }
                };
                if status.is_terminal() {
                    entries.remove(&ticket_id);
                }
                if !exists {
                    continue;
                }
                match store
                    .update_history_entry(&session, ticket_id, status, error)
                    .await
                {
                    Ok(Some(entry)) => {
                        let event = match status {
                            TicketStatus::Queued => SessionEvent::TaskQueued { entry },
                            TicketStatus::Started => SessionEvent::TaskStarted { entry },
                            TicketStatus::Finished => SessionEvent::TaskFinished { entry },
                            TicketStatus::Failed => SessionEvent::TaskFailed { entry },
                        };
                        let _ = events.send(event);
                    }
                    Ok(None) => {
                        tracing::debug!(session = %session, ticket = %ticket_id, "history entry gone, update dropped");
                    }
                    Err(err) => {
                        let _ = events.send(SessionEvent::Error {
                            report: ErrorReport::wrap("Error on updating a history entry", &err),
                        });
                    }
                }
            }
        }
    }
}
