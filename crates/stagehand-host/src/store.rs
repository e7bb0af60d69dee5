//! Session persistence contract (history entries and cells) plus an
//! in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{ErrorReport, OrchestratorError, Result};
use crate::kernel::catalog::DEFAULT_RESOURCE_CLASS;
use crate::util::now_wallclock_ns;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub admin: bool,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: String::new(),
            admin: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Finished | TicketStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub ticket_id: Uuid,
    pub name: String,
    pub payload: Value,
    pub user: Option<UserRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub session: String,
    pub ticket_id: Uuid,
    pub name: String,
    pub payload: Value,
    pub user: Option<String>,
    pub status: TicketStatus,
    pub queued_at_ns: u64,
    pub started_at_ns: Option<u64>,
    pub finished_at_ns: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub output: Vec<Value>,
    #[serde(default)]
    pub error: Vec<Value>,
    #[serde(default)]
    pub stderr: Vec<String>,
    #[serde(default)]
    pub evaluated: bool,
    /// Packages the code last evaluated in this cell refers to.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Free-form properties set by clients (title, collapsed state and so on).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub props: Map<String, Value>,
}

impl Cell {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            language: language.into(),
            code: String::new(),
            output: Vec::new(),
            error: Vec::new(),
            stderr: Vec::new(),
            evaluated: false,
            dependencies: Vec::new(),
            props: Map::new(),
        }
    }

    /// Apply client properties. `code` and `language` strings land on the
    /// fields of the same name; everything else is kept in `props`.
    pub fn apply_props(&mut self, props: Map<String, Value>) {
        for (key, value) in props {
            let field = match key.as_str() {
                "code" => Some(&mut self.code),
                "language" => Some(&mut self.language),
                _ => None,
            };
            match (field, value) {
                (Some(field), Value::String(text)) => *field = text,
                (_, value) => {
                    self.props.insert(key, value);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

/// Environment variable configured on a project; set in every runtime
/// before a cell runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectVariable {
    pub name: String,
    pub value: String,
}

/// Storage the session queue writes through. Implementations must be safe to
/// call from many sessions at once.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Scope (project) a session belongs to. Kernels are shared per scope.
    async fn scope_of(&self, session: &str) -> Result<String>;

    /// Resource class of `user`; drives memory and CPU of new kernels.
    async fn resource_class(&self, user: &UserRef) -> Result<String>;

    async fn add_history_entry(&self, session: &str, entry: NewHistoryEntry)
    -> Result<HistoryEntry>;

    /// Returns `None` when the entry no longer exists (history was cleared).
    async fn update_history_entry(
        &self,
        session: &str,
        ticket_id: Uuid,
        status: TicketStatus,
        error: Option<ErrorReport>,
    ) -> Result<Option<HistoryEntry>>;

    async fn history(&self, session: &str) -> Result<Vec<HistoryEntry>>;

    async fn clear_history(&self, session: &str) -> Result<()>;

    async fn cells(&self, session: &str) -> Result<Vec<Cell>>;

    async fn cell(&self, session: &str, cell_id: &str) -> Result<Cell>;

    async fn create_cell(&self, session: &str, language: &str, index: Option<usize>)
    -> Result<Cell>;

    async fn delete_cell(&self, session: &str, cell_id: &str) -> Result<Cell>;

    async fn update_cell_code(&self, session: &str, cell_id: &str, code: &str) -> Result<Cell>;

    async fn save_cell(&self, session: &str, cell: Cell) -> Result<Cell>;

    async fn set_cell_props(
        &self,
        session: &str,
        cell_id: &str,
        props: Map<String, Value>,
    ) -> Result<Cell>;

    /// Swap a cell with its neighbour. A missing cell or a move past either
    /// end leaves the order unchanged.
    async fn move_cell(&self, session: &str, cell_id: &str, direction: MoveDirection)
    -> Result<()>;

    /// Move a cell to a 1-based position, clamped to the ends. A missing
    /// cell leaves the order unchanged.
    async fn move_cell_to(&self, session: &str, cell_id: &str, index: usize) -> Result<()>;

    /// Environment variables of a scope (project).
    async fn project_variables(&self, scope: &str) -> Result<Vec<ProjectVariable>>;

    /// Variables each kernel last reported, tagged with their `language`.
    async fn globals(&self, session: &str) -> Result<Vec<Value>>;

    async fn set_globals(&self, session: &str, globals: Vec<Value>) -> Result<()>;
}

#[derive(Default)]
struct SessionRecord {
    scope: Option<String>,
    history: Vec<HistoryEntry>,
    cells: Vec<Cell>,
    globals: Vec<Value>,
}

/// Process-local store. Sessions spring into existence on first use and
/// default to a scope named after themselves.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    resource_classes: Mutex<HashMap<String, String>>,
    variables: Mutex<HashMap<String, Vec<ProjectVariable>>>,
    fail_history_creation: AtomicBool,
    history_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_scope(&self, session: &str, scope: &str) {
        self.with_session(session, |record| record.scope = Some(scope.to_string()));
    }

    pub fn set_resource_class(&self, user_id: &str, class: &str) {
        self.resource_classes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), class.to_string());
    }

    pub fn set_project_variables(&self, scope: &str, variables: Vec<ProjectVariable>) {
        self.variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.to_string(), variables);
    }

    /// Make every following `add_history_entry` fail with a storage error.
    pub fn fail_history_creation(&self, fail: bool) {
        self.fail_history_creation.store(fail, Ordering::SeqCst);
    }

    /// Hold every following `add_history_entry` for `delay` before it lands.
    pub fn delay_history_creation(&self, delay: Option<Duration>) {
        *self.history_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    fn with_session<T>(&self, session: &str, f: impl FnOnce(&mut SessionRecord) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f(sessions.entry(session.to_string()).or_default())
    }
}

fn missing_cell(cell_id: &str) -> OrchestratorError {
    OrchestratorError::ResourceNotFound(format!("cell {cell_id}"))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn scope_of(&self, session: &str) -> Result<String> {
        Ok(self.with_session(session, |record| {
            record.scope.clone().unwrap_or_else(|| session.to_string())
        }))
    }

    async fn resource_class(&self, user: &UserRef) -> Result<String> {
        Ok(self
            .resource_classes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user.id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_RESOURCE_CLASS.to_string()))
    }

    async fn add_history_entry(
        &self,
        session: &str,
        entry: NewHistoryEntry,
    ) -> Result<HistoryEntry> {
        let delay = *self.history_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history_creation.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Store("history entry rejected".into()));
        }
        let entry = HistoryEntry {
            session: session.to_string(),
            ticket_id: entry.ticket_id,
            name: entry.name,
            payload: entry.payload,
            user: entry.user.map(|u| u.id),
            status: TicketStatus::Queued,
            queued_at_ns: now_wallclock_ns(),
            started_at_ns: None,
            finished_at_ns: None,
            error: None,
        };
        self.with_session(session, |record| record.history.push(entry.clone()));
        Ok(entry)
    }

    async fn update_history_entry(
        &self,
        session: &str,
        ticket_id: Uuid,
        status: TicketStatus,
        error: Option<ErrorReport>,
    ) -> Result<Option<HistoryEntry>> {
        Ok(self.with_session(session, |record| {
            let entry = record.history.iter_mut().find(|e| e.ticket_id == ticket_id)?;
            let now = now_wallclock_ns();
            match status {
                TicketStatus::Queued => {}
                TicketStatus::Started => entry.started_at_ns = Some(now),
                TicketStatus::Finished | TicketStatus::Failed => entry.finished_at_ns = Some(now),
            }
            entry.status = status;
            if error.is_some() {
                entry.error = error;
            }
            Some(entry.clone())
        }))
    }

    async fn history(&self, session: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self.with_session(session, |record| record.history.clone()))
    }

    async fn clear_history(&self, session: &str) -> Result<()> {
        self.with_session(session, |record| record.history.clear());
        Ok(())
    }

    async fn cells(&self, session: &str) -> Result<Vec<Cell>> {
        Ok(self.with_session(session, |record| record.cells.clone()))
    }

    async fn cell(&self, session: &str, cell_id: &str) -> Result<Cell> {
        self.with_session(session, |record| {
            record.cells.iter().find(|c| c.id == cell_id).cloned()
        })
        .ok_or_else(|| missing_cell(cell_id))
    }

    async fn create_cell(
        &self,
        session: &str,
        language: &str,
        index: Option<usize>,
    ) -> Result<Cell> {
        let cell = Cell::new(language);
        self.with_session(session, |record| {
            let at = index.unwrap_or(record.cells.len()).min(record.cells.len());
            record.cells.insert(at, cell.clone());
        });
        Ok(cell)
    }

    async fn delete_cell(&self, session: &str, cell_id: &str) -> Result<Cell> {
        self.with_session(session, |record| {
            let at = record.cells.iter().position(|c| c.id == cell_id)?;
            Some(record.cells.remove(at))
        })
        .ok_or_else(|| missing_cell(cell_id))
    }

    async fn update_cell_code(&self, session: &str, cell_id: &str, code: &str) -> Result<Cell> {
        self.with_session(session, |record| {
            let cell = record.cells.iter_mut().find(|c| c.id == cell_id)?;
            cell.code = code.to_string();
            Some(cell.clone())
        })
        .ok_or_else(|| missing_cell(cell_id))
    }

    async fn save_cell(&self, session: &str, cell: Cell) -> Result<Cell> {
        self.with_session(session, |record| {
            let slot = record.cells.iter_mut().find(|c| c.id == cell.id)?;
            *slot = cell.clone();
            Some(cell.clone())
        })
        .ok_or_else(|| missing_cell(&cell.id))
    }

    async fn set_cell_props(
        &self,
        session: &str,
        cell_id: &str,
        props: Map<String, Value>,
    ) -> Result<Cell> {
        self.with_session(session, |record| {
            let cell = record.cells.iter_mut().find(|c| c.id == cell_id)?;
            cell.apply_props(props);
            Some(cell.clone())
        })
        .ok_or_else(|| missing_cell(cell_id))
    }

    async fn move_cell(
        &self,
        session: &str,
        cell_id: &str,
        direction: MoveDirection,
    ) -> Result<()> {
        self.with_session(session, |record| {
            let Some(at) = record.cells.iter().position(|c| c.id == cell_id) else {
                return;
            };
            let other = match direction {
                MoveDirection::Up => at.checked_sub(1),
                MoveDirection::Down => Some(at + 1).filter(|i| *i < record.cells.len()),
            };
            if let Some(other) = other {
                record.cells.swap(at, other);
            }
        });
        Ok(())
    }

    async fn move_cell_to(&self, session: &str, cell_id: &str, index: usize) -> Result<()> {
        self.with_session(session, |record| {
            let Some(at) = record.cells.iter().position(|c| c.id == cell_id) else {
                return;
            };
            let cell = record.cells.remove(at);
            let to = index.saturating_sub(1).min(record.cells.len());
            record.cells.insert(to, cell);
        });
        Ok(())
    }

    async fn project_variables(&self, scope: &str) -> Result<Vec<ProjectVariable>> {
        Ok(self
            .variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn globals(&self, session: &str) -> Result<Vec<Value>> {
        Ok(self.with_session(session, |record| record.globals.clone()))
    }

    async fn set_globals(&self, session: &str, globals: Vec<Value>) -> Result<()> {
        self.with_session(session, |record| record.globals = globals);
        Ok(())
    }
}
