//! Owns the live session queues, one per session id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::{QueueConfig, SessionQueue};
use crate::registry::KernelRegistry;
use crate::store::{SessionStore, UserRef};

const LIFECYCLE_CAPACITY: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionLifecycle {
    Attached { session: String },
    Detached { session: String },
}

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    registry: Arc<KernelRegistry>,
    config: QueueConfig,
    sessions: Mutex<HashMap<String, Arc<SessionQueue>>>,
    events: broadcast::Sender<SessionLifecycle>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        registry: Arc<KernelRegistry>,
        config: QueueConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(LIFECYCLE_CAPACITY);
        Self {
            store,
            registry,
            config,
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn sessions_guard(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionQueue>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionLifecycle> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Queue of `session`, created on first use.
    pub fn get_or_create(&self, session: &str, user: Option<&UserRef>) -> Arc<SessionQueue> {
        let mut sessions = self.sessions_guard();
        if let Some(queue) = sessions.get(session) {
            return Arc::clone(queue);
        }
        let queue = SessionQueue::new(
            session,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config,
        );
        sessions.insert(session.to_string(), Arc::clone(&queue));
        tracing::info!(session, user = user.map(|u| u.id.as_str()), "session attached");
        let _ = self.events.send(SessionLifecycle::Attached {
            session: session.to_string(),
        });
        queue
    }

    pub fn get(&self, session: &str) -> Option<Arc<SessionQueue>> {
        self.sessions_guard().get(session).cloned()
    }

    pub fn is_attached(&self, session: &str) -> bool {
        self.sessions_guard().contains_key(session)
    }

    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions_guard().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pin a session so `detach` leaves it running.
    pub fn keep_alive(&self, session: &str) -> bool {
        self.get(session)
            .map(|queue| queue.set_stay_alive(true))
            .is_some()
    }

    pub fn stop_keeping_alive(&self, session: &str) -> bool {
        self.get(session)
            .map(|queue| queue.set_stay_alive(false))
            .is_some()
    }

    /// Shut the session's queue down. Pinned sessions are left alone and
    /// `false` is returned.
    pub async fn detach(&self, session: &str) -> bool {
        let queue = {
            let mut sessions = self.sessions_guard();
            match sessions.get(session) {
                Some(queue) if queue.stays_alive() => return false,
                Some(_) => sessions.remove(session),
                None => return false,
            }
        };
        let Some(queue) = queue else { return false };
        queue.shutdown().await;
        tracing::info!(session, "session detached");
        let _ = self.events.send(SessionLifecycle::Detached {
            session: session.to_string(),
        });
        true
    }

    /// Detach every session regardless of pinning.
    pub async fn shutdown_all(&self) {
        let queues: Vec<Arc<SessionQueue>> =
            self.sessions_guard().drain().map(|(_, queue)| queue).collect();
        for queue in queues {
            queue.shutdown().await;
            let _ = self.events.send(SessionLifecycle::Detached {
                session: queue.session().to_string(),
            });
        }
    }
}
