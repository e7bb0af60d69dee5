//! Work-dispatch queue for long running creation jobs. Each job runs on its
//! own task and reports progress over a broadcast channel.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::error::{ErrorReport, OrchestratorError, Result};
use crate::util::now_wallclock_ns;

const JOB_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Progress {
        finished: u32,
        message: String,
        data: Value,
    },
    Complete,
    Failed(ErrorReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: u64,
    pub job_type: String,
    pub payload: Value,
    pub submitted_at_ns: u64,
}

/// Handed to the job body so it can report progress.
#[derive(Clone)]
pub struct JobProgress {
    events: broadcast::Sender<JobEvent>,
}

impl JobProgress {
    pub fn report(&self, finished: u32, message: impl Into<String>, data: Value) {
        let _ = self.events.send(JobEvent::Progress {
            finished,
            message: message.into(),
            data,
        });
    }
}

pub struct JobHandle<T> {
    pub id: u64,
    events: broadcast::Sender<JobEvent>,
    first: Option<broadcast::Receiver<JobEvent>>,
    result: watch::Receiver<Option<Result<T>>>,
}

impl<T: Clone> JobHandle<T> {
    /// Event stream of the job. The first call sees every event since submit.
    pub fn events(&mut self) -> broadcast::Receiver<JobEvent> {
        self.first.take().unwrap_or_else(|| self.events.subscribe())
    }

    pub async fn wait(&self) -> Result<T> {
        let mut result = self.result.clone();
        let outcome = result
            .wait_for(Option::is_some)
            .await
            .map_err(|_| OrchestratorError::Internal("job dropped before completing".into()))?;
        match &*outcome {
            Some(res) => res.clone(),
            None => Err(OrchestratorError::Internal("job finished without a result".into())),
        }
    }
}

#[derive(Default)]
pub struct JobQueue {
    next_id: AtomicU64,
    active: Arc<Mutex<BTreeMap<u64, JobSummary>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit<T, F, Fut>(&self, job_type: &str, payload: Value, work: F) -> JobHandle<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(JobProgress) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (events, first) = broadcast::channel(JOB_EVENT_CAPACITY);
        let (result_tx, result_rx) = watch::channel(None);
        self.active.lock().unwrap_or_else(PoisonError::into_inner).insert(
            id,
            JobSummary {
                id,
                job_type: job_type.to_string(),
                payload,
                submitted_at_ns: now_wallclock_ns(),
            },
        );

        let fut = work(JobProgress {
            events: events.clone(),
        });
        let job_events = events.clone();
        let active = Arc::clone(&self.active);
        let job_type = job_type.to_string();
        tokio::spawn(async move {
            let outcome = fut.await;
            match &outcome {
                Ok(_) => {
                    let _ = job_events.send(JobEvent::Complete);
                }
                Err(err) => {
                    tracing::warn!(job_id = id, job_type = %job_type, error = %err, "job failed");
                    let _ = job_events.send(JobEvent::Failed(ErrorReport::from(err)));
                }
            }
            active.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            let _ = result_tx.send(Some(outcome));
        });

        JobHandle {
            id,
            events,
            first: Some(first),
            result: result_rx,
        }
    }

    /// Jobs submitted and not yet finished.
    pub fn active(&self) -> Vec<JobSummary> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn progress_then_complete() {
        let jobs = JobQueue::new();
        let mut handle = jobs.submit("create-kernel", json!({"name": "Python"}), |progress| async move {
            progress.report(1, "provisioning", json!({"state": "CREATING_TASK"}));
            Ok(42u32)
        });
        let mut events = handle.events();
        assert_eq!(handle.wait().await.unwrap(), 42);

        match events.recv().await.unwrap() {
            JobEvent::Progress { finished, message, .. } => {
                assert_eq!(finished, 1);
                assert_eq!(message, "provisioning");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap(), JobEvent::Complete);
        assert!(jobs.active().is_empty());
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter() {
        let jobs = JobQueue::new();
        let handle = jobs.submit::<(), _, _>("create-kernel", json!({}), |_| async {
            Err(OrchestratorError::Backend("cluster unreachable".into()))
        });
        let first = handle.wait().await.unwrap_err();
        let second = handle.wait().await.unwrap_err();
        assert_eq!(first, second);
    }
}
