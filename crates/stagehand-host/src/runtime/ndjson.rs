//! Runtime connection speaking newline-delimited JSON over any byte stream
//! (child process stdio, a TCP socket).
//!
//! Requests: `{"id", "op": "start"|"execute"|"interrupt"|"shutdown", "code"?}`.
//! Replies carry the request id and a `type`: `ack`, `output`, `error`,
//! `stderr`, `done` or `failed`. Unsolicited `{"type": "status"}` lines update
//! the runtime status.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Execution, ExecutionEvent, ExecutionSink, RuntimeHandle, RuntimeStatus};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Serialize)]
struct RuntimeRequest<'a> {
    id: &'a str,
    op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RuntimeMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    status: Option<RuntimeStatus>,
    #[serde(default)]
    message: Option<String>,
}

enum Pending {
    Ack(oneshot::Sender<Result<Value>>),
    Execute(ExecutionSink),
}

type PendingTable = Arc<Mutex<HashMap<String, Pending>>>;

pub struct NdjsonRuntime {
    id: String,
    name: String,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingTable,
    status: watch::Receiver<RuntimeStatus>,
    next_request: AtomicU64,
    reader: JoinHandle<()>,
}

impl NdjsonRuntime {
    /// Wire up the stream and send `start`. The runtime id comes from the
    /// ack's `id` field when present.
    pub async fn start<R, W>(name: &str, reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let (status_tx, status_rx) = watch::channel(RuntimeStatus::Starting);
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), status_tx));
        let mut runtime = Self {
            id: String::new(),
            name: name.to_string(),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            status: status_rx,
            next_request: AtomicU64::new(0),
            reader,
        };
        let ack = runtime.request("start", None).await?;
        runtime.id = ack
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::debug!(runtime = %runtime.name, runtime_id = %runtime.id, "runtime started");
        Ok(runtime)
    }

    fn next_id(&self) -> String {
        format!("r{}", self.next_request.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, request: &RuntimeRequest<'_>) -> Result<()> {
        let mut line = serde_json::to_string(request)
            .map_err(|e| OrchestratorError::Internal(format!("encode runtime request: {e}")))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("write to runtime: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| OrchestratorError::Runtime(format!("flush runtime stream: {e}")))
    }

    async fn request(&self, op: &str, code: Option<&str>) -> Result<Value> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.clone(), Pending::Ack(tx));
        if let Err(err) = self.send(&RuntimeRequest { id: &id, op, code }).await {
            self.pending().remove(&id);
            return Err(err);
        }
        rx.await
            .map_err(|_| OrchestratorError::Runtime(format!("runtime dropped '{op}' request")))?
    }
}

impl Drop for NdjsonRuntime {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl RuntimeHandle for NdjsonRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, code: &str) -> Result<Execution> {
        if *self.status.borrow() == RuntimeStatus::Dead {
            return Err(OrchestratorError::KernelDead);
        }
        let id = self.next_id();
        let (sink, execution) = Execution::channel(code);
        self.pending().insert(id.clone(), Pending::Execute(sink));
        let request = RuntimeRequest {
            id: &id,
            op: "execute",
            code: Some(code),
        };
        if let Err(err) = self.send(&request).await {
            self.pending().remove(&id);
            return Err(err);
        }
        Ok(execution)
    }

    async fn interrupt(&self) -> Result<()> {
        self.request("interrupt", None).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        if *self.status.borrow() == RuntimeStatus::Dead {
            return Ok(());
        }
        self.request("shutdown", None).await.map(|_| ())
    }

    fn status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.clone()
    }
}

async fn read_loop<R>(reader: R, pending: PendingTable, status: watch::Sender<RuntimeStatus>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RuntimeMessage>(&line) {
                    Ok(msg) => dispatch(msg, &pending, &status),
                    Err(e) => tracing::warn!(error = %e, "undecodable runtime message"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "runtime stream failed");
                break;
            }
        }
    }
    status.send_replace(RuntimeStatus::Dead);
    let orphans: Vec<Pending> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(_, p)| p)
        .collect();
    for orphan in orphans {
        let err = OrchestratorError::Runtime("runtime connection closed".into());
        match orphan {
            Pending::Ack(tx) => {
                let _ = tx.send(Err(err));
            }
            Pending::Execute(sink) => sink.fail(err),
        }
    }
}

fn dispatch(msg: RuntimeMessage, pending: &PendingTable, status: &watch::Sender<RuntimeStatus>) {
    if msg.kind == "status" {
        if let Some(next) = msg.status {
            status.send_replace(next);
        }
        return;
    }
    let Some(id) = msg.id else {
        tracing::debug!(kind = %msg.kind, "runtime message without request id");
        return;
    };
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    match msg.kind.as_str() {
        "ack" => match pending.remove(&id) {
            Some(Pending::Ack(tx)) => {
                let _ = tx.send(Ok(msg.content));
            }
            Some(other) => {
                pending.insert(id, other);
            }
            None => {}
        },
        "failed" => {
            let err = OrchestratorError::Runtime(
                msg.message.unwrap_or_else(|| "runtime request failed".into()),
            );
            match pending.remove(&id) {
                Some(Pending::Ack(tx)) => {
                    let _ = tx.send(Err(err));
                }
                Some(Pending::Execute(sink)) => sink.fail(err),
                None => {}
            }
        }
        "output" | "error" | "stderr" => {
            let event = match msg.kind.as_str() {
                "output" => ExecutionEvent::Output(msg.content),
                "error" => ExecutionEvent::Error(msg.content),
                _ => ExecutionEvent::Stderr(msg.text.unwrap_or_default()),
            };
            if let Some(Pending::Execute(sink)) = pending.get_mut(&id) {
                sink.emit(event);
            }
        }
        "done" => {
            if let Some(Pending::Execute(mut sink)) = pending.remove(&id) {
                let result = sink.result_mut();
                if let Some(globals) = msg.content.get("globals").and_then(Value::as_array) {
                    result.globals = globals.clone();
                }
                if let Some(deps) = msg.content.get("dependencies").and_then(Value::as_array) {
                    result.dependencies = deps.clone();
                }
                sink.complete();
            }
        }
        other => tracing::debug!(kind = %other, "ignoring runtime message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Minimal runtime on the far end of a duplex pipe.
    fn spawn_fake(stream: DuplexStream) {
        tokio::spawn(async move {
            let (r, mut w) = tokio::io::split(stream);
            let mut lines = BufReader::new(r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let id = req["id"].as_str().unwrap().to_string();
                let replies = match req["op"].as_str().unwrap() {
                    "start" => vec![
                        json!({"id": id, "type": "ack", "content": {"id": "rt-7"}}),
                        json!({"type": "status", "status": "idle"}),
                    ],
                    "execute" => vec![
                        json!({"type": "status", "status": "busy"}),
                        json!({"id": id, "type": "output", "content": {"text": req["code"]}}),
                        json!({"id": id, "type": "stderr", "text": "careful"}),
                        json!({"id": id, "type": "done", "content": {"globals": [{"name": "x"}]}}),
                        json!({"type": "status", "status": "idle"}),
                    ],
                    "interrupt" => vec![json!({"id": id, "type": "failed", "message": "nothing to interrupt"})],
                    _ => vec![json!({"id": id, "type": "ack"})],
                };
                for reply in replies {
                    let mut out = reply.to_string();
                    out.push('\n');
                    w.write_all(out.as_bytes()).await.unwrap();
                }
                if req["op"] == "shutdown" {
                    break;
                }
            }
        });
    }

    async fn connected() -> NdjsonRuntime {
        let (client, server) = tokio::io::duplex(4096);
        spawn_fake(server);
        let (r, w) = tokio::io::split(client);
        NdjsonRuntime::start("python3", r, w).await.unwrap()
    }

    #[tokio::test]
    async fn start_takes_id_from_ack() {
        let runtime = connected().await;
        assert_eq!(runtime.id(), "rt-7");
        assert_eq!(runtime.name(), "python3");
    }

    #[tokio::test]
    async fn execute_streams_then_completes() {
        let runtime = connected().await;
        let execution = runtime.execute("1 + 1").await.unwrap();
        let mut events = Vec::new();
        let result = execution
            .drive(|event, _| events.push(event.clone()))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(result.output, vec![json!({"text": "1 + 1"})]);
        assert_eq!(result.stderr, vec!["careful".to_string()]);
        assert_eq!(result.globals, vec![json!({"name": "x"})]);
    }

    #[tokio::test]
    async fn failed_reply_surfaces_as_error() {
        let runtime = connected().await;
        let err = runtime.interrupt().await.unwrap_err();
        assert_eq!(err, OrchestratorError::Runtime("nothing to interrupt".into()));
    }

    #[tokio::test]
    async fn closed_stream_marks_dead() {
        let runtime = connected().await;
        runtime.shutdown().await.unwrap();
        let mut status = runtime.status();
        status
            .wait_for(|s| *s == RuntimeStatus::Dead)
            .await
            .unwrap();
        assert!(matches!(
            runtime.execute("1").await,
            Err(OrchestratorError::KernelDead)
        ));
    }
}
