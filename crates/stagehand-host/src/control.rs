use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::deployment::ReserveUpdate;
use crate::error::{OrchestratorError, Result};
use crate::modes::daemon::ControlMsg;
use crate::store::UserRef;

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub v: u8,
    pub id: String,
    pub cmd: String,
    #[serde(default)]
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn new(cmd: &str, payload: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: Uuid::new_v4().to_string(),
            cmd: cmd.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlError {
    pub code: String,
    pub message: String,
}

impl ControlError {
    fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: "invalid_request".into(),
            message: msg.into(),
        }
    }

    fn unknown_method() -> Self {
        Self {
            code: "unknown_method".into(),
            message: "unknown command".into(),
        }
    }

    fn decode(msg: impl Into<String>) -> Self {
        Self {
            code: "decode_error".into(),
            message: msg.into(),
        }
    }

    fn daemon_gone() -> Self {
        Self {
            code: "unavailable".into(),
            message: "daemon is shutting down".into(),
        }
    }
}

impl From<OrchestratorError> for ControlError {
    fn from(err: OrchestratorError) -> Self {
        Self {
            code: err.code().into(),
            message: err.to_string(),
        }
    }
}

/// Control server on a Unix socket with NDJSON framing. Translates requests
/// into daemon control messages and waits for the replies.
pub struct ControlServer {
    path: PathBuf,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ControlServer {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        control_tx: mpsc::Sender<ControlMsg>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let shutdown_rx = shutdown_tx.subscribe();
        Self {
            path: path.into(),
            control_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }

        let listener = UnixListener::bind(&self.path).map_err(|e| {
            OrchestratorError::Internal(format!("failed to bind control socket: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600));
        }
        tracing::info!(path = %self.path.display(), "control socket listening");

        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let tx = self.control_tx.clone();
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(handle_conn(stream, tx, shutdown_tx));
                        }
                        Err(err) => tracing::warn!(error = %err, "control accept failed"),
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    let _ = std::fs::remove_file(&self.path);
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_conn(
    stream: UnixStream,
    control_tx: mpsc::Sender<ControlMsg>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let mut line = String::new();

    while let Ok(n) = reader.read_line(&mut line).await {
        if n == 0 {
            break;
        }
        let resp = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(req) => handle_request(req, &control_tx, &shutdown_tx).await,
            Err(e) => ResponseEnvelope {
                id: String::new(),
                ok: false,
                result: None,
                error: Some(ControlError::decode(e.to_string())),
            },
        };
        if let Ok(json) = serde_json::to_string(&resp) {
            let _ = w.write_all(json.as_bytes()).await;
            let _ = w.write_all(b"\n").await;
        }
        line.clear();
    }
}

/// Send one message to the daemon and serialize its reply.
async fn call<T: Serialize>(
    control_tx: &mpsc::Sender<ControlMsg>,
    msg: impl FnOnce(oneshot::Sender<Result<T>>) -> ControlMsg,
) -> Result<Value, ControlError> {
    let (tx, rx) = oneshot::channel();
    control_tx
        .send(msg(tx))
        .await
        .map_err(|_| ControlError::daemon_gone())?;
    let reply = rx.await.map_err(|_| ControlError::daemon_gone())??;
    serde_json::to_value(reply).map_err(|e| ControlError::decode(e.to_string()))
}

fn payload<T: DeserializeOwned>(value: &Value) -> Result<T, ControlError> {
    serde_json::from_value(value.clone()).map_err(|e| ControlError::decode(e.to_string()))
}

fn required_str(value: &Value, field: &str) -> Result<String, ControlError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ControlError::invalid_request(format!("missing {field}")))
}

#[derive(Debug, Deserialize)]
struct AttachPayload {
    session: String,
    kernel: String,
    #[serde(default)]
    user: Option<UserRef>,
}

#[derive(Debug, Deserialize)]
struct EvalPayload {
    session: String,
    kernel: String,
    code: String,
    #[serde(default)]
    user: Option<UserRef>,
}

async fn handle_request(
    req: RequestEnvelope,
    control_tx: &mpsc::Sender<ControlMsg>,
    shutdown_tx: &broadcast::Sender<()>,
) -> ResponseEnvelope {
    let id = req.id.clone();
    let res: Result<Value, ControlError> = async {
        if req.v != PROTOCOL_VERSION {
            return Err(ControlError::invalid_request("unsupported protocol version"));
        }
        match req.cmd.as_str() {
            "kernels" => call(control_tx, |resp| ControlMsg::Kernels { resp }).await,
            "kill-kernel" => {
                let id = required_str(&req.payload, "id")?;
                call(control_tx, |resp| ControlMsg::KillKernel { id, resp }).await
            }
            "flush" => call(control_tx, |resp| ControlMsg::Flush { resp }).await,
            "get-reserve-config" => {
                call(control_tx, |resp| ControlMsg::GetReserveConfig { resp }).await
            }
            "set-reserve-config" => {
                let update: ReserveUpdate = payload(&req.payload)?;
                call(control_tx, |resp| ControlMsg::SetReserveConfig { update, resp }).await
            }
            "sessions" => call(control_tx, |resp| ControlMsg::Sessions { resp }).await,
            "attach" => {
                let p: AttachPayload = payload(&req.payload)?;
                call(control_tx, |resp| ControlMsg::Attach {
                    session: p.session,
                    kernel: p.kernel,
                    user: p.user,
                    resp,
                })
                .await
            }
            "eval" => {
                let p: EvalPayload = payload(&req.payload)?;
                call(control_tx, |resp| ControlMsg::Eval {
                    session: p.session,
                    kernel: p.kernel,
                    code: p.code,
                    user: p.user,
                    resp,
                })
                .await
            }
            "detach-session" => {
                let session = required_str(&req.payload, "session")?;
                let detached = call(control_tx, |resp| ControlMsg::DetachSession { session, resp })
                    .await?;
                Ok(serde_json::json!({ "detached": detached }))
            }
            "catalog" => call(control_tx, |resp| ControlMsg::Catalog { resp }).await,
            "shutdown" => {
                call(control_tx, |resp| ControlMsg::Shutdown {
                    resp,
                    shutdown_tx: shutdown_tx.clone(),
                })
                .await?;
                Ok(serde_json::json!({}))
            }
            _ => Err(ControlError::unknown_method()),
        }
    }
    .await;

    match res {
        Ok(val) => ResponseEnvelope {
            id,
            ok: true,
            result: Some(val),
            error: None,
        },
        Err(e) => ResponseEnvelope {
            id,
            ok: false,
            result: None,
            error: Some(e),
        },
    }
}

/// Control client used by the CLI and tests.
pub struct ControlClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        let reader = BufReader::new(r);
        Ok(Self { reader, writer: w })
    }

    pub async fn request(&mut self, envelope: &RequestEnvelope) -> std::io::Result<ResponseEnvelope> {
        let json = serde_json::to_string(envelope).map_err(std::io::Error::other)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "control socket closed",
            ));
        }
        serde_json::from_str(&line).map_err(std::io::Error::other)
    }

    /// Build an envelope for `cmd` and send it.
    pub async fn send(&mut self, cmd: &str, payload: Value) -> std::io::Result<ResponseEnvelope> {
        self.request(&RequestEnvelope::new(cmd, payload)).await
    }
}
