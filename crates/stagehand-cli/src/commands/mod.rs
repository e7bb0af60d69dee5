//! CLI command handlers.

pub mod catalog;
pub mod eval;
pub mod kernels;
pub mod reserve;
pub mod run;
pub mod sessions;
pub mod stop;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use stagehand_host::control::{ControlClient, RequestEnvelope, ResponseEnvelope};

use crate::opts::GlobalOpts;

/// Connect to the running daemon, if there is one.
pub async fn try_control_client(opts: &GlobalOpts) -> Option<ControlClient> {
    let socket_path = opts.control_socket();
    if socket_path.exists() {
        ControlClient::connect(&socket_path).await.ok()
    } else {
        None
    }
}

pub async fn control_client(opts: &GlobalOpts) -> Result<ControlClient> {
    try_control_client(opts).await.ok_or_else(|| {
        anyhow!(
            "no daemon running at {}; start one with `stagehand run`",
            opts.control_socket().display()
        )
    })
}

/// Send `cmd` to the daemon and return its result, turning protocol errors
/// into `anyhow` errors.
pub async fn request(opts: &GlobalOpts, cmd: &str, payload: Value) -> Result<Value> {
    let mut client = control_client(opts).await?;
    let envelope = RequestEnvelope::new(cmd, payload);
    let resp = send_with_timeout(opts, &mut client, &envelope).await?;
    into_result(cmd, resp)
}

async fn send_with_timeout(
    opts: &GlobalOpts,
    client: &mut ControlClient,
    envelope: &RequestEnvelope,
) -> Result<ResponseEnvelope> {
    let pending = client.request(envelope);
    let resp = match opts.timeout() {
        Some(limit) => tokio::time::timeout(limit, pending)
            .await
            .map_err(|_| anyhow!("{} timed out after {}ms", envelope.cmd, limit.as_millis()))?,
        None => pending.await,
    };
    resp.with_context(|| format!("control request {}", envelope.cmd))
}

fn into_result(cmd: &str, resp: ResponseEnvelope) -> Result<Value> {
    if resp.ok {
        return Ok(resp.result.unwrap_or(Value::Null));
    }
    match resp.error {
        Some(err) => bail!("{cmd} failed [{}]: {}", err.code, err.message),
        None => bail!("{cmd} failed without an error message"),
    }
}
