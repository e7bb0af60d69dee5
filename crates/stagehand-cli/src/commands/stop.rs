//! `stagehand stop` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::{request, try_control_client};

pub async fn cmd_stop(opts: &GlobalOpts) -> Result<()> {
    if try_control_client(opts).await.is_none() {
        anyhow::bail!("No daemon running. Nothing to shut down.");
    }
    request(opts, "shutdown", json!({})).await?;
    print_success(opts, json!({ "stopped": true }), vec![])
}
