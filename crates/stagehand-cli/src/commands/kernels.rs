//! `stagehand kernels`, `stagehand kill` and `stagehand flush`.

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};

use crate::opts::GlobalOpts;
use crate::output::{field, print_success, print_table, wants_json};

use super::request;

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Kernel id, or any id the backend knows the kernel by
    pub id: String,
}

pub async fn cmd_kernels(opts: &GlobalOpts) -> Result<()> {
    let kernels = request(opts, "kernels", json!({})).await?;
    if wants_json(opts) {
        return print_success(opts, kernels, vec![]);
    }
    let rows: Vec<Vec<String>> = kernels
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|kernel| {
            let owner = kernel
                .get("owner")
                .map(|owner| field(owner, "id"))
                .unwrap_or_default();
            let role = if kernel.get("reserve").and_then(Value::as_bool) == Some(true) {
                "reserve"
            } else {
                "assigned"
            };
            vec![
                field(kernel, "id"),
                field(kernel, "name"),
                field(kernel, "status"),
                role.to_string(),
                field(kernel, "scope"),
                owner,
            ]
        })
        .collect();
    print_table(&["ID", "RUNTIME", "STATUS", "ROLE", "SCOPE", "OWNER"], &rows);
    Ok(())
}

pub async fn cmd_kill(opts: &GlobalOpts, args: &KillArgs) -> Result<()> {
    request(opts, "kill-kernel", json!({ "id": args.id })).await?;
    print_success(opts, json!({ "killed": args.id }), vec![])
}

pub async fn cmd_flush(opts: &GlobalOpts) -> Result<()> {
    request(opts, "flush", json!({})).await?;
    print_success(opts, json!({ "flushed": true }), vec![])
}
