//! `stagehand sessions` and `stagehand detach`.

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};

use crate::opts::GlobalOpts;
use crate::output::{field, print_success, print_table, wants_json};

use super::request;

#[derive(Args, Debug)]
pub struct DetachArgs {
    /// Session to shut down
    pub session: String,
}

pub async fn cmd_sessions(opts: &GlobalOpts) -> Result<()> {
    let sessions = request(opts, "sessions", json!({})).await?;
    if wants_json(opts) {
        return print_success(opts, sessions, vec![]);
    }
    let mut rows = Vec::new();
    for session in sessions.as_array().map(Vec::as_slice).unwrap_or_default() {
        let pinned = session.get("pinned").and_then(Value::as_bool) == Some(true);
        let kernels = session
            .get("kernels")
            .and_then(Value::as_object)
            .map(|kernels| {
                kernels
                    .iter()
                    .map(|(name, info)| format!("{name}:{}", field(info, "status")))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        rows.push(vec![
            field(session, "session"),
            if pinned { "yes" } else { "no" }.to_string(),
            kernels,
        ]);
    }
    print_table(&["SESSION", "PINNED", "KERNELS"], &rows);
    Ok(())
}

pub async fn cmd_detach(opts: &GlobalOpts, args: &DetachArgs) -> Result<()> {
    let result = request(opts, "detach-session", json!({ "session": args.session })).await?;
    let detached = result.get("detached").and_then(Value::as_bool) == Some(true);
    let warnings = if detached {
        vec![]
    } else {
        vec![format!("session {} is pinned or unknown", args.session)]
    };
    print_success(opts, json!({ "session": args.session, "detached": detached }), warnings)
}
