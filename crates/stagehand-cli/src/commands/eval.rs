//! `stagehand eval` command.

use std::io::Write;

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};

use crate::opts::GlobalOpts;
use crate::output::{print_success, wants_json};

use super::request;

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Session the evaluation is queued on
    #[arg(long)]
    pub session: String,

    /// Kernel type, e.g. Python, R, Markdown
    #[arg(long)]
    pub kernel: String,

    /// Id of the user the work is done for (env: STAGEHAND_USER)
    #[arg(long, env = "STAGEHAND_USER")]
    pub user: Option<String>,

    /// Code to evaluate
    pub code: String,
}

pub async fn cmd_eval(opts: &GlobalOpts, args: &EvalArgs) -> Result<()> {
    let mut payload = json!({
        "session": args.session,
        "kernel": args.kernel,
        "code": args.code,
    });
    if let Some(user) = &args.user {
        payload["user"] = json!({ "id": user, "name": user });
    }
    let result = request(opts, "eval", payload).await?;
    if wants_json(opts) {
        return print_success(opts, result, vec![]);
    }

    for output in list(&result, "output") {
        match output.pointer("/data/text~1plain") {
            Some(Value::String(text)) => println!("{text}"),
            Some(other) => println!("{other}"),
            None => println!("{output}"),
        }
    }
    let mut stderr = std::io::stderr();
    for line in list(&result, "stderr") {
        writeln!(stderr, "{}", line.as_str().unwrap_or_default())?;
    }
    let errors = list(&result, "error");
    for error in errors {
        let name = error.get("ename").and_then(Value::as_str).unwrap_or("Error");
        let message = error.get("evalue").and_then(Value::as_str).unwrap_or_default();
        writeln!(stderr, "{name}: {message}")?;
    }
    if !errors.is_empty() {
        anyhow::bail!("evaluation raised {} error(s)", errors.len());
    }
    Ok(())
}

fn list<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}
