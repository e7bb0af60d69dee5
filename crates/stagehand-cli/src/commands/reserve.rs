//! `stagehand reserve get|set`.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use clap::Args;
use serde_json::json;
use stagehand_host::config::parse_shares;
use stagehand_host::deployment::ReserveUpdate;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::request;

#[derive(Args, Debug)]
pub struct ReserveSetArgs {
    /// Upper bound on assigned plus reserve kernels
    #[arg(long)]
    pub max_kernels: Option<u32>,

    /// Reserve share per runtime, e.g. `--share ir=6 --share python3=4`
    #[arg(long = "share", value_name = "RUNTIME=COUNT")]
    pub shares: Vec<String>,
}

pub async fn cmd_reserve_get(opts: &GlobalOpts) -> Result<()> {
    let config = request(opts, "get-reserve-config", json!({})).await?;
    if config.is_null() {
        return print_success(
            opts,
            config,
            vec!["this deployment keeps no reserve".into()],
        );
    }
    print_success(opts, config, vec![])
}

pub async fn cmd_reserve_set(opts: &GlobalOpts, args: &ReserveSetArgs) -> Result<()> {
    let mut shares = BTreeMap::new();
    for raw in &args.shares {
        shares.extend(parse_shares(raw)?);
    }
    if args.max_kernels.is_none() && shares.is_empty() {
        bail!("nothing to change; pass --max-kernels and/or --share");
    }
    let update = ReserveUpdate {
        max_kernels: args.max_kernels,
        shares,
    };
    let mut warnings = Vec::new();
    if update.max_kernels == Some(0) || update.shares.values().any(|v| *v == 0) {
        warnings.push("zero values are ignored".to_string());
    }
    let config = request(opts, "set-reserve-config", serde_json::to_value(&update)?).await?;
    print_success(opts, config, warnings)
}
