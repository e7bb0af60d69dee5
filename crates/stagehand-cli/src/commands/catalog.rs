//! `stagehand catalog` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::GlobalOpts;
use crate::output::{field, print_success, print_table, wants_json};

use super::request;

pub async fn cmd_catalog(opts: &GlobalOpts) -> Result<()> {
    let catalog = request(opts, "catalog", json!({})).await?;
    if wants_json(opts) {
        return print_success(opts, catalog, vec![]);
    }
    let rows: Vec<Vec<String>> = catalog
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|spec| {
            vec![
                field(spec, "name"),
                field(spec, "aceMode"),
                field(spec, "isMarkup"),
            ]
        })
        .collect();
    print_table(&["NAME", "EDITOR MODE", "MARKUP"], &rows);
    Ok(())
}
