//! Output helpers for human and JSON modes.
//!
//! Human mode prints data to stdout and notices to stderr. JSON mode wraps
//! the data in `{ data, warnings? }` and respects `--pretty` and `--quiet`.

use std::io::Write;

use anyhow::Result;
use serde_json::{Value, json};

use crate::opts::GlobalOpts;

pub fn wants_json(opts: &GlobalOpts) -> bool {
    opts.json || opts.pretty
}

pub fn print_success(opts: &GlobalOpts, data: Value, mut warnings: Vec<String>) -> Result<()> {
    if opts.quiet {
        warnings.clear();
    }
    if wants_json(opts) {
        let mut root = json!({ "data": data });
        if !warnings.is_empty() {
            root["warnings"] = warnings.into_iter().map(Value::String).collect();
        }
        if opts.pretty {
            println!("{}", serde_json::to_string_pretty(&root)?);
        } else {
            println!("{}", serde_json::to_string(&root)?);
        }
        return Ok(());
    }
    let mut stderr = std::io::stderr();
    for w in warnings {
        writeln!(stderr, "notice: {w}")?;
    }
    print_value(data)
}

fn print_value(value: Value) -> Result<()> {
    match value {
        Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(&other)?),
    }
    Ok(())
}

/// Left-aligned columns sized to their widest cell.
pub fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.len());
            }
        }
    }
    let line = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };
    println!("{}", line(headers.to_vec()));
    for row in rows {
        println!("{}", line(row.iter().map(String::as_str).collect()));
    }
}

/// String field of a JSON object, empty when missing.
pub fn field(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
