//! Kernel types the orchestrator knows about and the resource classes that
//! size them.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::runtime::markup::MarkupKind;
use crate::store::ProjectVariable;

pub const DEFAULT_RESOURCE_CLASS: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSyntax {
    Python,
    R,
    None,
}

#[derive(Debug, PartialEq, Eq)]
pub struct KernelSpec {
    pub name: &'static str,
    /// Runtime started for this kernel; markup kernels have none.
    pub runtime: Option<&'static str>,
    pub ace_mode: &'static str,
    pub markup: Option<MarkupKind>,
    packages: PackageSyntax,
}

impl KernelSpec {
    pub fn is_markup(&self) -> bool {
        self.markup.is_some()
    }

    pub fn info(&self) -> KernelSpecInfo {
        KernelSpecInfo {
            name: self.name,
            ace_mode: self.ace_mode,
            is_markup: self.is_markup(),
        }
    }

    /// Packages referenced by `code`, for offering installs up front.
    pub fn detect_packages(&self, code: &str) -> BTreeSet<String> {
        let patterns: Vec<&Regex> = match self.packages {
            PackageSyntax::Python => vec![&*PY_IMPORT, &*PY_FROM],
            PackageSyntax::R => vec![&*R_LIBRARY, &*R_NAMESPACE],
            PackageSyntax::None => Vec::new(),
        };
        patterns
            .into_iter()
            .flat_map(|re| re.captures_iter(code))
            .filter_map(|caps| caps.get(1))
            .map(|m| match self.packages {
                // `pandas.io` installs as `pandas`; R names may contain dots.
                PackageSyntax::Python => m.as_str().split('.').next().unwrap_or_default(),
                _ => m.as_str(),
            })
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Code exporting `variables` into the runtime's process environment.
    /// `None` when there is nothing to set or the kernel has no environment.
    pub fn env_setup(&self, variables: &[ProjectVariable]) -> Option<String> {
        if variables.is_empty() {
            return None;
        }
        // JSON string literals are valid string literals in both languages.
        let quote = |s: &str| Value::from(s).to_string();
        let lines = variables.iter().map(|var| {
            let (name, value) = (quote(&var.name), quote(&var.value));
            match self.packages {
                PackageSyntax::R => format!("Sys.setenv({name} = {value})"),
                _ => format!("os.environ[{name}] = {value}"),
            }
        });
        match self.packages {
            PackageSyntax::R => Some(lines.collect::<Vec<_>>().join("\n")),
            PackageSyntax::Python => Some(
                std::iter::once("import os".to_string())
                    .chain(lines)
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            PackageSyntax::None => None,
        }
    }
}

static PY_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*import\s+([A-Za-z_][\w.]*)").expect("import pattern"));
static PY_FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*from\s+([A-Za-z_][\w.]*)\s+import").expect("from-import pattern"));
static R_LIBRARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:library|require)\(\s*["']?([A-Za-z][\w.]*)["']?\s*\)"#).expect("library pattern")
});
static R_NAMESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z][\w.]*)::").expect("namespace pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelSpecInfo {
    pub name: &'static str,
    #[serde(rename = "aceMode")]
    pub ace_mode: &'static str,
    #[serde(rename = "isMarkup")]
    pub is_markup: bool,
}

pub static CATALOG: [KernelSpec; 4] = [
    KernelSpec {
        name: "R",
        runtime: Some("ir"),
        ace_mode: "r",
        markup: None,
        packages: PackageSyntax::R,
    },
    KernelSpec {
        name: "Python",
        runtime: Some("python3"),
        ace_mode: "python",
        markup: None,
        packages: PackageSyntax::Python,
    },
    KernelSpec {
        name: "HTML",
        runtime: None,
        ace_mode: "html",
        markup: Some(MarkupKind::Html),
        packages: PackageSyntax::None,
    },
    KernelSpec {
        name: "Markdown",
        runtime: None,
        ace_mode: "markdown",
        markup: Some(MarkupKind::Markdown),
        packages: PackageSyntax::None,
    },
];

pub fn lookup(name: &str) -> Result<&'static KernelSpec> {
    CATALOG
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| OrchestratorError::UnknownKernel(name.to_string()))
}

/// Catalog entry for a runtime name (`python3` -> Python).
pub fn by_runtime(runtime: &str) -> Option<&'static KernelSpec> {
    CATALOG.iter().find(|spec| spec.runtime == Some(runtime))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub memory_mb: u32,
    pub cpu_units: u32,
}

/// Resources for a resource class; unknown classes get the smallest size.
pub fn resources_for(class: &str) -> Resources {
    match class {
        "3" => Resources {
            memory_mb: 3800,
            cpu_units: 1024,
        },
        "4" | "5" => Resources {
            memory_mb: 7600,
            cpu_units: 2048,
        },
        _ => Resources {
            memory_mb: 1900,
            cpu_units: 512,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_rejects_unknown_types() {
        assert_eq!(lookup("Python").unwrap().runtime, Some("python3"));
        assert!(lookup("Markdown").unwrap().is_markup());
        assert_eq!(
            lookup("Fortran").unwrap_err(),
            OrchestratorError::UnknownKernel("Fortran".into())
        );
        assert_eq!(by_runtime("ir").map(|s| s.name), Some("R"));
    }

    #[test]
    fn resource_classes() {
        assert_eq!(resources_for("2").memory_mb, 1900);
        assert_eq!(resources_for("3").cpu_units, 1024);
        assert_eq!(resources_for("5").memory_mb, 7600);
        assert_eq!(resources_for("unknown"), resources_for(DEFAULT_RESOURCE_CLASS));
    }

    #[test]
    fn detects_python_and_r_packages() {
        let py = lookup("Python").unwrap();
        let found = py.detect_packages("import numpy as np\nfrom pandas.io import sql\nx = 1\n");
        assert_eq!(
            found.into_iter().collect::<Vec<_>>(),
            vec!["numpy".to_string(), "pandas".to_string()]
        );

        let r = lookup("R").unwrap();
        let found = r.detect_packages("library(ggplot2)\nrequire('dplyr')\ndata.table::fread(x)");
        assert!(found.contains("ggplot2"));
        assert!(found.contains("dplyr"));
        assert!(found.contains("data.table"));
        assert!(lookup("HTML").unwrap().detect_packages("import x").is_empty());
    }

    #[test]
    fn env_setup_quotes_names_and_values() {
        let vars = vec![ProjectVariable {
            name: "TOKEN".into(),
            value: "a\"b".into(),
        }];
        assert_eq!(
            lookup("R").unwrap().env_setup(&vars).unwrap(),
            r#"Sys.setenv("TOKEN" = "a\"b")"#
        );
        assert_eq!(
            lookup("Python").unwrap().env_setup(&vars).unwrap(),
            "import os\nos.environ[\"TOKEN\"] = \"a\\\"b\""
        );
        assert!(lookup("Markdown").unwrap().env_setup(&vars).is_none());
        assert!(lookup("R").unwrap().env_setup(&[]).is_none());
    }
}
