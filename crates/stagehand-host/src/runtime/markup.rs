//! In-process runtime for markup kernels. Evaluating HTML echoes it back;
//! Markdown is rendered to HTML.

use async_trait::async_trait;
use pulldown_cmark::{Options, Parser, html};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use super::{Execution, ExecutionEvent, RuntimeHandle, RuntimeStatus};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupKind {
    Html,
    Markdown,
}

pub struct MarkupRuntime {
    id: String,
    kind: MarkupKind,
    status: watch::Sender<RuntimeStatus>,
}

impl MarkupRuntime {
    pub fn new(kind: MarkupKind) -> Self {
        let (status, _) = watch::channel(RuntimeStatus::Idle);
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status,
        }
    }

    pub fn render(&self, code: &str) -> String {
        match self.kind {
            MarkupKind::Html => code.to_string(),
            MarkupKind::Markdown => {
                let mut options = Options::empty();
                options.insert(Options::ENABLE_TABLES);
                options.insert(Options::ENABLE_STRIKETHROUGH);
                let mut out = String::new();
                html::push_html(&mut out, Parser::new_ext(code, options));
                out
            }
        }
    }
}

#[async_trait]
impl RuntimeHandle for MarkupRuntime {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        match self.kind {
            MarkupKind::Html => "html",
            MarkupKind::Markdown => "markdown",
        }
    }

    async fn execute(&self, code: &str) -> Result<Execution> {
        let (mut sink, execution) = Execution::channel(code);
        sink.emit(ExecutionEvent::Output(json!({
            "output_type": "display_data",
            "data": { "text/html": self.render(code) },
        })));
        sink.complete();
        Ok(execution)
    }

    async fn interrupt(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.status.send_replace(RuntimeStatus::Dead);
        Ok(())
    }

    fn status(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn markdown_renders_html() {
        let runtime = MarkupRuntime::new(MarkupKind::Markdown);
        let result = runtime.execute("# Title\n\n*hi*").await.unwrap().wait().await.unwrap();
        let html = result.output[0]["data"]["text/html"].as_str().unwrap();
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>hi</em>"));
    }

    #[tokio::test]
    async fn html_is_passed_through() {
        let runtime = MarkupRuntime::new(MarkupKind::Html);
        assert_eq!(runtime.render("<b>x</b>"), "<b>x</b>");
        runtime.shutdown().await.unwrap();
        assert_eq!(*runtime.status().borrow(), RuntimeStatus::Dead);
    }
}
