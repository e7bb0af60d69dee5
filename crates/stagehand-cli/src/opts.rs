//! Global CLI options.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

/// Options shared by every command. Each can also be set from the environment.
#[derive(Args, Debug, Clone)]
pub struct GlobalOpts {
    /// Control socket of the daemon (env: STAGEHAND_CONTROL, default: .stagehand/control.sock)
    #[arg(long, global = true, env = "STAGEHAND_CONTROL")]
    pub control: Option<PathBuf>,

    /// JSON output envelope
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Suppress notices
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Client-side control timeout in milliseconds (env: STAGEHAND_TIMEOUT_MS)
    #[arg(long, global = true, env = "STAGEHAND_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,
}

impl GlobalOpts {
    pub fn control_socket(&self) -> PathBuf {
        self.control
            .clone()
            .unwrap_or_else(|| PathBuf::from(".stagehand").join("control.sock"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
