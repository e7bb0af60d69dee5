pub mod config;
pub mod control;
pub mod deployment;
pub mod error;
pub mod jobs;
pub mod kernel;
pub mod modes;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod store;
pub mod util;

#[cfg(any(feature = "test-fixtures", test))]
pub mod testkit;

pub use config::{DeploymentKind, OrchestratorConfig};
pub use control::{ControlClient, ControlError, ControlServer, RequestEnvelope, ResponseEnvelope};
pub use deployment::{DeploymentProvider, KernelSummary, ReserveConfig, ReserveUpdate, StartContext};
pub use error::{ErrorKind, ErrorReport, OrchestratorError};
pub use kernel::{Kernel, KernelInfo};
pub use modes::daemon::{ControlMsg, OrchestratorDaemon, SessionSummary};
pub use orchestrator::Orchestrator;
pub use queue::{SessionEvent, SessionQueue};
pub use registry::KernelRegistry;
pub use session::SessionManager;
pub use store::{MemoryStore, SessionStore, UserRef};
pub use util::now_wallclock_ns;
