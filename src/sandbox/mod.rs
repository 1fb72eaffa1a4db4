//! Boundary to the isolated execution host that installs and serves the app.

pub mod local;
pub mod session;

use crate::errors::AppResult;
use crate::files::FileSystemTree;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub use local::{LocalBooter, LocalSandboxHost};
pub use session::SessionManager;

/// Announced by a spawned process once it starts serving HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

/// Handle to a process running inside the sandbox. `output` carries raw text
/// chunks from stdout and stderr interleaved; `ready` yields the addresses
/// this process announced; `exit` resolves with the code.
#[derive(Debug)]
pub struct SandboxProcess {
    pub output: mpsc::UnboundedReceiver<String>,
    pub ready: mpsc::UnboundedReceiver<ServerReady>,
    pub exit: oneshot::Receiver<i32>,
}

#[async_trait]
pub trait SandboxHost: Send + Sync {
    async fn mount(&self, tree: &FileSystemTree) -> AppResult<()>;
    async fn spawn(&self, command: &str, args: &[String]) -> AppResult<SandboxProcess>;
    async fn read_file(&self, path: &str) -> AppResult<String>;
    async fn write_file(&self, path: &str, contents: &str) -> AppResult<()>;
    async fn teardown(&self) -> AppResult<()>;
}

/// Creates hosts. The manager calls this at most once at a time.
#[async_trait]
pub trait SandboxBooter: Send + Sync {
    async fn boot(&self) -> AppResult<Arc<dyn SandboxHost>>;
}
