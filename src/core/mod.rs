//! Proxy-core process layer
//!
//! Spawning is behind [`ProcessRunner`] so the supervisor (and the Linux
//! tunnel driver, which spawns the bridge) can run against fakes.

pub mod runner;
pub mod supervisor;

pub use runner::TokioProcessRunner;
pub use supervisor::{ProcessSupervisor, ProxyProcessHandle};

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Boxed output stream of a child process
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// What to launch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub work_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        LaunchSpec {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
}

/// A running child process
#[async_trait]
pub trait CoreProcess: Send {
    /// OS process id, if still known
    fn id(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<OutputStream>;

    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> Result<Option<ExitInfo>>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&mut self) -> Result<()>;

    async fn wait(&mut self) -> Result<ExitInfo>;

    async fn kill(&mut self) -> Result<()>;
}

/// Spawns child processes
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn CoreProcess>>;
}
