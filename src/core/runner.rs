//! Process runner backed by `tokio::process`

use super::{CoreProcess, ExitInfo, LaunchSpec, OutputStream, ProcessRunner};
use crate::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};

/// Spawns real OS processes
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        TokioProcessRunner
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn CoreProcess>> {
        // Bare names are resolved through PATH by the OS; only explicit paths can be checked
        let explicit = spec.executable.components().count() > 1;
        if explicit && !spec.executable.exists() {
            error!("Executable not found: {:?}", spec.executable);
            return Err(Error::binary_not_found(spec.executable.display().to_string()));
        }

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref work_dir) = spec.work_dir {
            cmd.current_dir(work_dir);
        }

        debug!("Spawning {:?} {:?}", spec.executable, spec.args);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::binary_not_found(spec.executable.display().to_string())
            } else {
                Error::internal(format!("Failed to spawn {:?}: {}", spec.executable, e))
            }
        })?;

        info!("Started {:?} with PID: {}", spec.executable, child.id().unwrap_or(0));
        Ok(Box::new(TokioProcess { child }))
    }
}

/// Wrapper around a tokio child
struct TokioProcess {
    child: Child,
}

#[async_trait]
impl CoreProcess for TokioProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.child
            .stdout
            .take()
            .map(|s| Box::pin(s) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.child
            .stderr
            .take()
            .map(|s| Box::pin(s) as OutputStream)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ExitInfo { code: status.code() }))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| Error::internal(format!("SIGTERM to {} failed: {}", pid, e)))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo { code: status.code() })
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_explicit_path() {
        let runner = TokioProcessRunner::new();
        let spec = LaunchSpec::new("/nonexistent/flux/xray").arg("-c");
        match runner.spawn(&spec).await {
            Err(Error::BinaryNotFound(path)) => assert!(path.contains("xray")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[tokio::test]
    async fn test_missing_bare_name() {
        let runner = TokioProcessRunner::new();
        let spec = LaunchSpec::new("flux-tunnel-no-such-binary");
        assert!(matches!(runner.spawn(&spec).await, Err(Error::BinaryNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let runner = TokioProcessRunner::new();
        let spec = LaunchSpec::new("sleep").arg("30");
        let mut process = runner.spawn(&spec).await.unwrap();
        assert!(process.id().is_some());
        assert!(process.try_wait().unwrap().is_none());

        process.terminate().unwrap();
        let exit = process.wait().await.unwrap();
        // killed by signal, no exit code
        assert_eq!(exit.code, None);
    }
}
