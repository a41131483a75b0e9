//! Proxy-core process supervisor
//!
//! Owns at most one live core process:
//! - settles the previous core's listener before a start
//! - spawns the core and drains its stdout/stderr for its whole lifetime
//! - treats an exit inside the grace period as a failed start
//! - stops with SIGTERM, then force-kills after the stop timeout

use super::{CoreProcess, LaunchSpec, OutputStream, ProcessRunner};
use crate::common::logs::{classify_line, LogEvent, LogSink};
use crate::config::{CoreSettings, SettleStrategy, ASSET_ENV_VAR};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Stderr lines kept for `ProcessExitedImmediately`
const STDERR_CAPTURE_LINES: usize = 16;

/// How long to wait for the stderr reader after an early exit
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

type StderrCapture = Arc<Mutex<Vec<String>>>;

/// Handle to a running core process
pub struct ProxyProcessHandle {
    id: u64,
    pid: Option<u32>,
    config_path: PathBuf,
    started_at: Instant,
    process: Box<dyn CoreProcess>,
    readers: Vec<JoinHandle<()>>,
}

impl ProxyProcessHandle {
    /// Monotonic identity of this start
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for ProxyProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("config_path", &self.config_path)
            .finish()
    }
}

pub struct ProcessSupervisor {
    runner: Arc<dyn ProcessRunner>,
    settings: CoreSettings,
    socks_addr: SocketAddr,
    logs: LogSink,
    next_id: u64,
    handle: Option<ProxyProcessHandle>,
}

impl ProcessSupervisor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        settings: CoreSettings,
        socks_addr: SocketAddr,
        logs: LogSink,
    ) -> Self {
        ProcessSupervisor {
            runner,
            settings,
            socks_addr,
            logs,
            next_id: 1,
            handle: None,
        }
    }

    pub fn handle(&self) -> Option<&ProxyProcessHandle> {
        self.handle.as_ref()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.handle.as_ref().map(|h| h.id)
    }

    fn launch_spec(&self, config_path: &Path, env_overrides: &HashMap<String, String>) -> LaunchSpec {
        let config = config_path.display().to_string();
        let mut spec = LaunchSpec::new(&self.settings.executable);
        spec.args = self
            .settings
            .args
            .iter()
            .map(|a| a.replace("{config}", &config))
            .collect();
        if let Some(ref assets) = self.settings.asset_dir {
            spec.env
                .insert(ASSET_ENV_VAR.to_string(), assets.display().to_string());
        }
        spec.env
            .extend(self.settings.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        spec.env
            .extend(env_overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        spec.work_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        spec
    }

    /// Start the core with the given artifact and return the new handle id
    pub async fn start(
        &mut self,
        config_path: &Path,
        env_overrides: &HashMap<String, String>,
    ) -> Result<u64> {
        if self.handle.is_some() {
            warn!("Core already running, stopping it before restart");
            self.stop().await?;
        }

        settle(self.settings.settle.clone(), self.socks_addr).await;

        let spec = self.launch_spec(config_path, env_overrides);
        info!("Starting proxy core: {:?} {:?}", spec.executable, spec.args);

        let mut process = self.runner.spawn(&spec).await?;
        let pid = process.id();

        let capture: StderrCapture = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = process.take_stdout() {
            readers.push(spawn_reader(stdout, "core/stdout", self.logs.clone(), None));
        }
        if let Some(stderr) = process.take_stderr() {
            readers.push(spawn_reader(
                stderr,
                "core/stderr",
                self.logs.clone(),
                Some(capture.clone()),
            ));
        }

        let id = self.next_id;
        self.next_id += 1;

        // Stored before the grace wait so a cancelled start is still stopped
        self.handle = Some(ProxyProcessHandle {
            id,
            pid,
            config_path: config_path.to_path_buf(),
            started_at: Instant::now(),
            process,
            readers,
        });

        sleep(self.settings.grace()).await;

        let exited = match self.handle.as_mut() {
            Some(handle) => handle.process.try_wait()?,
            None => return Err(Error::internal("core handle vanished during start")),
        };

        if let Some(exit) = exited {
            if let Some(handle) = self.handle.take() {
                for reader in handle.readers {
                    let _ = timeout(STDERR_DRAIN_TIMEOUT, reader).await;
                }
            }
            let stderr = capture.lock().join("\n");
            error!("Proxy core exited immediately with code {:?}", exit.code);
            return Err(Error::ProcessExitedImmediately {
                code: exit.code,
                stderr,
            });
        }

        info!("Proxy core running (handle {}, PID {:?})", id, pid);
        Ok(id)
    }

    /// Stop the core; a no-op when nothing runs
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        info!(
            "Stopping proxy core (handle {}, up {:?})",
            handle.id,
            handle.uptime()
        );

        if let Err(e) = handle.process.terminate() {
            debug!("Terminate failed: {}", e);
        }

        match timeout(self.settings.stop_timeout(), handle.process.wait()).await {
            Ok(Ok(exit)) => {
                info!("Proxy core exited with code {:?}", exit.code);
            }
            Ok(Err(e)) => {
                warn!("Error waiting for proxy core: {}", e);
            }
            Err(_) => {
                warn!("Proxy core didn't exit gracefully, forcing kill");
                handle.process.kill().await?;
            }
        }

        // Readers end on EOF once the pipes close
        drop(handle.readers);
        Ok(())
    }

    /// Whether the current core is still running
    pub fn is_alive(&mut self) -> bool {
        match self.handle.as_mut() {
            Some(handle) => matches!(handle.process.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Wait until the previous core released the SOCKS port
async fn settle(strategy: SettleStrategy, socks_addr: SocketAddr) {
    match strategy {
        SettleStrategy::Fixed { delay_ms } => {
            if delay_ms > 0 {
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        SettleStrategy::BindRetry {
            attempts,
            initial_backoff_ms,
            max_backoff_ms,
        } => {
            let mut backoff = Duration::from_millis(initial_backoff_ms);
            let max_backoff = Duration::from_millis(max_backoff_ms);
            for attempt in 1..=attempts {
                if port_is_free(socks_addr).await {
                    if attempt > 1 {
                        debug!("{} free after {} attempts", socks_addr, attempt);
                    }
                    return;
                }
                if attempt < attempts {
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
            warn!(
                "{} still in use after {} attempts, starting anyway",
                socks_addr, attempts
            );
        }
    }
}

async fn port_is_free(addr: SocketAddr) -> bool {
    TcpListener::bind(addr).await.is_ok()
}

/// Drain one output stream into tracing and the log sink
fn spawn_reader(
    stream: OutputStream,
    source: &'static str,
    logs: LogSink,
    capture: Option<StderrCapture>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let from_stderr = capture.is_some();
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let level = classify_line(&line, from_stderr);
                    match level {
                        "error" => error!(target: "core", "{}", line),
                        "warning" => warn!(target: "core", "{}", line),
                        "debug" => debug!(target: "core", "{}", line),
                        _ => info!(target: "core", "{}", line),
                    }
                    if let Some(ref capture) = capture {
                        let mut captured = capture.lock();
                        if captured.len() < STDERR_CAPTURE_LINES {
                            captured.push(line.clone());
                        }
                    }
                    logs.publish(LogEvent::new(level, source, &line));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("{} reader stopped: {}", source, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExitInfo;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedProcess {
        exited: Arc<AtomicBool>,
        exit_after: Option<Instant>,
        stderr: Option<&'static str>,
    }

    impl ScriptedProcess {
        fn is_done(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
                || self.exit_after.map(|t| Instant::now() >= t).unwrap_or(false)
        }
    }

    #[async_trait]
    impl CoreProcess for ScriptedProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }
        fn take_stdout(&mut self) -> Option<OutputStream> {
            Some(Box::pin(Cursor::new(b"[Info] core started\n".to_vec())))
        }
        fn take_stderr(&mut self) -> Option<OutputStream> {
            self.stderr
                .take()
                .map(|s| Box::pin(Cursor::new(s.as_bytes().to_vec())) as OutputStream)
        }
        fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
            Ok(self.is_done().then_some(ExitInfo { code: Some(23) }))
        }
        fn terminate(&mut self) -> Result<()> {
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn wait(&mut self) -> Result<ExitInfo> {
            Ok(ExitInfo { code: Some(0) })
        }
        async fn kill(&mut self) -> Result<()> {
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedRunner {
        exit_after: Option<Duration>,
        last_spec: Mutex<Option<LaunchSpec>>,
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn CoreProcess>> {
            *self.last_spec.lock() = Some(spec.clone());
            Ok(Box::new(ScriptedProcess {
                exited: Arc::new(AtomicBool::new(false)),
                exit_after: self.exit_after.map(|d| Instant::now() + d),
                stderr: Some("[Error] failed to start: bad config\nline two\n"),
            }))
        }
    }

    fn supervisor(exit_after: Option<Duration>) -> (ProcessSupervisor, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner {
            exit_after,
            last_spec: Mutex::new(None),
        });
        let settings = CoreSettings {
            executable: PathBuf::from("/opt/xray/xray"),
            asset_dir: Some(PathBuf::from("/opt/xray/assets")),
            grace_ms: 50,
            settle: SettleStrategy::Fixed { delay_ms: 0 },
            ..Default::default()
        };
        let addr: SocketAddr = "127.0.0.1:10808".parse().unwrap();
        (
            ProcessSupervisor::new(runner.clone(), settings, addr, LogSink::new()),
            runner,
        )
    }

    #[tokio::test]
    async fn test_start_builds_launch_spec() {
        let (mut sup, runner) = supervisor(None);
        let mut overrides = HashMap::new();
        overrides.insert("XRAY_LOCATION_CONFIG".to_string(), "/tmp".to_string());

        let id = sup.start(Path::new("/tmp/flux/config.json"), &overrides).await.unwrap();
        assert_eq!(id, 1);
        assert!(sup.is_alive());

        let spec = runner.last_spec.lock().clone().unwrap();
        assert_eq!(spec.args, vec!["-c".to_string(), "/tmp/flux/config.json".to_string()]);
        assert_eq!(spec.env.get(ASSET_ENV_VAR).map(String::as_str), Some("/opt/xray/assets"));
        assert!(spec.env.contains_key("XRAY_LOCATION_CONFIG"));
        assert_eq!(spec.work_dir, Some(PathBuf::from("/tmp/flux")));
    }

    #[tokio::test]
    async fn test_exit_within_grace_reports_stderr() {
        let (mut sup, _) = supervisor(Some(Duration::from_millis(10)));
        let err = sup.start(Path::new("config.json"), &HashMap::new()).await.unwrap_err();
        match err {
            Error::ProcessExitedImmediately { code, stderr } => {
                assert_eq!(code, Some(23));
                assert!(stderr.contains("bad config"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(sup.handle().is_none());
        assert!(!sup.is_alive());
    }

    #[tokio::test]
    async fn test_restart_replaces_handle() {
        let (mut sup, _) = supervisor(None);
        let first = sup.start(Path::new("config.json"), &HashMap::new()).await.unwrap();
        let second = sup.start(Path::new("config.json"), &HashMap::new()).await.unwrap();
        assert!(second > first);
        assert_eq!(sup.current_id(), Some(second));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut sup, _) = supervisor(None);
        sup.start(Path::new("config.json"), &HashMap::new()).await.unwrap();
        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert!(sup.handle().is_none());
    }

    #[tokio::test]
    async fn test_bind_retry_gives_up_on_held_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let strategy = SettleStrategy::BindRetry {
            attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 10,
        };

        let started = Instant::now();
        settle(strategy, addr).await;
        assert!(started.elapsed() >= Duration::from_millis(15));
        drop(listener);
    }

    #[test]
    fn test_start_future_is_send() {
        fn require_send<F: std::future::Future + Send>(_: &F) {}
        let (mut sup, _runner) = supervisor(None);
        let overrides = HashMap::new();
        let start = sup.start(Path::new("config.json"), &overrides);
        require_send(&start);
    }
}
