//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flux_tunnel::config::SettleStrategy;
use flux_tunnel::core::{CoreProcess, ExitInfo, LaunchSpec, OutputStream, ProcessRunner};
use flux_tunnel::network::NetworkInfo;
use flux_tunnel::tunnel::{BridgeSpec, InterfaceId, InterfaceSpec, TrafficStats, TunnelDriver};
use flux_tunnel::{Error, Result, Settings};
use parking_lot::Mutex;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Lifetime state shared between a fake process and its runner
#[derive(Debug)]
pub struct FakeProcState {
    exited: AtomicBool,
    exit_at: Option<Instant>,
}

impl FakeProcState {
    pub fn is_done(&self) -> bool {
        self.exited.load(Ordering::SeqCst) || self.exit_at.map(|t| Instant::now() >= t).unwrap_or(false)
    }

    pub fn exit(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

pub struct FakeProcess {
    pid: u32,
    state: Arc<FakeProcState>,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
}

#[async_trait]
impl CoreProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<OutputStream> {
        self.stdout.take().map(|b| Box::pin(Cursor::new(b)) as OutputStream)
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take().map(|b| Box::pin(Cursor::new(b)) as OutputStream)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self.state.is_done().then_some(ExitInfo { code: Some(1) }))
    }

    fn terminate(&mut self) -> Result<()> {
        self.state.exit();
        Ok(())
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        Ok(ExitInfo { code: Some(0) })
    }

    async fn kill(&mut self) -> Result<()> {
        self.state.exit();
        Ok(())
    }
}

impl Drop for FakeProcess {
    // mirrors kill_on_drop
    fn drop(&mut self) {
        self.state.exit();
    }
}

/// Runner handing out fake processes
#[derive(Default)]
pub struct FakeRunner {
    /// Processes exit on their own after this long
    pub exit_after: Option<Duration>,
    pub stderr: String,
    pub specs: Mutex<Vec<LaunchSpec>>,
    pub procs: Mutex<Vec<Arc<FakeProcState>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exiting_after(delay: Duration, stderr: &str) -> Self {
        FakeRunner {
            exit_after: Some(delay),
            stderr: stderr.to_string(),
            ..Default::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.specs.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.procs.lock().iter().filter(|p| !p.is_done()).count()
    }

    /// Make the most recent process die
    pub fn kill_latest(&self) {
        if let Some(p) = self.procs.lock().last() {
            p.exit();
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn CoreProcess>> {
        let state = Arc::new(FakeProcState {
            exited: AtomicBool::new(false),
            exit_at: self.exit_after.map(|d| Instant::now() + d),
        });
        let pid = {
            let mut specs = self.specs.lock();
            specs.push(spec.clone());
            1000 + specs.len() as u32
        };
        self.procs.lock().push(state.clone());
        Ok(Box::new(FakeProcess {
            pid,
            state,
            stdout: Some(b"[Info] Xray started\n".to_vec()),
            stderr: Some(self.stderr.clone().into_bytes()),
        }))
    }
}

/// Driver recording every call
#[derive(Default)]
pub struct FakeDriver {
    pub calls: Mutex<Vec<String>>,
    pub fail_bridge: AtomicBool,
    pub bridge_dead: AtomicBool,
    /// `start_bridge` takes this long before returning
    pub bridge_delay_ms: AtomicU64,
    pub opened: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl TunnelDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn open_interface(&self, spec: &InterfaceSpec) -> Result<InterfaceId> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.record(format!("open {}", spec.name));
        Ok(InterfaceId {
            name: spec.name.clone(),
        })
    }

    async fn start_bridge(&self, iface: &InterfaceId, bridge: &BridgeSpec) -> Result<()> {
        self.record(format!("start_bridge {} {}", iface, bridge.socks_port));
        let delay = self.bridge_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_bridge.load(Ordering::SeqCst) {
            return Err(Error::internal("bridge refused to start"));
        }
        self.bridge_dead.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn bridge_alive(&self, _iface: &InterfaceId) -> bool {
        !self.bridge_dead.load(Ordering::SeqCst)
    }

    async fn stop_bridge(&self, iface: &InterfaceId) -> Result<()> {
        self.record(format!("stop_bridge {}", iface));
        Ok(())
    }

    async fn set_underlying_network(&self, iface: &InterfaceId, network: Option<&NetworkInfo>) -> Result<()> {
        let target = network.map(|n| n.id.clone()).unwrap_or_else(|| "none".to_string());
        self.record(format!("bind {} {}", iface, target));
        Ok(())
    }

    async fn close_interface(&self, iface: &InterfaceId) -> Result<()> {
        self.record(format!("close {}", iface));
        Ok(())
    }

    async fn bridge_stats(&self, _iface: &InterfaceId) -> Option<TrafficStats> {
        Some(TrafficStats {
            tx_packets: 3,
            tx_bytes: 300,
            rx_packets: 2,
            rx_bytes: 200,
        })
    }
}

/// Stand-in for the core's SOCKS inbound plus settings pointing at it
pub struct TestEnv {
    pub settings: Settings,
    pub socks: TcpListener,
    pub work_dir: PathBuf,
}

impl TestEnv {
    pub async fn new(name: &str) -> Self {
        let socks = TcpListener::bind("127.0.0.1:0").await.expect("bind socks stand-in");
        let port = socks.local_addr().expect("local addr").port();
        let work_dir = std::env::temp_dir().join(format!("flux-it-{}-{}", name, std::process::id()));

        let mut settings = Settings::default();
        settings.core.executable = PathBuf::from("xray");
        settings.core.work_dir = work_dir.clone();
        settings.core.grace_ms = 100;
        settings.core.stop_timeout_ms = 200;
        settings.core.settle = SettleStrategy::Fixed { delay_ms: 0 };
        settings.inbound.socks_port = port;
        settings.inbound.http_port = port.wrapping_add(1).max(1);
        settings.inbound.ready_timeout_ms = 500;
        settings.supervision_interval_ms = 60_000;

        TestEnv {
            settings,
            socks,
            work_dir,
        }
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}

/// Poll `cond` until it holds or `limit` passes
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
