//! Session controller
//!
//! The only writer of session state. Sequences compile -> core start ->
//! tunnel establishment, tears down in reverse order, and watches the
//! running session.

use super::{SessionState, SessionStateMachine};
use crate::common::logs::{LogEvent, LogSink};
use crate::compiler::{self, CompileEnv};
use crate::config::{OutboundDescriptor, RoutingPolicy, Settings};
use crate::core::{ProcessRunner, ProcessSupervisor};
use crate::network::{BindingTarget, NetworkInfo};
use crate::tunnel::{TrafficStats, TunnelDriver, TunnelInterfaceManager};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a session owns
struct Session {
    machine: SessionStateMachine,
    supervisor: ProcessSupervisor,
    tunnel: TunnelInterfaceManager,
}

/// Clears the in-flight flag when a connect returns
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SessionController {
    settings: Settings,
    session: Mutex<Session>,
    connecting: AtomicBool,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    supervision: parking_lot::Mutex<Option<CancellationToken>>,
    connected_rx: watch::Receiver<bool>,
    state_rx: watch::Receiver<SessionState>,
    logs: LogSink,
    this: Weak<SessionController>,
}

impl SessionController {
    pub fn new(
        settings: Settings,
        runner: Arc<dyn ProcessRunner>,
        driver: Arc<dyn TunnelDriver>,
    ) -> Arc<Self> {
        let logs = LogSink::new();
        let machine = SessionStateMachine::new();
        let connected_rx = machine.subscribe_connected();
        let state_rx = machine.subscribe_state();
        let supervisor = ProcessSupervisor::new(
            runner,
            settings.core.clone(),
            settings.inbound.socks_addr(),
            logs.clone(),
        );
        let tunnel = TunnelInterfaceManager::new(driver, settings.tunnel.clone(), settings.inbound.clone());

        Arc::new_cyclic(|this| SessionController {
            settings,
            session: Mutex::new(Session {
                machine,
                supervisor,
                tunnel,
            }),
            connecting: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(None),
            supervision: parking_lot::Mutex::new(None),
            connected_rx,
            state_rx,
            logs,
            this: this.clone(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Bring a session up for `descriptor`.
    ///
    /// A running session is torn down first. Fails with `Busy` while another
    /// connect is in flight and with `Cancelled` when a disconnect interrupts it.
    pub async fn connect(&self, descriptor: OutboundDescriptor, policy: RoutingPolicy) -> Result<bool> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::busy("another connect is in progress"));
        }
        let _connecting = ConnectingGuard(&self.connecting);

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        let mut guard = self.session.lock().await;
        let session = &mut *guard;

        if session.machine.state() != SessionState::Idle {
            info!("Reconnecting, tearing down the current session");
            self.teardown(session).await;
        }

        let result = self.run_connect(session, &descriptor, &policy, &token).await;
        self.cancel.lock().take();

        match result {
            Ok(core_id) => {
                info!(
                    "Connected to {}:{} (core handle {})",
                    descriptor.address, descriptor.port, core_id
                );
                self.start_supervision();
                Ok(true)
            }
            Err(e) => {
                if matches!(e, Error::Cancelled(_)) {
                    info!("Connect cancelled");
                } else {
                    error!("Connect failed: {}", e);
                    if session.machine.state().is_connecting() {
                        if let Err(te) = session.machine.fail(&e) {
                            warn!("{}", te);
                        }
                    }
                    self.logs.publish(LogEvent::new("error", "session", &e.to_string()));
                }
                self.teardown(session).await;
                Err(e)
            }
        }
    }

    async fn run_connect(
        &self,
        session: &mut Session,
        descriptor: &OutboundDescriptor,
        policy: &RoutingPolicy,
        token: &CancellationToken,
    ) -> Result<u64> {
        if token.is_cancelled() {
            return Err(Error::cancelled("disconnect requested before start"));
        }

        session.machine.transition(SessionState::Compiling)?;
        let env = CompileEnv::from_settings(&self.settings);
        let config = compiler::compile(descriptor, policy, &env)?;
        let path = self.settings.core.config_path();
        cancellable(token, config.write_to(&path)).await?;

        session.machine.transition(SessionState::StartingCore)?;
        let core_id = cancellable(token, session.supervisor.start(&path, &HashMap::new())).await?;

        session.machine.transition(SessionState::EstablishingTunnel)?;
        if session.supervisor.current_id() != Some(core_id) {
            return Err(Error::internal("core handle missing after start"));
        }
        cancellable(token, session.tunnel.establish(core_id, descriptor)).await?;

        session.machine.transition(SessionState::Connected)?;
        Ok(core_id)
    }

    /// Release tunnel then core and return to Idle. Never fails.
    async fn teardown(&self, session: &mut Session) {
        if let Some(token) = self.supervision.lock().take() {
            token.cancel();
        }

        let state = session.machine.state();
        if state == SessionState::Idle
            && !session.tunnel.is_established()
            && !session.tunnel.has_pending()
            && session.supervisor.handle().is_none()
        {
            return;
        }
        if !matches!(state, SessionState::Idle | SessionState::Disconnecting) {
            if let Err(e) = session.machine.transition(SessionState::Disconnecting) {
                warn!("{}", e);
            }
        }

        session.tunnel.teardown().await;
        if let Err(e) = session.supervisor.stop().await {
            warn!("Failed to stop proxy core: {}", e);
        }

        if session.machine.state() == SessionState::Disconnecting {
            if let Err(e) = session.machine.transition(SessionState::Idle) {
                warn!("{}", e);
            }
        }
        info!("Session torn down");
    }

    /// Cancel any in-flight connect and tear the session down. Always succeeds.
    pub async fn disconnect(&self) -> bool {
        if let Some(token) = self.cancel.lock().take() {
            debug!("Cancelling in-flight connect");
            token.cancel();
        }
        let mut guard = self.session.lock().await;
        self.teardown(&mut guard).await;
        true
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.logs.subscribe()
    }

    /// Handle id of the running core, if any
    pub async fn core_id(&self) -> Option<u64> {
        self.session.lock().await.supervisor.current_id()
    }

    pub async fn tunnel_established(&self) -> bool {
        self.session.lock().await.tunnel.is_established()
    }

    /// Error of the last failed connect
    pub async fn last_error(&self) -> Option<String> {
        self.session.lock().await.machine.last_error().map(String::from)
    }

    pub async fn traffic(&self) -> Option<TrafficStats> {
        self.session.lock().await.tunnel.traffic().await
    }

    fn start_supervision(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.supervision.lock().replace(token.clone()) {
            old.cancel();
        }

        let this = self.this.clone();
        let period = self.settings.supervision_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(controller) = this.upgrade() else {
                    break;
                };
                if !controller.supervise_once().await {
                    break;
                }
            }
            debug!("Supervision stopped");
        });
    }

    /// One liveness pass; false once there is nothing left to watch
    async fn supervise_once(&self) -> bool {
        let mut guard = self.session.lock().await;
        let session = &mut *guard;
        if session.machine.state() != SessionState::Connected {
            return false;
        }

        if !session.supervisor.is_alive() {
            error!("Proxy core died, aborting session");
            self.logs
                .publish(LogEvent::new("error", "session", "proxy core exited unexpectedly"));
            self.teardown(session).await;
            return false;
        }

        match session.tunnel.check_bridge().await {
            Ok(true) => info!("Bridge restarted"),
            Ok(false) => {}
            Err(e) => warn!("Bridge restart failed: {}", e),
        }
        true
    }
}

#[async_trait]
impl BindingTarget for SessionController {
    async fn rebind(&self, network: Option<NetworkInfo>) -> Result<()> {
        self.session.lock().await.tunnel.rebind(network).await
    }
}

/// Run `fut` unless `token` fires first
async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::cancelled("connect interrupted by disconnect")),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = cancellable(&token, async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_cancellable_interrupts_slow_future() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result: Result<()> = cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[test]
    fn test_connect_future_is_send() {
        fn require_send<F: Future + Send>(_: &F) {}
        let controller: Option<Arc<SessionController>> = None;
        if let Some(controller) = controller {
            let connect = async move {
                controller
                    .connect(OutboundDescriptor::new("vless", "v.example.com", 443), RoutingPolicy::rule())
                    .await
            };
            require_send(&connect);
        }
    }

    #[test]
    fn test_connecting_guard_resets_flag() {
        let flag = AtomicBool::new(true);
        drop(ConnectingGuard(&flag));
        assert!(!flag.load(Ordering::SeqCst));
    }
}
