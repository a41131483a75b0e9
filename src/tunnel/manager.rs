//! Tunnel interface manager
//!
//! Owns at most one [`TunnelHandle`]. An interface that was opened but whose
//! setup never finished is kept as pending so `teardown` still closes it.

use super::{BridgeSpec, InterfaceId, InterfaceSpec, TrafficStats, TunnelDriver};
use crate::config::{InboundSettings, OutboundDescriptor, TunnelSettings};
use crate::network::NetworkInfo;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Pause between SOCKS reachability attempts
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// A live tunnel
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    pub iface: InterfaceId,
    pub spec: InterfaceSpec,
    pub bridge: BridgeSpec,
    /// Network egress is currently bound to
    pub binding: Option<NetworkInfo>,
    /// Core process this tunnel forwards into
    pub core_id: u64,
    pub established_at: Instant,
}

pub struct TunnelInterfaceManager {
    driver: Arc<dyn TunnelDriver>,
    settings: TunnelSettings,
    inbound: InboundSettings,
    handle: Option<TunnelHandle>,
    /// Opened by an `establish` that has not completed
    pending: Option<InterfaceId>,
    last_network: Option<NetworkInfo>,
}

impl TunnelInterfaceManager {
    pub fn new(driver: Arc<dyn TunnelDriver>, settings: TunnelSettings, inbound: InboundSettings) -> Self {
        TunnelInterfaceManager {
            driver,
            settings,
            inbound,
            handle: None,
            pending: None,
            last_network: None,
        }
    }

    pub fn handle(&self) -> Option<&TunnelHandle> {
        self.handle.as_ref()
    }

    pub fn is_established(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether an interface from an unfinished `establish` is still open
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Current physical network, used when the next tunnel comes up
    pub fn last_network(&self) -> Option<&NetworkInfo> {
        self.last_network.as_ref()
    }

    /// Create the interface and bridge for the running core `core_id`
    pub async fn establish(&mut self, core_id: u64, descriptor: &OutboundDescriptor) -> Result<&TunnelHandle> {
        if self.handle.is_some() || self.pending.is_some() {
            warn!("Tunnel already present, tearing it down first");
            self.teardown().await;
        }

        probe_inbound(self.inbound.socks_addr(), self.inbound.ready_timeout()).await?;

        let spec = InterfaceSpec::build(&self.settings, descriptor)
            .map_err(|e| Error::tunnel(e.to_string()))?;
        let bridge = BridgeSpec::from_settings(&self.settings, &self.inbound);

        info!(
            "Establishing tunnel {} ({}) via {} for core {}",
            spec.name,
            spec.address,
            self.driver.name(),
            core_id
        );

        let driver = self.driver.clone();
        let iface = driver.open_interface(&spec).await.map_err(into_tunnel_error)?;
        self.pending = Some(iface.clone());

        let binding = self.last_network.clone();
        if let Some(ref net) = binding {
            if let Err(e) = driver.set_underlying_network(&iface, Some(net)).await {
                return Err(self.abandon(e).await);
            }
        }
        if let Err(e) = driver.start_bridge(&iface, &bridge).await {
            return Err(self.abandon(e).await);
        }

        self.pending = None;
        info!("Tunnel {} established", iface);
        Ok(&*self.handle.insert(TunnelHandle {
            iface,
            spec,
            bridge,
            binding,
            core_id,
            established_at: Instant::now(),
        }))
    }

    /// Close the pending interface after a failed setup step
    async fn abandon(&mut self, e: Error) -> Error {
        if let Some(iface) = self.pending.take() {
            warn!("Tunnel setup failed, closing {}: {}", iface, e);
            if let Err(close_err) = self.driver.close_interface(&iface).await {
                warn!("Failed to close {}: {}", iface, close_err);
            }
        }
        into_tunnel_error(e)
    }

    /// Move egress to another network, or pause it with `None`.
    ///
    /// Without a tunnel only the network is remembered, and `None` forgets it.
    /// On failure the tunnel keeps its previous binding.
    pub async fn rebind(&mut self, network: Option<NetworkInfo>) -> Result<()> {
        self.last_network = network.clone();

        let Some(handle) = self.handle.as_mut() else {
            debug!("No tunnel, network remembered for next session");
            return Ok(());
        };

        self.driver
            .set_underlying_network(&handle.iface, network.as_ref())
            .await
            .map_err(|e| Error::rebind(e.to_string()))?;

        debug!(
            "Tunnel {} bound to {}",
            handle.iface,
            network.as_ref().map(|n| n.id.as_str()).unwrap_or("nothing")
        );
        handle.binding = network;
        Ok(())
    }

    /// Restart the bridge against the same interface
    pub async fn restart_bridge(&mut self) -> Result<()> {
        let Some(handle) = self.handle.as_ref() else {
            return Err(Error::tunnel("no tunnel to restart"));
        };
        if let Err(e) = self.driver.stop_bridge(&handle.iface).await {
            debug!("Stopping bridge before restart: {}", e);
        }
        self.driver
            .start_bridge(&handle.iface, &handle.bridge)
            .await
            .map_err(into_tunnel_error)?;
        info!("Bridge for {} restarted", handle.iface);
        Ok(())
    }

    /// Restart the bridge if it died; returns whether a restart happened
    pub async fn check_bridge(&mut self) -> Result<bool> {
        let Some(handle) = self.handle.as_ref() else {
            return Ok(false);
        };
        if self.driver.bridge_alive(&handle.iface).await {
            return Ok(false);
        }
        warn!("Bridge for {} died", handle.iface);
        self.restart_bridge().await?;
        Ok(true)
    }

    /// Clear binding, stop bridge and close the interface. Never fails.
    pub async fn teardown(&mut self) {
        if let Some(iface) = self.pending.take() {
            info!("Closing half-established tunnel {}", iface);
            if let Err(e) = self.driver.stop_bridge(&iface).await {
                debug!("Stopping bridge for {}: {}", iface, e);
            }
            if let Err(e) = self.driver.close_interface(&iface).await {
                warn!("Failed to close {}: {}", iface, e);
            }
        }

        let Some(handle) = self.handle.take() else {
            return;
        };
        info!(
            "Tearing down tunnel {} (up {:?})",
            handle.iface,
            handle.established_at.elapsed()
        );

        if handle.binding.is_some() {
            if let Err(e) = self.driver.set_underlying_network(&handle.iface, None).await {
                warn!("Failed to clear binding of {}: {}", handle.iface, e);
            }
        }
        if let Err(e) = self.driver.stop_bridge(&handle.iface).await {
            warn!("Failed to stop bridge for {}: {}", handle.iface, e);
        }
        if let Err(e) = self.driver.close_interface(&handle.iface).await {
            warn!("Failed to close {}: {}", handle.iface, e);
        }
    }

    pub async fn traffic(&self) -> Option<TrafficStats> {
        let handle = self.handle.as_ref()?;
        self.driver.bridge_stats(&handle.iface).await
    }
}

fn into_tunnel_error(e: Error) -> Error {
    match e {
        Error::TunnelEstablishmentFailed(_) => e,
        other => Error::tunnel(other.to_string()),
    }
}

/// Wait for the core's SOCKS inbound to accept connections
async fn probe_inbound(addr: SocketAddr, ready_timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + ready_timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining.max(PROBE_INTERVAL), TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                debug!("SOCKS inbound {} reachable after {} attempts", addr, attempts);
                return Ok(());
            }
            Ok(Err(e)) if Instant::now() + PROBE_INTERVAL < deadline => {
                debug!("SOCKS inbound {} not ready: {}", addr, e);
                sleep(PROBE_INTERVAL).await;
            }
            Ok(Err(e)) => {
                return Err(Error::tunnel(format!(
                    "SOCKS inbound {} unreachable after {} attempts: {}",
                    addr, attempts, e
                )));
            }
            Err(_) => {
                return Err(Error::tunnel(format!("SOCKS inbound {} probe timed out", addr)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probe_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        probe_inbound(addr, Duration::from_millis(500)).await.unwrap();
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_bounded() {
        // bind then drop to get a port nobody listens on
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let started = Instant::now();
        let err = probe_inbound(addr, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, Error::TunnelEstablishmentFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_into_tunnel_error_keeps_variant() {
        let e = into_tunnel_error(Error::internal("ip failed"));
        assert!(matches!(e, Error::TunnelEstablishmentFailed(ref m) if m.contains("ip failed")));
        let e = into_tunnel_error(Error::tunnel("already"));
        assert_eq!(e.to_string(), "Tunnel establishment failed: already");
    }
}
