//! Physical network observation and tunnel egress rebinding
//!
//! Platform watchers turn OS callbacks into [`NetworkEvent`]s. The
//! [`NetworkBindingMonitor`] decides which network the tunnel should egress
//! through and pushes that choice to a [`BindingTarget`].

#[cfg(target_os = "linux")]
pub mod linux;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A physical network as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Platform identifier of the network
    pub id: String,
    /// OS interface carrying the network
    pub interface: Option<String>,
    /// Next hop for traffic kept off the tunnel
    pub gateway: Option<IpAddr>,
    pub has_internet: bool,
    pub restricted: bool,
}

impl NetworkInfo {
    pub fn new(id: impl Into<String>) -> Self {
        NetworkInfo {
            id: id.into(),
            interface: None,
            gateway: None,
            has_internet: true,
            restricted: false,
        }
    }

    /// Usable as tunnel egress: internet capable and unrestricted
    pub fn qualifies(&self) -> bool {
        self.has_internet && !self.restricted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available(NetworkInfo),
    CapabilitiesChanged(NetworkInfo),
    /// Network with this id went away
    Lost(String),
}

/// Receiver of egress binding changes
#[async_trait]
pub trait BindingTarget: Send + Sync {
    /// `None` pauses egress until a network returns
    async fn rebind(&self, network: Option<NetworkInfo>) -> Result<()>;
}

/// Tracks the current physical network and rebinds the tunnel to it
#[derive(Debug, Default)]
pub struct NetworkBindingMonitor {
    current: Option<NetworkInfo>,
}

impl NetworkBindingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&NetworkInfo> {
        self.current.as_ref()
    }

    /// Apply one event; rebind failures are logged and otherwise ignored
    pub async fn handle_event(&mut self, event: NetworkEvent, target: &dyn BindingTarget) {
        let next = match event {
            NetworkEvent::Available(net) | NetworkEvent::CapabilitiesChanged(net)
                if net.qualifies() =>
            {
                if self.current.as_ref() == Some(&net) {
                    return;
                }
                info!("Underlying network: {}", net.id);
                Some(net)
            }
            NetworkEvent::Available(net) | NetworkEvent::CapabilitiesChanged(net) => {
                if self.current.as_ref().map(|c| c.id != net.id).unwrap_or(true) {
                    debug!("Ignoring non-qualifying network {}", net.id);
                    return;
                }
                info!("Network {} no longer qualifies, pausing egress", net.id);
                None
            }
            NetworkEvent::Lost(id) => {
                if self.current.as_ref().map(|c| c.id != id).unwrap_or(true) {
                    debug!("Lost network {} was not bound", id);
                    return;
                }
                info!("Network {} lost, pausing egress", id);
                None
            }
        };

        match target.rebind(next.clone()).await {
            Ok(()) => self.current = next,
            Err(e) => warn!("Network rebind failed: {}", e),
        }
    }

    /// Consume events until the channel closes or the token is cancelled
    pub fn spawn(
        mut self,
        target: Arc<dyn BindingTarget>,
        mut events: mpsc::Receiver<NetworkEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event, target.as_ref()).await,
                        None => break,
                    },
                }
            }
            debug!("Network monitor stopped");
        })
    }
}
