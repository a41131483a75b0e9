//! Tunnel interface management
//!
//! The OS tunneling primitive is reached through [`TunnelDriver`]. Two
//! families of drivers exist:
//! - raw interface drivers hand packets to a userspace bridge that relays
//!   them into the core's SOCKS inbound (`start_bridge` spawns it)
//! - packet-tunnel providers forward on their own (`start_bridge` is a no-op)

pub mod bridge;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod manager;

pub use bridge::BridgeSpec;
pub use manager::{TunnelHandle, TunnelInterfaceManager};

use crate::config::{OutboundDescriptor, TunnelSettings};
use crate::network::NetworkInfo;
use crate::Result;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Shape of the virtual interface to create
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceSpec {
    pub name: String,
    /// Local address with the point-to-point prefix
    pub address: Ipv4Net,
    pub peer: Ipv4Addr,
    pub ipv6: Option<Ipv6Net>,
    /// Destinations captured by the interface
    pub routes: Vec<IpNet>,
    /// Destinations kept on the physical network
    pub excluded_routes: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
    pub session_name: String,
    pub excluded_apps: Vec<String>,
}

impl InterfaceSpec {
    /// Build from settings; an IP-literal server address is excluded from capture
    pub fn build(settings: &TunnelSettings, descriptor: &OutboundDescriptor) -> Result<Self> {
        let address = Ipv4Net::new(settings.address, settings.prefix)
            .map_err(|e| crate::Error::config(e.to_string()))?;
        let ipv6 = match settings.ipv6 {
            Some(addr) => Some(Ipv6Net::new(addr, 126).map_err(|e| crate::Error::config(e.to_string()))?),
            None => None,
        };
        let excluded_routes = descriptor
            .ip_address()
            .and_then(|ip| IpNet::new(ip, if ip.is_ipv4() { 32 } else { 128 }).ok())
            .into_iter()
            .collect();

        Ok(InterfaceSpec {
            name: settings.name.clone(),
            address,
            peer: settings.peer,
            ipv6,
            routes: settings.routes.clone(),
            excluded_routes,
            dns: settings.dns.clone(),
            mtu: settings.mtu,
            session_name: settings.session_name.clone(),
            excluded_apps: settings.excluded_apps.clone(),
        })
    }
}

/// Driver-assigned identity of an open interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId {
    pub name: String,
}

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Packet and byte counters of the bridge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

/// Host tunneling capability
#[async_trait]
pub trait TunnelDriver: Send + Sync {
    /// Driver name for logging
    fn name(&self) -> &str;

    async fn open_interface(&self, spec: &InterfaceSpec) -> Result<InterfaceId>;

    /// Start forwarding packets from the interface to the SOCKS inbound
    async fn start_bridge(&self, iface: &InterfaceId, bridge: &BridgeSpec) -> Result<()>;

    async fn bridge_alive(&self, iface: &InterfaceId) -> bool;

    async fn stop_bridge(&self, iface: &InterfaceId) -> Result<()>;

    /// Bind egress to a physical network; `None` clears the binding
    async fn set_underlying_network(
        &self,
        iface: &InterfaceId,
        network: Option<&NetworkInfo>,
    ) -> Result<()>;

    async fn close_interface(&self, iface: &InterfaceId) -> Result<()>;

    async fn bridge_stats(&self, _iface: &InterfaceId) -> Option<TrafficStats> {
        None
    }
}
