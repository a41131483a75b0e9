//! Userspace packet-forwarding bridge configuration
//!
//! The bridge reads packets from the tunnel interface and relays them to the
//! core's SOCKS inbound. Its YAML layout:
//!
//! ```yaml
//! tunnel:
//!   name: flux0
//!   mtu: 1450
//!   ipv4: 10.0.0.2
//! socks5:
//!   port: 10808
//!   address: 127.0.0.1
//!   udp: udp
//! misc:
//!   tcp-read-write-timeout: 300000
//!   udp-read-write-timeout: 60000
//!   log-level: warn
//! ```

use crate::config::{BridgeSettings, InboundSettings, TunnelSettings};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Everything the bridge needs to forward one interface
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSpec {
    pub interface: String,
    pub mtu: u16,
    pub ipv4: Ipv4Addr,
    pub ipv6: Option<Ipv6Addr>,
    pub socks_address: IpAddr,
    pub socks_port: u16,
    pub udp_mode: String,
    pub tcp_timeout_ms: u64,
    pub udp_timeout_ms: u64,
    pub log_level: String,
}

impl BridgeSpec {
    pub fn from_settings(tunnel: &TunnelSettings, inbound: &InboundSettings) -> Self {
        let bridge: &BridgeSettings = &tunnel.bridge;
        BridgeSpec {
            interface: tunnel.name.clone(),
            mtu: tunnel.mtu,
            ipv4: tunnel.address,
            ipv6: tunnel.ipv6,
            socks_address: inbound.listen,
            socks_port: inbound.socks_port,
            udp_mode: bridge.udp_mode.clone(),
            tcp_timeout_ms: bridge.tcp_timeout_ms,
            udp_timeout_ms: bridge.udp_timeout_ms,
            log_level: bridge.log_level.clone(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        let doc = BridgeDocument {
            tunnel: TunnelSection {
                name: self.interface.clone(),
                mtu: self.mtu,
                ipv4: self.ipv4.to_string(),
                ipv6: self.ipv6.map(|a| a.to_string()),
            },
            socks5: Socks5Section {
                port: self.socks_port,
                address: self.socks_address.to_string(),
                udp: self.udp_mode.clone(),
            },
            misc: MiscSection {
                tcp_read_write_timeout: self.tcp_timeout_ms,
                udp_read_write_timeout: self.udp_timeout_ms,
                log_level: self.log_level.clone(),
            },
        };
        Ok(serde_yaml::to_string(&doc)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BridgeDocument {
    tunnel: TunnelSection,
    socks5: Socks5Section,
    misc: MiscSection,
}

#[derive(Debug, Serialize, Deserialize)]
struct TunnelSection {
    name: String,
    mtu: u16,
    ipv4: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Socks5Section {
    port: u16,
    address: String,
    udp: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MiscSection {
    tcp_read_write_timeout: u64,
    udp_read_write_timeout: u64,
    log_level: String,
}
