//! Configuration module
//!
//! `Settings` is the orchestrator's own configuration (where the core lives,
//! which ports it listens on, how the tunnel is shaped). The per-connect
//! inputs live in [`descriptor`].

pub mod descriptor;

pub use descriptor::{ConnectRequest, OutboundDescriptor, RoutingMode, RoutingPolicy, StreamSettings};

use crate::{Error, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable the core reads to locate geo datasets
pub const ASSET_ENV_VAR: &str = "xray.location.asset";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Log level for the orchestrator itself
    pub log_level: String,

    /// Proxy-core process settings
    pub core: CoreSettings,

    /// Local inbound listeners the core exposes
    pub inbound: InboundSettings,

    /// Tunnel interface and bridge settings
    pub tunnel: TunnelSettings,

    /// Interval of the liveness check while connected
    pub supervision_interval_ms: u64,
}

impl Settings {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        self.inbound.validate()?;
        self.tunnel.validate()?;
        if self.supervision_interval_ms == 0 {
            return Err(Error::config("supervision-interval-ms cannot be 0"));
        }
        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn supervision_interval(&self) -> Duration {
        Duration::from_millis(self.supervision_interval_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            log_level: "info".to_string(),
            core: CoreSettings::default(),
            inbound: InboundSettings::default(),
            tunnel: TunnelSettings::default(),
            supervision_interval_ms: 5_000,
        }
    }
}

/// How to wait for the previous core's listener to go away before a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "kebab-case")]
pub enum SettleStrategy {
    /// Sleep for a fixed delay
    Fixed {
        #[serde(rename = "delay-ms")]
        delay_ms: u64,
    },
    /// Probe the listener port with exponential backoff until it can be bound
    BindRetry {
        attempts: u32,
        #[serde(rename = "initial-backoff-ms")]
        initial_backoff_ms: u64,
        #[serde(rename = "max-backoff-ms")]
        max_backoff_ms: u64,
    },
}

impl Default for SettleStrategy {
    fn default() -> Self {
        SettleStrategy::BindRetry {
            attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 400,
        }
    }
}

/// Proxy-core process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoreSettings {
    /// Path to the core executable
    pub executable: PathBuf,

    /// Arguments; `{config}` is replaced by the artifact path
    pub args: Vec<String>,

    /// Directory holding optional geoip.dat / geosite.dat
    pub asset_dir: Option<PathBuf>,

    /// Working directory; the compiled artifact is written here
    pub work_dir: PathBuf,

    /// Artifact file name inside `work_dir`
    pub config_file: String,

    /// Log level written into the compiled artifact
    pub log_level: String,

    /// Grace period after spawn before the core counts as started
    pub grace_ms: u64,

    /// Graceful stop timeout before force-kill
    pub stop_timeout_ms: u64,

    /// Settle behaviour between a stop and the next start
    pub settle: SettleStrategy,

    /// Extra environment variables for the core
    pub env: HashMap<String, String>,
}

impl CoreSettings {
    fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(Error::config("core executable cannot be empty"));
        }
        if self.config_file.is_empty() {
            return Err(Error::config("core config-file cannot be empty"));
        }
        if self.grace_ms == 0 {
            return Err(Error::config("core grace-ms cannot be 0"));
        }
        if let SettleStrategy::BindRetry { attempts, .. } = self.settle {
            if attempts == 0 {
                return Err(Error::config("settle attempts cannot be 0"));
            }
        }
        Ok(())
    }

    /// Full path of the compiled artifact
    pub fn config_path(&self) -> PathBuf {
        self.work_dir.join(&self.config_file)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        CoreSettings {
            executable: PathBuf::from(default_core_executable()),
            args: vec!["-c".to_string(), "{config}".to_string()],
            asset_dir: None,
            work_dir: std::env::temp_dir().join("flux-tunnel"),
            config_file: "config.json".to_string(),
            log_level: "warning".to_string(),
            grace_ms: 500,
            stop_timeout_ms: 5_000,
            settle: SettleStrategy::default(),
            env: HashMap::new(),
        }
    }
}

#[cfg(windows)]
fn default_core_executable() -> &'static str {
    "xray.exe"
}

#[cfg(not(windows))]
fn default_core_executable() -> &'static str {
    "xray"
}

/// Local inbound listeners exposed by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InboundSettings {
    pub listen: IpAddr,
    pub socks_port: u16,
    pub http_port: u16,
    /// How long to wait for the SOCKS listener to accept connections
    pub ready_timeout_ms: u64,
}

impl InboundSettings {
    fn validate(&self) -> Result<()> {
        if self.socks_port == 0 || self.http_port == 0 {
            return Err(Error::config("inbound ports cannot be 0"));
        }
        if self.socks_port == self.http_port {
            return Err(Error::config("socks-port and http-port must differ"));
        }
        Ok(())
    }

    pub fn socks_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.listen, self.socks_port)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl Default for InboundSettings {
    fn default() -> Self {
        InboundSettings {
            listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
            socks_port: 10808,
            http_port: 10809,
            ready_timeout_ms: 2_000,
        }
    }
}

/// Tunnel interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunnelSettings {
    /// Interface name (ignored by drivers that pick their own)
    pub name: String,

    /// Local address of the point-to-point pair
    pub address: Ipv4Addr,

    /// Remote end of the point-to-point pair
    pub peer: Ipv4Addr,

    pub prefix: u8,

    pub mtu: u16,

    pub dns: Vec<IpAddr>,

    /// Routes captured by the tunnel
    pub routes: Vec<IpNet>,

    /// Applications never routed through the tunnel
    pub excluded_apps: Vec<String>,

    /// Optional IPv6 address; IPv6 capture is off when unset
    pub ipv6: Option<Ipv6Addr>,

    pub session_name: String,

    pub bridge: BridgeSettings,
}

impl TunnelSettings {
    fn validate(&self) -> Result<()> {
        if !(576..=9000).contains(&self.mtu) {
            return Err(Error::config(format!("tunnel mtu {} out of range", self.mtu)));
        }
        if self.prefix > 30 {
            return Err(Error::config("tunnel prefix must leave room for a point-to-point pair"));
        }
        let net = ipnet::Ipv4Net::new(self.address, self.prefix)
            .map_err(|e| Error::config(e.to_string()))?;
        if !net.contains(&self.peer) || self.peer == self.address {
            return Err(Error::config("tunnel peer must be a distinct host on the same subnet"));
        }
        if self.routes.is_empty() {
            return Err(Error::config("tunnel needs at least one route"));
        }
        Ok(())
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        TunnelSettings {
            name: "flux0".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            peer: Ipv4Addr::new(10, 0, 0, 1),
            prefix: 30,
            // Slightly below 1500 to absorb encapsulation overhead on mobile links
            mtu: 1450,
            dns: vec![
                IpAddr::V4(Ipv4Addr::new(223, 5, 5, 5)),
                IpAddr::V4(Ipv4Addr::new(119, 29, 29, 29)),
                IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            ],
            routes: vec![IpNet::V4(ipnet::Ipv4Net::default())],
            excluded_apps: Vec::new(),
            ipv6: None,
            session_name: "Flux VPN".to_string(),
            bridge: BridgeSettings::default(),
        }
    }
}

/// Userspace forwarding bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeSettings {
    /// Bridge executable used by process-based drivers
    pub executable: PathBuf,
    /// Bridge config file name inside the core work dir
    pub config_file: String,
    pub tcp_timeout_ms: u64,
    pub udp_timeout_ms: u64,
    pub udp_mode: String,
    pub log_level: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        BridgeSettings {
            executable: PathBuf::from("hev-socks5-tunnel"),
            config_file: "hev-socks5-tunnel.yaml".to_string(),
            tcp_timeout_ms: 300_000,
            udp_timeout_ms: 60_000,
            udp_mode: "udp".to_string(),
            log_level: "warn".to_string(),
        }
    }
}
