//! Linux tunnel driver
//!
//! Creates a persistent TUN device with iproute2 and forwards it with an
//! external userspace bridge (hev-socks5-tunnel compatible), spawned
//! through a [`ProcessRunner`].

use super::{BridgeSpec, InterfaceId, InterfaceSpec, TrafficStats, TunnelDriver};
use crate::config::BridgeSettings;
use crate::core::{CoreProcess, LaunchSpec, OutputStream, ProcessRunner};
use crate::network::NetworkInfo;
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const BRIDGE_STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Default)]
struct DriverState {
    bridge: Option<Box<dyn CoreProcess>>,
    /// Routes kept on the physical network
    excluded: Vec<IpNet>,
}

pub struct LinuxTunDriver {
    runner: Arc<dyn ProcessRunner>,
    bridge: BridgeSettings,
    work_dir: PathBuf,
    state: Mutex<DriverState>,
}

impl LinuxTunDriver {
    pub fn new(runner: Arc<dyn ProcessRunner>, bridge: BridgeSettings, work_dir: PathBuf) -> Self {
        LinuxTunDriver {
            runner,
            bridge,
            work_dir,
            state: Mutex::new(DriverState::default()),
        }
    }

    fn bridge_config_path(&self) -> PathBuf {
        self.work_dir.join(&self.bridge.config_file)
    }
}

/// Replace a default route by its two halves so the physical default stays intact
pub fn split_default(route: &IpNet) -> Vec<IpNet> {
    if route.prefix_len() != 0 {
        return vec![*route];
    }
    let halves: [&str; 2] = match route {
        IpNet::V4(_) => ["0.0.0.0/1", "128.0.0.0/1"],
        IpNet::V6(_) => ["::/1", "8000::/1"],
    };
    halves.iter().filter_map(|h| h.parse().ok()).collect()
}

fn family(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "-4",
        IpNet::V6(_) => "-6",
    }
}

/// Run one iproute2 command
async fn ip(args: &[&str]) -> Result<()> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::internal(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

async fn configure(spec: &InterfaceSpec) -> Result<()> {
    let name = spec.name.as_str();
    ip(&["addr", "replace", &spec.address.to_string(), "dev", name]).await?;
    if let Some(v6) = spec.ipv6 {
        ip(&["-6", "addr", "replace", &v6.to_string(), "dev", name]).await?;
    }
    ip(&["link", "set", "dev", name, "mtu", &spec.mtu.to_string(), "up"]).await?;

    for route in spec.routes.iter().flat_map(split_default) {
        ip(&[family(&route), "route", "replace", &route.to_string(), "dev", name]).await?;
    }
    Ok(())
}

fn drain(stream: OutputStream) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "bridge", "{}", line);
        }
    });
}

async fn read_counter(iface: &str, name: &str) -> Option<u64> {
    let path = format!("/sys/class/net/{}/statistics/{}", iface, name);
    tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

#[async_trait]
impl TunnelDriver for LinuxTunDriver {
    fn name(&self) -> &str {
        "linux-tun"
    }

    async fn open_interface(&self, spec: &InterfaceSpec) -> Result<InterfaceId> {
        let name = spec.name.as_str();
        ip(&["tuntap", "add", "dev", name, "mode", "tun"]).await?;

        if let Err(e) = configure(spec).await {
            let _ = ip(&["link", "del", "dev", name]).await;
            return Err(e);
        }

        if !spec.excluded_apps.is_empty() {
            warn!(
                "Per-application exclusion is not available on {}, ignoring {} entries",
                self.name(),
                spec.excluded_apps.len()
            );
        }
        debug!("DNS {:?} left to the system resolver", spec.dns);

        self.state.lock().await.excluded = spec.excluded_routes.clone();
        info!("Opened {} ({}, mtu {})", name, spec.address, spec.mtu);
        Ok(InterfaceId {
            name: name.to_string(),
        })
    }

    async fn start_bridge(&self, iface: &InterfaceId, bridge: &BridgeSpec) -> Result<()> {
        let path = self.bridge_config_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bridge.to_yaml()?).await?;

        let spec = LaunchSpec::new(&self.bridge.executable).arg(path.display().to_string());
        let mut process = self.runner.spawn(&spec).await?;
        if let Some(out) = process.take_stdout() {
            drain(out);
        }
        if let Some(err) = process.take_stderr() {
            drain(err);
        }

        info!("Bridge for {} started (PID {:?})", iface, process.id());
        self.state.lock().await.bridge = Some(process);
        Ok(())
    }

    async fn bridge_alive(&self, _iface: &InterfaceId) -> bool {
        match self.state.lock().await.bridge.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn stop_bridge(&self, iface: &InterfaceId) -> Result<()> {
        let Some(mut process) = self.state.lock().await.bridge.take() else {
            return Ok(());
        };
        if let Err(e) = process.terminate() {
            debug!("Terminate bridge: {}", e);
        }
        if timeout(BRIDGE_STOP_TIMEOUT, process.wait()).await.is_err() {
            warn!("Bridge for {} didn't exit gracefully, forcing kill", iface);
            process.kill().await?;
        }
        Ok(())
    }

    async fn set_underlying_network(
        &self,
        _iface: &InterfaceId,
        network: Option<&NetworkInfo>,
    ) -> Result<()> {
        let excluded = self.state.lock().await.excluded.clone();
        for route in &excluded {
            let dest = route.to_string();
            match network {
                Some(net) => {
                    let egress = net
                        .interface
                        .as_deref()
                        .ok_or_else(|| Error::rebind(format!("network {} has no interface", net.id)))?;
                    let mut args = vec![family(route), "route", "replace", dest.as_str()];
                    let gateway = net.gateway.map(|g| g.to_string());
                    if let Some(ref gw) = gateway {
                        args.extend(["via", gw.as_str()]);
                    }
                    args.extend(["dev", egress]);
                    ip(&args).await.map_err(|e| Error::rebind(e.to_string()))?;
                }
                None => {
                    // route may already be gone with its interface
                    let _ = ip(&[family(route), "route", "del", dest.as_str()]).await;
                }
            }
        }
        Ok(())
    }

    async fn close_interface(&self, iface: &InterfaceId) -> Result<()> {
        self.state.lock().await.excluded.clear();
        ip(&["link", "del", "dev", &iface.name]).await?;
        info!("Closed {}", iface);
        Ok(())
    }

    async fn bridge_stats(&self, iface: &InterfaceId) -> Option<TrafficStats> {
        Some(TrafficStats {
            tx_packets: read_counter(&iface.name, "tx_packets").await?,
            tx_bytes: read_counter(&iface.name, "tx_bytes").await?,
            rx_packets: read_counter(&iface.name, "rx_packets").await?,
            rx_bytes: read_counter(&iface.name, "rx_bytes").await?,
        })
    }
}
