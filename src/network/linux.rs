//! Default-route watcher for Linux
//!
//! Polls `/proc/net/route` and reports the interface holding the IPv4
//! default route as the underlying network.

use super::{NetworkEvent, NetworkInfo};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const ROUTE_TABLE: &str = "/proc/net/route";

/// RTF_UP
const FLAG_UP: u32 = 0x1;

/// Find the default route in `/proc/net/route` content.
///
/// Interfaces in `exclude` (the tunnel itself) are skipped; among the rest
/// the entry with the lowest metric wins.
pub fn parse_default_route(table: &str, exclude: &[&str]) -> Option<NetworkInfo> {
    let mut best: Option<(u32, NetworkInfo)> = None;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let iface = fields[0];
        if exclude.contains(&iface) {
            continue;
        }
        let (Ok(dest), Ok(gateway), Ok(flags), Ok(metric), Ok(mask)) = (
            u32::from_str_radix(fields[1], 16),
            u32::from_str_radix(fields[2], 16),
            u32::from_str_radix(fields[3], 16),
            fields[6].parse::<u32>(),
            u32::from_str_radix(fields[7], 16),
        ) else {
            continue;
        };
        if dest != 0 || mask != 0 || flags & FLAG_UP == 0 {
            continue;
        }

        // Stored in host byte order of a little-endian u32
        let gateway = Ipv4Addr::from(gateway.swap_bytes());
        let info = NetworkInfo {
            id: iface.to_string(),
            interface: Some(iface.to_string()),
            gateway: (!gateway.is_unspecified()).then_some(IpAddr::V4(gateway)),
            has_internet: true,
            restricted: false,
        };
        if best.as_ref().map(|(m, _)| metric < *m).unwrap_or(true) {
            best = Some((metric, info));
        }
    }

    best.map(|(_, info)| info)
}

/// Poll the route table and emit events when the default route moves
pub fn spawn_route_watcher(
    tunnel_name: String,
    period: Duration,
    events: mpsc::Sender<NetworkEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        let mut current: Option<NetworkInfo> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let table = match tokio::fs::read_to_string(ROUTE_TABLE).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("Failed to read {}: {}", ROUTE_TABLE, e);
                    continue;
                }
            };
            let next = parse_default_route(&table, &[tunnel_name.as_str()]);
            if next == current {
                continue;
            }

            let event = match (&current, &next) {
                (_, Some(net)) => NetworkEvent::Available(net.clone()),
                (Some(old), None) => NetworkEvent::Lost(old.id.clone()),
                (None, None) => continue,
            };
            debug!("Default route change: {:?}", event);
            current = next;
            if events.send(event).await.is_err() {
                break;
            }
        }
    })
}
