//! Proxy-engine configuration compiler
//!
//! Turns an [`OutboundDescriptor`] and a [`RoutingPolicy`] into a complete
//! engine configuration. Compilation is pure: the same inputs and
//! environment always produce the same artifact.

pub mod outbound;
pub mod routing;
pub mod sections;

pub use outbound::{BLOCK_TAG, DIRECT_TAG, PROXY_TAG};
pub use sections::{
    DnsSection, Inbound, LogSection, Outbound, PolicySection, RoutingRule, RoutingSection,
    StatsSection,
};

use crate::config::{InboundSettings, OutboundDescriptor, RoutingPolicy, Settings};
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use sections::Sniffing;

pub const GEOIP_FILE: &str = "geoip.dat";
pub const GEOSITE_FILE: &str = "geosite.dat";

/// Which geo datasets the core will be able to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeoAssets {
    pub geoip: bool,
    pub geosite: bool,
}

impl GeoAssets {
    /// Look for the dataset files in the asset directory
    pub fn probe(asset_dir: Option<&Path>) -> Self {
        match asset_dir {
            Some(dir) => GeoAssets {
                geoip: dir.join(GEOIP_FILE).is_file(),
                geosite: dir.join(GEOSITE_FILE).is_file(),
            },
            None => GeoAssets::default(),
        }
    }
}

/// Environment flags that shape compilation
#[derive(Debug, Clone)]
pub struct CompileEnv {
    pub geo: GeoAssets,
    pub inbound: InboundSettings,
    pub log_level: String,
}

impl CompileEnv {
    pub fn from_settings(settings: &Settings) -> Self {
        CompileEnv {
            geo: GeoAssets::probe(settings.core.asset_dir.as_deref()),
            inbound: settings.inbound.clone(),
            log_level: settings.core.log_level.clone(),
        }
    }
}

impl Default for CompileEnv {
    fn default() -> Self {
        CompileEnv {
            geo: GeoAssets::default(),
            inbound: InboundSettings::default(),
            log_level: "warning".to_string(),
        }
    }
}

/// Compiled engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledConfig {
    pub log: LogSection,
    pub stats: StatsSection,
    pub policy: PolicySection,
    pub dns: DnsSection,
    pub inbounds: Vec<Inbound>,
    pub routing: RoutingSection,
    pub outbounds: Vec<Outbound>,
}

impl CompiledConfig {
    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.routing.rules
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the artifact, creating the parent directory if needed
    pub async fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, self.to_json_pretty()?).await?;
        debug!("Wrote engine config to {}", path.display());
        Ok(())
    }
}

fn inbounds(env: &CompileEnv) -> Vec<Inbound> {
    let listen = env.inbound.listen.to_string();
    vec![
        Inbound {
            tag: "socks".to_string(),
            port: env.inbound.socks_port,
            listen: listen.clone(),
            protocol: "socks".to_string(),
            settings: Some(json!({ "auth": "noauth", "udp": true })),
            sniffing: Sniffing::standard(),
        },
        Inbound {
            tag: "http".to_string(),
            port: env.inbound.http_port,
            listen,
            protocol: "http".to_string(),
            settings: None,
            sniffing: Sniffing::standard(),
        },
    ]
}

/// Compile a descriptor and policy into an engine configuration
pub fn compile(
    descriptor: &OutboundDescriptor,
    policy: &RoutingPolicy,
    env: &CompileEnv,
) -> Result<CompiledConfig> {
    descriptor.validate()?;
    let descriptor = outbound::apply_protocol_defaults(descriptor);

    let config = CompiledConfig {
        log: LogSection {
            loglevel: env.log_level.clone(),
        },
        stats: StatsSection::default(),
        policy: PolicySection::default(),
        dns: routing::build_dns(&descriptor, &env.geo),
        inbounds: inbounds(env),
        routing: RoutingSection {
            domain_strategy: "IPIfNonMatch".to_string(),
            rules: routing::build_rules(&descriptor, policy, &env.geo),
        },
        outbounds: vec![
            outbound::render_proxy(&descriptor),
            outbound::direct(),
            outbound::block(),
        ],
    };

    info!(
        "Compiled {} outbound to {}:{} ({} mode, {} rules)",
        descriptor.protocol,
        descriptor.address,
        descriptor.port,
        policy.mode,
        config.routing.rules.len()
    );
    Ok(config)
}
