//! Typed sections of the compiled engine configuration
//!
//! Field names follow the engine's JSON schema; struct field order is the
//! emitted key order, which keeps the artifact byte-for-byte deterministic.

use crate::config::StreamSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: String,
}

/// Enables the engine's traffic counters; carries no fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSection {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
    pub handshake: u32,
    pub conn_idle: u32,
    pub uplink_only: u32,
    pub downlink_only: u32,
    pub stats_user_uplink: bool,
    pub stats_user_downlink: bool,
    pub buffer_size: u32,
}

impl Default for LevelPolicy {
    fn default() -> Self {
        LevelPolicy {
            handshake: 4,
            conn_idle: 300,
            uplink_only: 2,
            downlink_only: 5,
            stats_user_uplink: true,
            stats_user_downlink: true,
            buffer_size: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_inbound_uplink: bool,
    pub stats_inbound_downlink: bool,
    pub stats_outbound_uplink: bool,
    pub stats_outbound_downlink: bool,
}

impl Default for SystemPolicy {
    fn default() -> Self {
        SystemPolicy {
            stats_inbound_uplink: true,
            stats_inbound_downlink: true,
            stats_outbound_uplink: true,
            stats_outbound_downlink: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    pub levels: BTreeMap<String, LevelPolicy>,
    pub system: SystemPolicy,
}

impl Default for PolicySection {
    fn default() -> Self {
        let mut levels = BTreeMap::new();
        levels.insert("0".to_string(), LevelPolicy::default());
        PolicySection {
            levels,
            system: SystemPolicy::default(),
        }
    }
}

/// Resolver restricted to a domain list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitResolver {
    pub address: String,
    pub domains: Vec<String>,
    #[serde(rename = "expectIPs", default, skip_serializing_if = "Vec::is_empty")]
    pub expect_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DnsServer {
    Split(SplitResolver),
    Address(String),
}

impl DnsServer {
    pub fn address(&self) -> &str {
        match self {
            DnsServer::Split(s) => &s.address,
            DnsServer::Address(a) => a,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSection {
    pub query_strategy: String,
    pub servers: Vec<DnsServer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

impl Sniffing {
    /// HTTP, TLS and QUIC destination override
    pub fn standard() -> Self {
        Sniffing {
            enabled: true,
            dest_override: vec!["http".to_string(), "tls".to_string(), "quic".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    pub sniffing: Sniffing,
}

/// Rule produced by the compiler itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub outbound_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl FieldRule {
    fn new(outbound_tag: &str) -> Self {
        FieldRule {
            rule_type: "field".to_string(),
            outbound_tag: outbound_tag.to_string(),
            domain: None,
            ip: None,
            network: None,
        }
    }

    pub fn domains<I, S>(outbound_tag: &str, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldRule {
            domain: Some(domains.into_iter().map(Into::into).collect()),
            ..Self::new(outbound_tag)
        }
    }

    pub fn ips<I, S>(outbound_tag: &str, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldRule {
            ip: Some(ips.into_iter().map(Into::into).collect()),
            ..Self::new(outbound_tag)
        }
    }

    pub fn network(outbound_tag: &str, network: &str) -> Self {
        FieldRule {
            network: Some(network.to_string()),
            ..Self::new(outbound_tag)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoutingRule {
    Field(FieldRule),
    /// Caller-supplied rule, kept exactly as given
    Custom(Value),
}

impl RoutingRule {
    pub fn outbound_tag(&self) -> Option<&str> {
        match self {
            RoutingRule::Field(r) => Some(&r.outbound_tag),
            RoutingRule::Custom(v) => v.get("outboundTag").and_then(Value::as_str),
        }
    }

    pub fn as_field(&self) -> Option<&FieldRule> {
        match self {
            RoutingRule::Field(r) => Some(r),
            RoutingRule::Custom(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSection {
    pub domain_strategy: String,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}
