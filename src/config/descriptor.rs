//! Connect-time inputs: the outbound descriptor and the routing policy

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;

/// Stream transport settings of an outbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<Value>,

    /// Transport specific sections (wsSettings, grpcSettings, realitySettings...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// User-selected remote proxy endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundDescriptor {
    pub protocol: String,

    pub address: String,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    /// Authentication and security fields (id, password, method, flow...)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub credentials: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

impl OutboundDescriptor {
    pub fn new(protocol: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        OutboundDescriptor {
            protocol: protocol.into(),
            address: address.into(),
            port,
            tag: None,
            credentials: Map::new(),
            stream_settings: None,
        }
    }

    pub fn with_credential(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.credentials.insert(key.to_string(), value.into());
        self
    }

    pub fn with_stream_settings(mut self, stream: StreamSettings) -> Self {
        self.stream_settings = Some(stream);
        self
    }

    /// Reject descriptors the compiler cannot turn into an outbound
    pub fn validate(&self) -> Result<()> {
        if self.protocol.trim().is_empty() {
            return Err(Error::malformed("protocol cannot be empty"));
        }
        if self.address.trim().is_empty() {
            return Err(Error::malformed("address cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::malformed("port cannot be 0"));
        }
        Ok(())
    }

    /// Remote address as an IP literal, if it is one
    pub fn ip_address(&self) -> Option<IpAddr> {
        self.address.trim_matches(|c| c == '[' || c == ']').parse().ok()
    }

    /// Parse an engine-style outbound object.
    ///
    /// The address and port are looked up in `settings.address`,
    /// `settings.vnext[0]` and `settings.servers[0]`, in that order. The
    /// remaining fields of the server entry (and `users[0]` for vnext) become
    /// credentials.
    pub fn from_outbound_json(outbound: &Value) -> Result<Self> {
        let obj = outbound
            .as_object()
            .ok_or_else(|| Error::malformed("outbound must be a JSON object"))?;

        let protocol = obj
            .get("protocol")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tag = obj.get("tag").and_then(Value::as_str).map(String::from);

        let settings = obj.get("settings").and_then(Value::as_object);
        let mut credentials = Map::new();
        let server = settings.and_then(|s| {
            if s.contains_key("address") {
                Some(s.clone())
            } else if let Some(vnext) = s.get("vnext").and_then(|v| v.get(0)).and_then(Value::as_object) {
                if let Some(user) = vnext.get("users").and_then(|u| u.get(0)).and_then(Value::as_object) {
                    credentials.extend(user.clone());
                }
                Some(vnext.clone())
            } else {
                s.get("servers")
                    .and_then(|v| v.get(0))
                    .and_then(Value::as_object)
                    .cloned()
            }
        });

        let mut server = server.unwrap_or_default();
        let address = server
            .remove("address")
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        let port = match server.remove("port") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        };
        let port = u16::try_from(port).map_err(|_| Error::malformed(format!("port {} out of range", port)))?;
        server.remove("users");
        credentials.extend(server);

        let stream_settings = match obj.get("streamSettings") {
            Some(v) if !v.is_null() => Some(serde_json::from_value(v.clone())?),
            _ => None,
        };

        Ok(OutboundDescriptor {
            protocol,
            address,
            port,
            tag,
            credentials,
            stream_settings,
        })
    }
}

/// Routing mode selected by the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Split routing: bypass private/domestic traffic, proxy the rest
    #[default]
    Rule,
    /// Proxy everything except private/LAN destinations
    Global,
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Rule => write!(f, "rule"),
            RoutingMode::Global => write!(f, "global"),
        }
    }
}

impl TryFrom<&str> for RoutingMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rule" | "" => Ok(RoutingMode::Rule),
            "global" => Ok(RoutingMode::Global),
            _ => Err(Error::parse(format!("Unknown routing mode: {}", s))),
        }
    }
}

/// Routing policy for one connect call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub mode: RoutingMode,

    /// Engine routing rules, emitted verbatim and in order in rule mode
    #[serde(default)]
    pub rules: Vec<Value>,
}

impl RoutingPolicy {
    pub fn rule() -> Self {
        RoutingPolicy::default()
    }

    pub fn global() -> Self {
        RoutingPolicy {
            mode: RoutingMode::Global,
            rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<Value>) -> Self {
        self.rules = rules;
        self
    }
}

/// A connect request as sent by a host application
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub descriptor: OutboundDescriptor,
    pub policy: RoutingPolicy,
}

impl ConnectRequest {
    /// Parse the host envelope `{outbound, routingMode, routingRules}`.
    ///
    /// A bare outbound object (no `outbound` key) is accepted as well and
    /// routed in rule mode.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        let outbound = value.get("outbound").unwrap_or(&value);
        let descriptor = OutboundDescriptor::from_outbound_json(outbound)?;

        let mode = match value.get("routingMode").and_then(Value::as_str) {
            Some(m) => RoutingMode::try_from(m)?,
            None => RoutingMode::Rule,
        };
        let rules = value
            .get("routingRules")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(ConnectRequest {
            descriptor,
            policy: RoutingPolicy { mode, rules },
        })
    }
}
