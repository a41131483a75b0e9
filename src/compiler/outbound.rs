//! Outbound rendering and protocol defaults

use super::sections::Outbound;
use crate::config::{OutboundDescriptor, StreamSettings};
use serde_json::{json, Map, Value};
use tracing::debug;

/// Tag of the outbound carrying proxied traffic
pub const PROXY_TAG: &str = "proxy";
/// Tag of the freedom outbound
pub const DIRECT_TAG: &str = "direct";
/// Tag of the blackhole outbound
pub const BLOCK_TAG: &str = "block";

/// How a protocol lays out its server entry in `settings`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerLayout {
    /// `vnext: [{address, port, users: [..]}]`
    Vnext,
    /// `servers: [{address, port, ..credentials}]`
    Servers,
    /// `{address, port, ..credentials}`
    Flat,
}

fn layout(protocol: &str) -> ServerLayout {
    match protocol {
        "vmess" | "vless" => ServerLayout::Vnext,
        "trojan" | "shadowsocks" | "socks" | "http" => ServerLayout::Servers,
        _ => ServerLayout::Flat,
    }
}

/// Map user-facing protocol aliases onto engine protocol names
pub fn normalize_protocol(protocol: &str) -> String {
    match protocol.trim().to_lowercase().as_str() {
        "ss" => "shadowsocks".to_string(),
        "socks5" => "socks".to_string(),
        "hy2" => "hysteria2".to_string(),
        other => other.to_string(),
    }
}

/// Fill in stream settings a protocol cannot work without.
///
/// Trojan always runs over TLS: missing `security`, `network` and
/// `tlsSettings` are set to `tls`, `tcp` and `{}`. Fields already present are
/// left alone.
pub fn apply_protocol_defaults(descriptor: &OutboundDescriptor) -> OutboundDescriptor {
    let mut descriptor = descriptor.clone();
    descriptor.protocol = normalize_protocol(&descriptor.protocol);

    if descriptor.protocol == "trojan" {
        let stream = descriptor.stream_settings.get_or_insert_with(StreamSettings::default);
        if stream.security.is_none() {
            stream.security = Some("tls".to_string());
        }
        if stream.network.is_none() {
            stream.network = Some("tcp".to_string());
        }
        if stream.tls_settings.is_none() {
            stream.tls_settings = Some(Value::Object(Map::new()));
        }
    }

    descriptor
}

/// Render the proxy outbound for an already defaulted descriptor
pub fn render_proxy(descriptor: &OutboundDescriptor) -> Outbound {
    let mut server = Map::new();
    server.insert("address".to_string(), json!(descriptor.address));
    server.insert("port".to_string(), json!(descriptor.port));

    let settings = match layout(&descriptor.protocol) {
        ServerLayout::Vnext => {
            let users = if descriptor.credentials.is_empty() {
                vec![]
            } else {
                vec![Value::Object(descriptor.credentials.clone())]
            };
            server.insert("users".to_string(), Value::Array(users));
            json!({ "vnext": [server] })
        }
        ServerLayout::Servers => {
            server.extend(descriptor.credentials.clone());
            json!({ "servers": [server] })
        }
        ServerLayout::Flat => {
            server.extend(descriptor.credentials.clone());
            Value::Object(server)
        }
    };

    if let Some(tag) = descriptor.tag.as_deref().filter(|t| *t != PROXY_TAG) {
        debug!("Outbound tag '{}' replaced by '{}'", tag, PROXY_TAG);
    }

    // Routing rules always target PROXY_TAG, so the descriptor's own tag is not kept
    Outbound {
        tag: PROXY_TAG.to_string(),
        protocol: descriptor.protocol.clone(),
        settings: Some(settings),
        stream_settings: descriptor.stream_settings.clone(),
    }
}

/// Direct egress resolving domains to IPs itself
pub fn direct() -> Outbound {
    Outbound {
        tag: DIRECT_TAG.to_string(),
        protocol: "freedom".to_string(),
        settings: Some(json!({ "domainStrategy": "UseIP" })),
        stream_settings: None,
    }
}

/// Drop everything
pub fn block() -> Outbound {
    Outbound {
        tag: BLOCK_TAG.to_string(),
        protocol: "blackhole".to_string(),
        settings: None,
        stream_settings: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trojan_defaults_injected() {
        let d = OutboundDescriptor::new("trojan", "tj.example.com", 443);
        let d = apply_protocol_defaults(&d);
        let stream = d.stream_settings.unwrap();
        assert_eq!(stream.security.as_deref(), Some("tls"));
        assert_eq!(stream.network.as_deref(), Some("tcp"));
        assert_eq!(stream.tls_settings, Some(json!({})));
    }

    #[test]
    fn test_trojan_defaults_keep_existing_fields() {
        let stream = StreamSettings {
            network: Some("ws".to_string()),
            ..Default::default()
        };
        let d = OutboundDescriptor::new("trojan", "tj.example.com", 443).with_stream_settings(stream);
        let stream = apply_protocol_defaults(&d).stream_settings.unwrap();
        assert_eq!(stream.network.as_deref(), Some("ws"));
        assert_eq!(stream.security.as_deref(), Some("tls"));
    }

    #[test]
    fn test_vmess_has_no_injected_stream() {
        let d = apply_protocol_defaults(&OutboundDescriptor::new("vmess", "1.2.3.4", 443));
        assert!(d.stream_settings.is_none());
    }

    #[test]
    fn test_render_vnext() {
        let d = OutboundDescriptor::new("vless", "v.example.com", 443).with_credential("id", "uuid-1");
        let out = render_proxy(&d);
        assert_eq!(out.tag, PROXY_TAG);
        let settings = out.settings.unwrap();
        assert_eq!(settings["vnext"][0]["address"], "v.example.com");
        assert_eq!(settings["vnext"][0]["users"][0]["id"], "uuid-1");
    }

    #[test]
    fn test_render_servers_and_alias() {
        let d = OutboundDescriptor::new("ss", "s.example.com", 8388)
            .with_credential("method", "aes-256-gcm")
            .with_credential("password", "pw");
        let d = apply_protocol_defaults(&d);
        let out = render_proxy(&d);
        assert_eq!(out.protocol, "shadowsocks");
        let settings = out.settings.unwrap();
        assert_eq!(settings["servers"][0]["port"], 8388);
        assert_eq!(settings["servers"][0]["method"], "aes-256-gcm");
    }

    #[test]
    fn test_render_forces_proxy_tag() {
        let mut d = OutboundDescriptor::new("hysteria2", "h.example.com", 443);
        d.tag = Some("hy".to_string());
        let out = render_proxy(&d);
        assert_eq!(out.tag, PROXY_TAG);
        assert_eq!(out.settings.unwrap()["address"], "h.example.com");
    }
}
