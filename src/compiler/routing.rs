//! Routing rule chain and DNS layout
//!
//! Rule precedence (first match wins in the engine):
//!
//! ```text
//! 1. descriptor address          -> direct   (loop break)
//! 2. public resolvers            -> direct
//! 3. mode block                  -> direct   (private/LAN, custom or country rules)
//! 4. network tcp,udp             -> proxy    (catch-all)
//! ```

use super::outbound::{DIRECT_TAG, PROXY_TAG};
use super::sections::{DnsSection, DnsServer, FieldRule, RoutingRule, SplitResolver};
use super::GeoAssets;
use crate::config::{OutboundDescriptor, RoutingMode, RoutingPolicy};
use tracing::debug;

/// Resolver used for domestic names and for the proxy server itself
pub const DOMESTIC_RESOLVER: &str = "223.5.5.5";

/// Foreign resolvers; always routed direct
pub const PUBLIC_RESOLVERS: [&str; 2] = ["8.8.8.8", "1.1.1.1"];

/// Private and special-use ranges bypassed without a geoip dataset
pub const PRIVATE_CIDRS: [&str; 9] = [
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// LAN names bypassed without a geosite dataset
pub const PRIVATE_DOMAINS: [&str; 3] = ["localhost", "domain:local", "domain:lan"];

/// Catch-all network match
pub const CATCH_ALL_NETWORK: &str = "tcp,udp";

/// Direct rule for the proxy server's own address.
///
/// Without it, traffic to the server (including resolving its hostname)
/// would be routed into the proxy outbound, which needs that very server.
pub fn loop_break_rule(descriptor: &OutboundDescriptor) -> Option<RoutingRule> {
    if descriptor.address.is_empty() {
        return None;
    }
    let rule = match descriptor.ip_address() {
        Some(ip) => FieldRule::ips(DIRECT_TAG, [ip.to_string()]),
        None => FieldRule::domains(DIRECT_TAG, [descriptor.address.clone()]),
    };
    Some(RoutingRule::Field(rule))
}

pub fn resolver_bypass_rule() -> RoutingRule {
    RoutingRule::Field(FieldRule::ips(DIRECT_TAG, PUBLIC_RESOLVERS))
}

/// Private/LAN bypass pair: domain rule, then IP rule
pub fn private_bypass_rules(geo: &GeoAssets) -> [RoutingRule; 2] {
    let domain = if geo.geosite {
        FieldRule::domains(DIRECT_TAG, ["geosite:private"])
    } else {
        FieldRule::domains(DIRECT_TAG, PRIVATE_DOMAINS)
    };
    let ip = if geo.geoip {
        FieldRule::ips(DIRECT_TAG, ["geoip:private"])
    } else {
        FieldRule::ips(DIRECT_TAG, PRIVATE_CIDRS)
    };
    [RoutingRule::Field(domain), RoutingRule::Field(ip)]
}

/// Country-level bypass, each rule present only with its dataset
pub fn country_bypass_rules(geo: &GeoAssets) -> Vec<RoutingRule> {
    let mut rules = Vec::new();
    if geo.geosite {
        rules.push(RoutingRule::Field(FieldRule::domains(DIRECT_TAG, ["geosite:cn"])));
    }
    if geo.geoip {
        rules.push(RoutingRule::Field(FieldRule::ips(DIRECT_TAG, ["geoip:cn"])));
    }
    rules
}

pub fn catch_all_rule() -> RoutingRule {
    RoutingRule::Field(FieldRule::network(PROXY_TAG, CATCH_ALL_NETWORK))
}

/// Build the complete rule chain
pub fn build_rules(
    descriptor: &OutboundDescriptor,
    policy: &RoutingPolicy,
    geo: &GeoAssets,
) -> Vec<RoutingRule> {
    let mut rules = Vec::new();

    rules.extend(loop_break_rule(descriptor));
    rules.push(resolver_bypass_rule());

    match policy.mode {
        RoutingMode::Global => {
            rules.extend(private_bypass_rules(geo));
        }
        RoutingMode::Rule if !policy.rules.is_empty() => {
            debug!("Applying {} custom routing rules", policy.rules.len());
            rules.extend(policy.rules.iter().cloned().map(RoutingRule::Custom));
        }
        RoutingMode::Rule => {
            debug!("Applying default routing rules");
            rules.extend(private_bypass_rules(geo));
            rules.extend(country_bypass_rules(geo));
        }
    }

    rules.push(catch_all_rule());
    rules
}

/// DNS: domestic resolver for domestic names and the server itself, then
/// the public resolvers, then the system resolver.
pub fn build_dns(descriptor: &OutboundDescriptor, geo: &GeoAssets) -> DnsSection {
    let mut domains = Vec::new();
    if geo.geosite {
        domains.push("geosite:cn".to_string());
    }
    if !descriptor.address.is_empty() {
        domains.push(descriptor.address.clone());
    }
    let expect_ips = if geo.geoip {
        vec!["geoip:cn".to_string()]
    } else {
        Vec::new()
    };

    let mut servers = vec![DnsServer::Split(SplitResolver {
        address: DOMESTIC_RESOLVER.to_string(),
        domains,
        expect_ips,
    })];
    servers.extend(PUBLIC_RESOLVERS.iter().map(|s| DnsServer::Address(s.to_string())));
    servers.push(DnsServer::Address("localhost".to_string()));

    DnsSection {
        query_strategy: "UseIPv4".to_string(),
        servers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_geo() -> GeoAssets {
        GeoAssets::default()
    }

    fn all_geo() -> GeoAssets {
        GeoAssets { geoip: true, geosite: true }
    }

    #[test]
    fn test_loop_break_ip_vs_domain() {
        let ip = loop_break_rule(&OutboundDescriptor::new("vmess", "203.0.113.9", 443)).unwrap();
        assert_eq!(ip.as_field().unwrap().ip, Some(vec!["203.0.113.9".to_string()]));

        let host = loop_break_rule(&OutboundDescriptor::new("vmess", "node.example.com", 443)).unwrap();
        assert_eq!(host.as_field().unwrap().domain, Some(vec!["node.example.com".to_string()]));
    }

    #[test]
    fn test_loop_break_skipped_without_address() {
        assert!(loop_break_rule(&OutboundDescriptor::new("vmess", "", 443)).is_none());
    }

    #[test]
    fn test_private_bypass_uses_literals_without_geo() {
        let [domain, ip] = private_bypass_rules(&no_geo());
        assert!(domain.as_field().unwrap().domain.as_ref().unwrap().contains(&"localhost".to_string()));
        assert!(ip.as_field().unwrap().ip.as_ref().unwrap().contains(&"192.168.0.0/16".to_string()));
    }

    #[test]
    fn test_private_bypass_uses_geo_when_present() {
        let [domain, ip] = private_bypass_rules(&all_geo());
        assert_eq!(domain.as_field().unwrap().domain, Some(vec!["geosite:private".to_string()]));
        assert_eq!(ip.as_field().unwrap().ip, Some(vec!["geoip:private".to_string()]));
    }

    #[test]
    fn test_country_rules_gated_per_dataset() {
        assert!(country_bypass_rules(&no_geo()).is_empty());
        let only_ip = GeoAssets { geoip: true, geosite: false };
        let rules = country_bypass_rules(&only_ip);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].as_field().unwrap().ip, Some(vec!["geoip:cn".to_string()]));
        assert_eq!(country_bypass_rules(&all_geo()).len(), 2);
    }

    #[test]
    fn test_rule_mode_with_geo_adds_country_rules() {
        let d = OutboundDescriptor::new("vmess", "203.0.113.9", 443);
        let rules = build_rules(&d, &RoutingPolicy::rule(), &all_geo());
        // loop break, resolvers, private x2, country x2, catch-all
        assert_eq!(rules.len(), 7);
        assert_eq!(rules.last(), Some(&catch_all_rule()));
    }

    #[test]
    fn test_custom_rules_replace_defaults() {
        let d = OutboundDescriptor::new("vmess", "203.0.113.9", 443);
        let custom = vec![json!({"type": "field", "outboundTag": "block", "domain": ["ads.example"]})];
        let rules = build_rules(&d, &RoutingPolicy::rule().with_rules(custom.clone()), &all_geo());
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[2], RoutingRule::Custom(custom[0].clone()));
    }

    #[test]
    fn test_global_mode_ignores_custom_rules() {
        let d = OutboundDescriptor::new("vmess", "203.0.113.9", 443);
        let custom = vec![json!({"type": "field", "outboundTag": "block", "domain": ["ads.example"]})];
        let rules = build_rules(&d, &RoutingPolicy::global().with_rules(custom), &all_geo());
        assert_eq!(rules.len(), 5);
        assert!(rules.iter().all(|r| matches!(r, RoutingRule::Field(_))));
    }

    #[test]
    fn test_dns_appends_server_hostname() {
        let d = OutboundDescriptor::new("trojan", "tj.example.com", 443);
        let dns = build_dns(&d, &all_geo());
        match &dns.servers[0] {
            DnsServer::Split(s) => {
                assert_eq!(s.address, DOMESTIC_RESOLVER);
                assert_eq!(s.domains, vec!["geosite:cn".to_string(), "tj.example.com".to_string()]);
                assert_eq!(s.expect_ips, vec!["geoip:cn".to_string()]);
            }
            other => panic!("unexpected first server: {:?}", other),
        }
        assert_eq!(dns.servers.last().unwrap().address(), "localhost");
    }

    #[test]
    fn test_dns_keeps_domestic_resolver_without_geo() {
        let d = OutboundDescriptor::new("vmess", "203.0.113.9", 443);
        let dns = build_dns(&d, &no_geo());
        let addrs: Vec<&str> = dns.servers.iter().map(DnsServer::address).collect();
        assert_eq!(addrs, vec![DOMESTIC_RESOLVER, "8.8.8.8", "1.1.1.1", "localhost"]);
        match &dns.servers[0] {
            DnsServer::Split(s) => {
                assert_eq!(s.domains, vec!["203.0.113.9".to_string()]);
                assert!(s.expect_ips.is_empty());
            }
            other => panic!("unexpected first server: {:?}", other),
        }
    }
}
