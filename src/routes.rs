//! Static prefix-to-key route tables.
//!
//! The fallback consulted when a packet's address is not part of the
//! overlay's native address space: an ordered longest-prefix-first list
//! per address family, mapping configured IP prefixes to the remote keys
//! that originate them. Built once at startup and read-only afterwards;
//! live reload is handled by tearing the datapath down and rebuilding it.

use std::net::IpAddr;

use anyhow::{Context, Result, bail};
use ipnet::IpNet;
use tracing::warn;

use crate::addr::PeerKey;
use crate::config::{RemoteSubnet, RoutingConfig};

/// A configured prefix and the key that carries it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    pub prefix: IpNet,
    pub key: PeerKey,
}

/// Longest-prefix-match tables for IPv4 and IPv6.
#[derive(Debug, Default)]
pub struct RouteTable {
    v4: Vec<Route>,
    v6: Vec<Route>,
}

impl RouteTable {
    /// Build the tables from configuration.
    ///
    /// Entries that fail to parse, carry a malformed key, or sit in the
    /// wrong family list are logged and skipped; the remaining routes
    /// still load. A disabled config produces empty tables.
    pub fn from_config(cfg: &RoutingConfig) -> Self {
        if !cfg.enable {
            return Self::default();
        }
        let v4 = parse_routes(&cfg.ipv4_remote_subnets, false);
        let v6 = parse_routes(&cfg.ipv6_remote_subnets, true);
        Self { v4, v6 }
    }

    /// The key of the most specific configured prefix containing `ip`.
    ///
    /// Duplicate prefixes resolve to the earliest configured entry.
    pub fn lookup(&self, ip: IpAddr) -> Option<&PeerKey> {
        let routes = match ip {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        };
        routes
            .iter()
            .find(|route| route.prefix.contains(&ip))
            .map(|route| &route.key)
    }

    /// Configured IPv4 routes, most specific first.
    pub fn v4_routes(&self) -> &[Route] {
        &self.v4
    }

    /// Configured IPv6 routes, most specific first.
    pub fn v6_routes(&self) -> &[Route] {
        &self.v6
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }
}

fn parse_routes(entries: &[RemoteSubnet], want_v6: bool) -> Vec<Route> {
    let mut routes = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_route(entry, want_v6) {
            Ok(route) => routes.push(route),
            Err(err) => {
                warn!(prefix = %entry.prefix, error = %err, "skipping invalid tunnel route");
            }
        }
    }
    // Stable sort keeps configuration order among equal prefix lengths,
    // so the first configured duplicate wins.
    routes.sort_by_key(|route| std::cmp::Reverse(route.prefix.prefix_len()));
    routes
}

fn parse_route(entry: &RemoteSubnet, want_v6: bool) -> Result<Route> {
    let prefix: IpNet = entry.prefix.parse().context("invalid CIDR prefix")?;
    match (&prefix, want_v6) {
        (IpNet::V4(_), true) => bail!("IPv4 prefix in the IPv6 route list"),
        (IpNet::V6(_), false) => bail!("IPv6 prefix in the IPv4 route list"),
        _ => {}
    }
    let key = PeerKey::from_hex(&entry.public_key).context("invalid public key hex")?;
    Ok(Route { prefix, key })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> String {
        hex::encode([fill; 32])
    }

    fn entry(prefix: &str, fill: u8) -> RemoteSubnet {
        RemoteSubnet {
            prefix: prefix.to_string(),
            public_key: key(fill),
        }
    }

    fn table(v4: Vec<RemoteSubnet>, v6: Vec<RemoteSubnet>) -> RouteTable {
        RouteTable::from_config(&RoutingConfig {
            enable: true,
            ipv4_remote_subnets: v4,
            ipv6_remote_subnets: v6,
        })
    }

    #[test]
    fn disabled_config_yields_empty_tables() {
        let cfg = RoutingConfig {
            enable: false,
            ipv4_remote_subnets: vec![entry("10.0.0.0/8", 1)],
            ipv6_remote_subnets: vec![],
        };
        let routes = RouteTable::from_config(&cfg);
        assert!(routes.is_empty());
        assert!(routes.lookup("10.1.2.3".parse().unwrap()).is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let routes = table(
            vec![entry("10.0.0.0/8", 1), entry("10.1.0.0/16", 2)],
            vec![],
        );
        let hit = routes.lookup("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(*hit, PeerKey::from_bytes([2; 32]));
        let hit = routes.lookup("10.2.0.1".parse().unwrap()).unwrap();
        assert_eq!(*hit, PeerKey::from_bytes([1; 32]));
    }

    #[test]
    fn duplicate_prefixes_resolve_to_first_configured() {
        let routes = table(
            vec![entry("192.168.0.0/16", 7), entry("192.168.0.0/16", 8)],
            vec![],
        );
        let hit = routes.lookup("192.168.1.1".parse().unwrap()).unwrap();
        assert_eq!(*hit, PeerKey::from_bytes([7; 32]));
    }

    #[test]
    fn families_are_separate() {
        let routes = table(
            vec![entry("10.0.0.0/8", 1)],
            vec![entry("fd00::/8", 2)],
        );
        assert!(routes.lookup("fd00::1".parse().unwrap()).is_some());
        assert!(routes.lookup("11.0.0.1".parse().unwrap()).is_none());
        assert_eq!(
            *routes.lookup("10.0.0.1".parse().unwrap()).unwrap(),
            PeerKey::from_bytes([1; 32])
        );
    }

    #[test]
    fn no_match_is_none() {
        let routes = table(vec![entry("10.0.0.0/8", 1)], vec![]);
        assert!(routes.lookup("172.16.0.1".parse().unwrap()).is_none());
        assert!(routes.lookup("fd00::1".parse().unwrap()).is_none());
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let routes = table(
            vec![
                entry("not-a-prefix", 1),
                RemoteSubnet {
                    prefix: "10.0.0.0/8".to_string(),
                    public_key: "zz".to_string(),
                },
                entry("fd00::/8", 3), // wrong family for the v4 list
                entry("172.16.0.0/12", 4),
            ],
            vec![],
        );
        assert_eq!(routes.v4_routes().len(), 1);
        assert_eq!(
            *routes.lookup("172.16.5.5".parse().unwrap()).unwrap(),
            PeerKey::from_bytes([4; 32])
        );
    }
}
